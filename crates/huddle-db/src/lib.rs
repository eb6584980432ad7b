//! Persistence layer for huddle: row types, connection pool, migrations,
//! and query helpers for event session snapshots.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
