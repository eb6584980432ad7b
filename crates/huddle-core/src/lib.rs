//! Group consensus engine: collects participant preferences for a planned
//! gathering under a quorum/deadline policy and ranks candidate activities.

pub mod collector;
pub mod engine;
pub mod error;
pub mod ranker;
pub mod session;
pub mod store;
pub mod validate;

pub use engine::{ConsensusEngine, EngineConfig};
pub use error::{EngineError, StateError, SubmissionError, ValidationError};
