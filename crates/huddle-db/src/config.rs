use std::env;

/// Database configuration.
///
/// Reads from the `HUDDLE_DATABASE_URL` environment variable, falling back to
/// `postgresql://localhost:5432/huddle` when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL.
    pub database_url: String,
}

impl DbConfig {
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/huddle";

    /// Environment variable consulted by [`Self::from_env`].
    pub const ENV_VAR: &str = "HUDDLE_DATABASE_URL";

    pub fn from_env() -> Self {
        let database_url =
            env::var(Self::ENV_VAR).unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        Self { database_url }
    }

    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// The database name: the last path segment of the URL, without any
    /// query string.
    pub fn database_name(&self) -> Option<&str> {
        let without_query = self
            .database_url
            .split('?')
            .next()
            .unwrap_or(&self.database_url);
        without_query
            .rsplit_once('/')
            .map(|(_, name)| name)
            .filter(|s| !s.is_empty())
    }

    /// URL of the `postgres` maintenance database on the same server, used to
    /// issue `CREATE DATABASE`.
    pub fn maintenance_url(&self) -> String {
        self.with_database("postgres")
    }

    /// Same server, different database.
    pub fn with_database(&self, name: &str) -> String {
        match self.database_url.rfind('/') {
            Some(pos) => format!("{}/{name}", &self.database_url[..pos]),
            None => self.database_url.clone(),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
