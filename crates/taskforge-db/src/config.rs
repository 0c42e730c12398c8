use std::env;
use std::time::Duration;

/// Database and session-pool configuration.
///
/// Reads from `TASKFORGE_DATABASE_URL`, `TASKFORGE_MAX_SESSIONS`, and
/// `TASKFORGE_SESSION_TIMEOUT`, falling back to compiled-in defaults.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL.
    pub database_url: String,
    /// Ceiling on concurrently leased sessions.
    pub max_sessions: usize,
    /// Age after which an unreleased session lease is force-closed.
    pub session_timeout: Duration,
}

impl DbConfig {
    /// The default connection URL used when no environment variable is set.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/taskforge";

    /// Default session-pool ceiling.
    pub const DEFAULT_MAX_SESSIONS: usize = 50;

    /// Default stale-session eviction age.
    pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(1800);

    /// Build a config from the environment.
    ///
    /// Unparseable numeric values fall back to the defaults.
    pub fn from_env() -> Self {
        let database_url =
            env::var("TASKFORGE_DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        let max_sessions = env::var("TASKFORGE_MAX_SESSIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Self::DEFAULT_MAX_SESSIONS);
        let session_timeout = env::var("TASKFORGE_SESSION_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Self::DEFAULT_SESSION_TIMEOUT);
        Self {
            database_url,
            max_sessions,
            session_timeout,
        }
    }

    /// Build a config from an explicit URL (useful for tests).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_sessions: Self::DEFAULT_MAX_SESSIONS,
            session_timeout: Self::DEFAULT_SESSION_TIMEOUT,
        }
    }

    /// Extract the database name from the URL.
    ///
    /// Returns `None` if the URL cannot be parsed or has no path component.
    pub fn database_name(&self) -> Option<&str> {
        // URLs look like: postgresql://host:port/dbname
        self.database_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
    }

    /// Return a URL pointing at the `postgres` maintenance database on the
    /// same host, used to issue `CREATE DATABASE` when the target database
    /// does not yet exist.
    pub fn maintenance_url(&self) -> String {
        match self.database_url.rfind('/') {
            Some(pos) => {
                let mut url = self.database_url[..pos].to_owned();
                url.push_str("/postgres");
                url
            }
            None => self.database_url.clone(),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
