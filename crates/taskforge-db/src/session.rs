//! Bounded session pool over one shared connection factory.
//!
//! Every top-level task-tree execution borrows exactly one [`Session`] for
//! its whole run. Leases are counted against `max_sessions` and stamped
//! with their creation time; stale leases are swept before each new
//! acquisition. Dropping a session releases its lease on every exit path,
//! including panics and cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DbConfig;

/// Error returned when the pool is at its session ceiling.
#[derive(Debug, Clone, Error)]
#[error(
    "maximum session limit ({max}) exceeded: {active} sessions currently active; \
     wait for a running task tree to finish"
)]
pub struct SessionLimitExceeded {
    pub active: usize,
    pub max: usize,
}

#[derive(Default)]
struct LeaseTable {
    active: HashMap<u64, Instant>,
    next_id: u64,
}

/// Bounded pool of database sessions sharing one `PgPool`.
pub struct SessionPool {
    pg: PgPool,
    leases: Mutex<LeaseTable>,
    max_sessions: usize,
    session_timeout: Duration,
}

impl SessionPool {
    /// Build a pool around an already-connected `PgPool`.
    pub fn new(pg: PgPool, config: &DbConfig) -> Arc<Self> {
        Arc::new(Self {
            pg,
            leases: Mutex::new(LeaseTable::default()),
            max_sessions: config.max_sessions,
            session_timeout: config.session_timeout,
        })
    }

    /// Lease a new session.
    ///
    /// Sweeps leases older than the session timeout first, then fails with
    /// [`SessionLimitExceeded`] when the ceiling is reached. The returned
    /// [`Session`] releases its lease when dropped.
    pub fn create_session(self: &Arc<Self>) -> Result<Session, SessionLimitExceeded> {
        let mut leases = self.leases.lock().expect("session lease lock poisoned");

        // Sweep expired leases before counting.
        let timeout = self.session_timeout;
        let before = leases.active.len();
        leases.active.retain(|id, created_at| {
            let expired = created_at.elapsed() > timeout;
            if expired {
                warn!(session_id = id, timeout_secs = timeout.as_secs(), "force-closing expired session lease");
            }
            !expired
        });
        let swept = before - leases.active.len();
        if swept > 0 {
            debug!(swept, "swept expired session leases");
        }

        let active = leases.active.len();
        if active >= self.max_sessions {
            warn!(active, max = self.max_sessions, "session limit exceeded");
            return Err(SessionLimitExceeded {
                active,
                max: self.max_sessions,
            });
        }

        leases.next_id += 1;
        let id = leases.next_id;
        leases.active.insert(id, Instant::now());
        debug!(
            session_id = id,
            active = leases.active.len(),
            max = self.max_sessions,
            "created session"
        );

        Ok(Session {
            pool: Arc::clone(self),
            id,
            pg: self.pg.clone(),
        })
    }

    /// Release a session explicitly. Equivalent to dropping it.
    pub fn release_session(session: Session) {
        drop(session);
    }

    /// Current number of active leases.
    pub fn active_session_count(&self) -> usize {
        self.leases
            .lock()
            .expect("session lease lock poisoned")
            .active
            .len()
    }

    /// The configured session ceiling.
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    fn release_id(&self, id: u64) {
        let mut leases = self.leases.lock().expect("session lease lock poisoned");
        // Absent when the lease was already swept as expired.
        if leases.active.remove(&id).is_some() {
            debug!(
                session_id = id,
                active = leases.active.len(),
                "released session"
            );
        }
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("active", &self.active_session_count())
            .field("max_sessions", &self.max_sessions)
            .field("session_timeout", &self.session_timeout)
            .finish()
    }
}

/// A leased database session.
///
/// All repository calls of one task-tree run go through this handle's
/// `PgPool`. The lease is returned to the pool on drop.
pub struct Session {
    pool: Arc<SessionPool>,
    id: u64,
    pg: PgPool,
}

impl Session {
    /// The shared connection handle backing this session.
    pub fn pool(&self) -> &PgPool {
        &self.pg
    }

    /// Lease id, for logging.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.pool.release_id(self.id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(max_sessions: usize, timeout: Duration) -> Arc<SessionPool> {
        let mut config = DbConfig::new("postgresql://localhost:5432/unused");
        config.max_sessions = max_sessions;
        config.session_timeout = timeout;
        // Lazy pools never connect until used, so no database is needed here.
        let pg = PgPool::connect_lazy(&config.database_url).expect("lazy pool");
        SessionPool::new(pg, &config)
    }

    #[tokio::test]
    async fn lease_and_release() {
        let pool = test_pool(2, Duration::from_secs(60));
        let s1 = pool.create_session().expect("first session");
        assert_eq!(pool.active_session_count(), 1);
        drop(s1);
        assert_eq!(pool.active_session_count(), 0);
    }

    #[tokio::test]
    async fn limit_rejects_next_acquisition() {
        let pool = test_pool(2, Duration::from_secs(60));
        let _s1 = pool.create_session().expect("first");
        let _s2 = pool.create_session().expect("second");

        let err = pool.create_session().expect_err("third should fail");
        assert_eq!(err.active, 2);
        assert_eq!(err.max, 2);
        assert!(err.to_string().contains("maximum session limit (2)"));
    }

    #[tokio::test]
    async fn release_frees_a_slot() {
        let pool = test_pool(1, Duration::from_secs(60));
        let s1 = pool.create_session().expect("first");
        assert!(pool.create_session().is_err());
        SessionPool::release_session(s1);
        assert!(pool.create_session().is_ok());
    }

    #[tokio::test]
    async fn expired_leases_are_swept() {
        let pool = test_pool(1, Duration::from_millis(10));
        let stale = pool.create_session().expect("first");
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The stale lease no longer counts against the ceiling.
        let fresh = pool.create_session().expect("sweep should free the slot");
        assert_eq!(pool.active_session_count(), 1);

        // Dropping the swept session must not disturb the fresh lease.
        drop(stale);
        assert_eq!(pool.active_session_count(), 1);
        drop(fresh);
        assert_eq!(pool.active_session_count(), 0);
    }

    #[tokio::test]
    async fn guard_releases_on_panic() {
        let pool = test_pool(1, Duration::from_secs(60));
        let pool_clone = Arc::clone(&pool);
        let result = tokio::spawn(async move {
            let _session = pool_clone.create_session().expect("session");
            panic!("boom");
        })
        .await;
        assert!(result.is_err());
        assert_eq!(pool.active_session_count(), 0);
    }
}
