//! Connection bootstrap for the engine's PostgreSQL backend.
//!
//! One shared `PgPool` backs every session lease of the session pool, so
//! the connection ceiling is derived from the session configuration
//! instead of being a fixed constant. The task-table migrations ship
//! inside this crate and are loaded at runtime, so no running database
//! is required at compile time (unlike the `sqlx::migrate!()` macro).

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Migrations directory shipped with this crate, resolved at compile
/// time relative to crates/taskforge-db/.
const MIGRATIONS_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/migrations");

/// Connections held by the shared pool.
///
/// A leased session only borrows a connection per statement, so sessions
/// can outnumber connections by an order of magnitude; the ceiling still
/// scales with the configured session limit.
fn connection_ceiling(config: &DbConfig) -> u32 {
    (config.max_sessions / 10).clamp(5, 16) as u32
}

/// Connect the shared pool for a configuration.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(connection_ceiling(config))
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))?;
    Ok(pool)
}

/// Bring the task schema up to date from the migrations shipped with
/// this crate.
pub async fn apply_migrations(pool: &PgPool) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(Path::new(MIGRATIONS_DIR))
        .await
        .context("failed to load task-table migrations")?;

    migrator
        .run(pool)
        .await
        .context("failed to apply task-table migrations")?;

    info!("task-table migrations applied");
    Ok(())
}

/// Engine startup path: make sure the configured database exists,
/// connect the shared pool, and apply the task-table migrations.
pub async fn bootstrap(config: &DbConfig) -> Result<PgPool> {
    ensure_database_exists(config).await?;
    let pool = create_pool(config).await?;
    apply_migrations(&pool).await?;
    Ok(pool)
}

/// Ensure the target database exists, creating it when absent.
///
/// Issues `CREATE DATABASE <name>` through the `postgres` maintenance
/// database on the same host.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let db_name = config
        .database_name()
        .context("could not determine database name from URL")?;
    validate_database_name(db_name)?;

    let maintenance_url = config.maintenance_url();
    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&maintenance_url)
        .await
        .with_context(|| {
            format!("failed to connect to maintenance database at {maintenance_url}")
        })?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(&maint_pool)
            .await
            .context("failed to query pg_database")?;

    if exists {
        info!(db = db_name, "database already exists");
    } else {
        // Validated above, so interpolating into CREATE DATABASE (which
        // cannot take a bound parameter) is safe.
        let stmt = format!("CREATE DATABASE {db_name}");
        maint_pool
            .execute(stmt.as_str())
            .await
            .with_context(|| format!("failed to create database {db_name}"))?;
        info!(db = db_name, "database created");
    }

    maint_pool.close().await;
    Ok(())
}

/// Database names end up interpolated into `CREATE DATABASE`, so they
/// must stay within a strict identifier alphabet.
fn validate_database_name(name: &str) -> Result<()> {
    let starts_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let rest_ok = name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !starts_ok || !rest_ok {
        bail!("database name {name:?} is not a plain identifier");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_identifiers_accepted() {
        for name in ["taskforge", "task_forge", "_scratch", "db2"] {
            validate_database_name(name).unwrap_or_else(|e| panic!("{name}: {e}"));
        }
    }

    #[test]
    fn hostile_names_rejected() {
        for name in ["", "2fast", "task-forge", "db;DROP TABLE tasks", "a b"] {
            assert!(
                validate_database_name(name).is_err(),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn connection_ceiling_scales_with_session_limit() {
        let mut config = DbConfig::new("postgresql://localhost:5432/t");

        config.max_sessions = 1;
        assert_eq!(connection_ceiling(&config), 5, "small limits get the floor");

        config.max_sessions = 50;
        assert_eq!(connection_ceiling(&config), 5, "default stays modest");

        config.max_sessions = 120;
        assert_eq!(connection_ceiling(&config), 12);

        config.max_sessions = 1000;
        assert_eq!(connection_ceiling(&config), 16, "capped");
    }
}
