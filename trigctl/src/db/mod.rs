//! Database layer: pool construction, embedded migrations, and repositories.

pub mod errors;
pub mod handlers;
pub mod models;

use std::time::Duration;

use rand::Rng;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::warn;

use crate::config::DatabaseConfig;
use errors::DbError;

/// Get the trigctl database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Connect the main pool with the configured sizing.
pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool.max_connections)
        .min_connections(config.pool.min_connections)
        .acquire_timeout(Duration::from_secs(config.pool.acquire_timeout_secs))
        .idle_timeout(if config.pool.idle_timeout_secs > 0 {
            Some(Duration::from_secs(config.pool.idle_timeout_secs))
        } else {
            None
        })
        .max_lifetime(if config.pool.max_lifetime_secs > 0 {
            Some(Duration::from_secs(config.pool.max_lifetime_secs))
        } else {
            None
        })
        .connect(&config.url)
        .await?;
    Ok(pool)
}

/// Base backoff between transient-failure retries; each attempt adds jitter
/// so deadlocked writers do not retry in lockstep.
const RETRY_BACKOFF_MS: u64 = 50;
const RETRY_JITTER_MS: u64 = 50;

/// Run a database operation, retrying deadlocks and serialization failures
/// a bounded number of times before giving up.
pub async fn with_transient_retry<T, F, Fut>(
    operation: &str,
    max_attempts: u32,
    mut f: F,
) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let jitter = rand::thread_rng().gen_range(0..RETRY_JITTER_MS);
                let backoff = RETRY_BACKOFF_MS * u64::from(attempt) + jitter;
                warn!(
                    operation,
                    attempt,
                    backoff_ms = backoff,
                    "Transient database failure, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            Err(err) if err.is_transient() => {
                return Err(DbError::Other(anyhow::anyhow!(
                    "{operation} failed after {attempt} attempts: {err}"
                )));
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> DbError {
        DbError::Transient {
            code: "40P01".to_string(),
            message: "deadlock detected".to_string(),
        }
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_transient_retry("test", 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_become_permanent() {
        let result: Result<(), _> =
            with_transient_retry("test", 2, || async { Err(transient()) }).await;
        let err = result.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("after 2 attempts"));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_transient_retry("test", 5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DbError::NotFound) }
        })
        .await;
        assert!(matches!(result, Err(DbError::NotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
