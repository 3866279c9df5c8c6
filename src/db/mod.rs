//! Postgres access layer.
//!
//! One shared `PgPool` for the whole process; every statement acquires and
//! releases a connection. Mutations go through `with_retry`, which survives
//! transient connection/timeout errors with jittered exponential backoff and
//! lets the shutdown signal pre-empt the sleeps.

pub mod migrate;
pub mod schema;
pub mod tracking;

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Settings;
use crate::shutdown::Shutdown;

/// Attempts per statement before the error propagates.
const MAX_DB_ATTEMPTS: u32 = 10;

/// First backoff; doubles per attempt, capped at 10 s.
const BASE_BACKOFF_SECS: f64 = 0.25;

pub async fn connect(settings: &Settings) -> Result<PgPool> {
    let max = settings.postgres_pool_size + settings.postgres_max_overflow;
    let pool = PgPoolOptions::new()
        .max_connections(max)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&settings.postgres_dsn)
        .await
        .context("connecting to postgres")?;
    tracing::info!("postgres pool ready (max_connections={})", max);
    Ok(pool)
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BASE_BACKOFF_SECS * 2f64.powi(attempt as i32);
    let jitter = 0.5 + rand::thread_rng().gen::<f64>() * 0.5;
    Duration::from_secs_f64((base * jitter).min(10.0))
}

/// Run `op` until it succeeds or the attempt budget is spent. The statement
/// must be idempotent — every tracking mutation and the gated merge are.
pub async fn with_retry<T, F, Fut>(what: &str, shutdown: &Shutdown, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0u32;
    loop {
        shutdown.check()?;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_DB_ATTEMPTS {
                    return Err(anyhow::Error::new(e)
                        .context(format!("{what} failed after {attempt} attempts")));
                }
                let delay = backoff_delay(attempt - 1);
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {:.2}s: {}",
                    what,
                    attempt,
                    MAX_DB_ATTEMPTS,
                    delay.as_secs_f64(),
                    e
                );
                shutdown.sleep(delay).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        for attempt in 0..MAX_DB_ATTEMPTS {
            let base = BASE_BACKOFF_SECS * 2f64.powi(attempt as i32);
            let d = backoff_delay(attempt).as_secs_f64();
            assert!(d >= (base * 0.5).min(10.0) - f64::EPSILON);
            assert!(d <= base.min(10.0) + f64::EPSILON);
        }
    }

    #[tokio::test]
    async fn test_with_retry_returns_first_success() {
        let shutdown = Shutdown::new();
        let mut calls = 0;
        let result: Result<i32> = with_retry("op", &shutdown, || {
            calls += 1;
            async move { Ok::<_, sqlx::Error>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_shutdown() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let result: Result<i32> = with_retry("op", &shutdown, || async {
            Ok::<_, sqlx::Error>(1)
        })
        .await;
        let err = result.unwrap_err();
        assert!(crate::shutdown::is_shutdown_error(&err));
    }
}
