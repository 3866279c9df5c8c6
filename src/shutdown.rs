//! Process-wide shutdown signal.
//!
//! A single cancellation token is threaded through every long-running call.
//! Sleeps are implemented as "wait on the token for up to D" and surface the
//! `ShuttingDown` sentinel when the token fires, so workers unwind promptly
//! instead of finishing a multi-minute poll cycle first.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Sentinel raised by waits when the shutdown signal fires.
///
/// Callers treat this as a cooperative return, not a failure.
#[derive(Debug, Clone, Copy, Error)]
#[error("shutting down")]
pub struct ShuttingDown;

/// Cheap-to-clone handle on the process-wide shutdown token.
#[derive(Clone)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Set the signal. Idempotent; every clone observes it.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail fast at loop tops and between pipeline stages.
    pub fn check(&self) -> Result<(), ShuttingDown> {
        if self.token.is_cancelled() {
            Err(ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Resolve when the signal fires. Used inside `tokio::select!`.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Sleep for `duration`, waking early with `Err(ShuttingDown)` if the
    /// signal fires first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ShuttingDown> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ShuttingDown),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// True when `err` is (or wraps) the shutdown sentinel anywhere in its chain.
/// Callers convert such errors into a clean cooperative return.
pub fn is_shutdown_error(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<ShuttingDown>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_completes_when_not_cancelled() {
        let shutdown = Shutdown::new();
        assert!(shutdown.sleep(Duration::from_millis(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_trigger() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(60)).await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        shutdown.trigger();

        let result = handle.await.unwrap();
        assert!(result.is_err(), "sleep should return the shutdown sentinel");
    }

    #[test]
    fn test_check_reflects_trigger() {
        let shutdown = Shutdown::new();
        assert!(shutdown.check().is_ok());
        shutdown.trigger();
        assert!(shutdown.check().is_err());
        assert!(shutdown.is_shutting_down());
    }

    #[test]
    fn test_is_shutdown_error_sees_through_context() {
        let err = anyhow::Error::new(ShuttingDown).context("while importing");
        assert!(is_shutdown_error(&err));

        let plain = anyhow::anyhow!("connection refused");
        assert!(!is_shutdown_error(&plain));
    }

    #[test]
    fn test_clones_share_state() {
        let a = Shutdown::new();
        let b = a.clone();
        a.trigger();
        assert!(b.is_shutting_down());
    }
}
