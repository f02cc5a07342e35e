//! Cooperative cancellation for one run.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::{AbortReason, EngineAbortError};

/// Cancellation state shared between a run and its handle.
#[derive(Clone, Debug)]
pub struct RunContext {
    pub run_id: String,
    cancellation_token: CancellationToken,
    timeout_duration: Option<Duration>,
    started_at: Instant,
    timed_out: Arc<AtomicBool>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            run_id: run_id.into(),
            cancellation_token: CancellationToken::new(),
            timeout_duration: timeout,
            started_at: Instant::now(),
            timed_out: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
            || self.timeout_duration.map(|t| self.elapsed() >= t).unwrap_or(false)
    }

    /// Token cancelled together with this run.
    pub fn child_token(&self) -> CancellationToken {
        self.cancellation_token.child_token()
    }

    /// Why the run must stop, if it must.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        if self.is_timed_out() {
            Some(AbortReason::RunTimeout)
        } else if self.is_cancelled() {
            Some(AbortReason::Cancelled)
        } else {
            None
        }
    }

    pub fn abort_error(&self, reason: AbortReason, step_id: Option<&str>) -> EngineAbortError {
        EngineAbortError {
            run_id: self.run_id.clone(),
            reason,
            step_id: step_id.map(str::to_string),
        }
    }

    /// Fails if the run has been cancelled or has exceeded its deadline.
    pub fn checkpoint(&self, step_id: Option<&str>) -> Result<(), EngineAbortError> {
        match self.abort_reason() {
            Some(reason) => Err(self.abort_error(reason, step_id)),
            None => Ok(()),
        }
    }

    /// Starts the deadline timer. Must be called from inside the run's runtime.
    pub fn arm_timeout(&self) {
        let Some(timeout) = self.timeout_duration else {
            return;
        };
        let remaining = timeout.saturating_sub(self.elapsed());
        let context = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = context.cancellation_token.cancelled() => {}
                _ = tokio::time::sleep(remaining) => {
                    warn!("Run {} timed out after {:?}", context.run_id, timeout);
                    context.timed_out.store(true, Ordering::SeqCst);
                    context.cancel();
                }
            }
        });
    }

    /// Sleeps for `duration`, waking early on cancellation.
    pub async fn sleep(&self, duration: Duration) -> Result<(), AbortReason> {
        if duration.is_zero() {
            return self.abort_reason().map_or(Ok(()), Err);
        }
        self.with_cancellation(tokio::time::sleep(duration)).await?;
        self.abort_reason().map_or(Ok(()), Err)
    }

    /// Runs `operation` unless the run is cancelled first.
    pub async fn with_cancellation<F, T>(&self, operation: F) -> Result<T, AbortReason>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            result = operation => Ok(result),
            _ = self.cancellation_token.cancelled() => {
                Err(self.abort_reason().unwrap_or(AbortReason::Cancelled))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_wakes_on_cancel() {
        let ctx = RunContext::new("r", None);
        let other = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            other.cancel();
        });
        let started = Instant::now();
        assert_eq!(ctx.sleep(Duration::from_secs(30)).await, Err(AbortReason::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn deadline_reports_run_timeout() {
        let ctx = RunContext::new("r", Some(Duration::from_millis(30)));
        ctx.arm_timeout();
        assert_eq!(ctx.sleep(Duration::from_secs(30)).await, Err(AbortReason::RunTimeout));
        let err = ctx.checkpoint(Some("s1")).unwrap_err();
        assert_eq!(err.reason, AbortReason::RunTimeout);
        assert_eq!(err.step_id.as_deref(), Some("s1"));
    }

    #[test]
    fn checkpoint_passes_while_live() {
        let ctx = RunContext::new("r", None);
        assert!(ctx.checkpoint(None).is_ok());
        ctx.cancel();
        assert_eq!(ctx.abort_reason(), Some(AbortReason::Cancelled));
        assert!(ctx.child_token().is_cancelled());
    }
}
