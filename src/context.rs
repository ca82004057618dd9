//! Caller-owned cancellation signal with an optional deadline.
//!
//! Every limiter and backend operation takes a `&Context`. Operations check it
//! before touching any state and race their network I/O against it, so a
//! cancelled or expired context aborts the call with [`ThrottleError::Cancelled`]
//! or [`ThrottleError::Timeout`].

use crate::error::{Result, ThrottleError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Clone, Debug)]
pub struct Context {
    trigger: Arc<watch::Sender<bool>>,
    cancelled: watch::Receiver<bool>,
    deadline: Option<(Instant, Duration)>,
}

impl Context {
    /// A context that is never cancelled unless [`Context::cancel`] is called.
    pub fn background() -> Self {
        let (trigger, cancelled) = watch::channel(false);
        Self {
            trigger: Arc::new(trigger),
            cancelled,
            deadline: None,
        }
    }

    /// A context that expires `timeout` from now. A timeout too large to
    /// represent as an instant never expires.
    pub fn with_timeout(timeout: Duration) -> Self {
        let mut ctx = Self::background();
        ctx.deadline = Instant::now()
            .checked_add(timeout)
            .map(|at| (at, timeout));
        ctx
    }

    /// Cancels this context and every clone of it.
    pub fn cancel(&self) {
        self.trigger.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|(at, _)| at)
    }

    /// Returns the reason this context is done, or `Ok(())` while it is live.
    pub fn err(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ThrottleError::Cancelled);
        }
        if let Some((at, timeout)) = self.deadline {
            if Instant::now() >= at {
                return Err(ThrottleError::Timeout { timeout });
            }
        }
        Ok(())
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ThrottleError {
        let mut cancelled = self.cancelled.clone();
        let on_cancel = async move {
            let signalled = cancelled.wait_for(|c| *c).await.is_ok();
            if !signalled {
                std::future::pending::<()>().await;
            }
        };

        match self.deadline {
            Some((at, timeout)) => {
                tokio::select! {
                    _ = on_cancel => ThrottleError::Cancelled,
                    _ = tokio::time::sleep_until(at) => ThrottleError::Timeout { timeout },
                }
            }
            None => {
                on_cancel.await;
                ThrottleError::Cancelled
            }
        }
    }

    /// Drives `fut` to completion unless the context finishes first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.err()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_is_live() {
        let ctx = Context::background();
        assert!(ctx.err().is_ok());
        assert!(!ctx.is_cancelled());
        assert!(ctx.deadline().is_none());
    }

    #[tokio::test]
    async fn test_cancel_reaches_clones() {
        let ctx = Context::background();
        let clone = ctx.clone();
        ctx.cancel();

        assert!(clone.is_cancelled());
        assert!(matches!(clone.err(), Err(ThrottleError::Cancelled)));
        assert!(matches!(clone.done().await, ThrottleError::Cancelled));
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let ctx = Context::with_timeout(Duration::from_millis(20));
        assert!(ctx.err().is_ok());

        let err = ctx.done().await;
        assert!(err.is_timeout());
        assert!(ctx.err().unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_never_expires() {
        let ctx = Context::with_timeout(Duration::MAX);
        assert!(ctx.deadline().is_none());
        assert!(ctx.err().is_ok());
    }

    #[tokio::test]
    async fn test_run_aborts_pending_future() {
        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_run_returns_future_output() {
        let ctx = Context::with_timeout(Duration::from_secs(1));
        let value = ctx.run(async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
    }
}
