use std::future::Future;
use std::time::Duration;

use http::Method;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AbortReason {
    Cancelled,
    TimedOut,
}

/// Caller cancellation and request deadline folded into one signal.
///
/// The deadline is fixed when the signal is built, i.e. when the logical
/// request is scheduled, so time spent queued for permits counts against it.
#[derive(Clone, Debug)]
pub(crate) struct CancelSignal {
    token: Option<CancellationToken>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

impl CancelSignal {
    pub(crate) fn new(token: Option<CancellationToken>, timeout: Option<Duration>) -> Self {
        let timeout = timeout.filter(|timeout| !timeout.is_zero());
        Self {
            token,
            deadline: timeout.map(|timeout| Instant::now() + timeout),
            timeout,
        }
    }

    pub(crate) fn check(&self) -> Option<AbortReason> {
        if self
            .token
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Some(AbortReason::Cancelled);
        }
        if self
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            return Some(AbortReason::TimedOut);
        }
        None
    }

    /// Resolves once either source fires; pending forever when neither is set.
    pub(crate) async fn fired(&self) -> AbortReason {
        let cancelled = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let timed_out = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            () = cancelled => AbortReason::Cancelled,
            () = timed_out => AbortReason::TimedOut,
        }
    }

    /// Runs `future` unless the signal fires first. A signal that has
    /// already fired wins even if `future` is immediately ready.
    pub(crate) async fn guard<F>(&self, future: F) -> Result<F::Output, AbortReason>
    where
        F: Future,
    {
        if let Some(reason) = self.check() {
            return Err(reason);
        }
        tokio::select! {
            biased;
            reason = self.fired() => Err(reason),
            output = future => Ok(output),
        }
    }

    pub(crate) fn abort_error(&self, reason: AbortReason, method: &Method, uri: &str) -> DispatchError {
        match reason {
            AbortReason::Cancelled => DispatchError::Cancelled {
                method: method.clone(),
                uri: uri.to_owned(),
            },
            AbortReason::TimedOut => DispatchError::Timeout {
                timeout_ms: self.timeout.map(|timeout| timeout.as_millis()).unwrap_or(0),
                method: method.clone(),
                uri: uri.to_owned(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn guard_passes_through_without_sources() {
        let signal = CancelSignal::new(None, None);
        assert_eq!(signal.guard(async { 7 }).await, Ok(7));
        assert_eq!(signal.check(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_disables_deadline() {
        let signal = CancelSignal::new(None, Some(Duration::ZERO));
        let output = signal
            .guard(tokio::time::sleep(Duration::from_secs(60)))
            .await;
        assert_eq!(output, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_slow_future() {
        let signal = CancelSignal::new(None, Some(Duration::from_millis(50)));
        let started = Instant::now();
        let output = signal
            .guard(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(output, Err(AbortReason::TimedOut));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50) && elapsed < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn token_interrupts_pending_future() {
        let token = CancellationToken::new();
        let signal = CancelSignal::new(Some(token.clone()), Some(Duration::from_secs(10)));
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let output = signal.guard(std::future::pending::<()>()).await;
        assert_eq!(output, Err(AbortReason::Cancelled));
    }

    #[tokio::test]
    async fn already_cancelled_wins_over_ready_future() {
        let token = CancellationToken::new();
        token.cancel();
        let signal = CancelSignal::new(Some(token), None);
        assert_eq!(signal.guard(async { 1 }).await, Err(AbortReason::Cancelled));
    }

    #[tokio::test]
    async fn abort_error_distinguishes_reasons() {
        let signal = CancelSignal::new(None, Some(Duration::from_millis(1500)));
        let cancelled = signal.abort_error(AbortReason::Cancelled, &Method::GET, "https://a.example/");
        let timed_out = signal.abort_error(AbortReason::TimedOut, &Method::GET, "https://a.example/");
        assert!(matches!(cancelled, DispatchError::Cancelled { .. }));
        assert!(matches!(timed_out, DispatchError::Timeout { timeout_ms: 1500, .. }));
    }
}
