use std::collections::BTreeSet;
use std::future::Future;
use std::time::{Duration, Instant, SystemTime};

use http::{Method, StatusCode};
use rand::Rng;
use tracing::{Instrument, debug, info_span, warn};

use crate::DispatchResult;
use crate::cancel::CancelSignal;
use crate::error::{DispatchError, TransportError, TransportErrorKind};
use crate::metrics::DispatcherMetrics;
use crate::response::HttpResponse;
use crate::util::parse_retry_after;

const JITTER_LOW: f64 = 0.5;
const JITTER_HIGH: f64 = 1.5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: usize,
    backoff_base: Duration,
    backoff_cap: Duration,
    retryable_status_codes: BTreeSet<u16>,
    retryable_transport_error_kinds: BTreeSet<TransportErrorKind>,
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(5),
            retryable_status_codes: default_retryable_status_codes(),
            retryable_transport_error_kinds: TransportErrorKind::ALL.into_iter().collect(),
        }
    }

    pub fn disabled() -> Self {
        Self::standard().max_retries(0)
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base.max(Duration::from_millis(1));
        if self.backoff_cap < self.backoff_base {
            self.backoff_cap = self.backoff_base;
        }
        self
    }

    pub fn backoff_cap(mut self, backoff_cap: Duration) -> Self {
        self.backoff_cap = backoff_cap.max(self.backoff_base);
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retryable_transport_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_error_kinds = kinds.into_iter().collect();
        self
    }

    pub fn configured_max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn configured_backoff_base(&self) -> Duration {
        self.backoff_base
    }

    pub fn configured_backoff_cap(&self) -> Duration {
        self.backoff_cap
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }

    pub fn is_retryable_transport_error(&self, kind: TransportErrorKind) -> bool {
        self.retryable_transport_error_kinds.contains(&kind)
    }

    /// Upper bound of the delay after the zero-based attempt `attempt_index`:
    /// `min(cap, base * 2^attempt_index)`.
    pub fn backoff_ceiling(&self, attempt_index: usize) -> Duration {
        let exponent = attempt_index.min(31) as u32;
        let base_ms = self.backoff_base.as_millis().max(1);
        let cap_ms = self.backoff_cap.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(1_u128 << exponent)
            .min(cap_ms)
            .min(u64::MAX as u128) as u64;
        Duration::from_millis(delay_ms)
    }

    /// Jittered backoff: the ceiling scaled by a uniform draw from
    /// `[0.5, 1.5)`, floored to milliseconds and clamped to the ceiling,
    /// which never exceeds the cap.
    pub fn backoff_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = rand::rng().random_range(JITTER_LOW..JITTER_HIGH);
        self.jittered(self.backoff_ceiling(attempt_index), factor)
    }

    fn jittered(&self, ceiling: Duration, factor: f64) -> Duration {
        let ceiling = ceiling.min(self.backoff_cap);
        let ceiling_ms = ceiling.as_millis().min(u64::MAX as u128) as u64;
        let scaled = (ceiling_ms as f64 * factor).floor().max(0.0);
        Duration::from_millis((scaled as u64).min(ceiling_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [408_u16, 429].into_iter().chain(500..=599).collect()
}

pub fn default_idempotent_methods() -> Vec<Method> {
    vec![
        Method::GET,
        Method::HEAD,
        Method::OPTIONS,
        Method::PUT,
        Method::DELETE,
    ]
}

/// Whether a request may be replayed after a retryable failure.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Idempotence {
    /// Use the dispatcher's idempotent method set.
    #[default]
    MethodDefault,
    Always,
    Never,
    Methods(Vec<Method>),
}

impl Idempotence {
    pub(crate) fn allows_retry(&self, method: &Method, default_methods: &[Method]) -> bool {
        match self {
            Self::MethodDefault => default_methods.contains(method),
            Self::Always => true,
            Self::Never => false,
            Self::Methods(methods) => methods.contains(method),
        }
    }
}

impl From<bool> for Idempotence {
    fn from(idempotent: bool) -> Self {
        if idempotent { Self::Always } else { Self::Never }
    }
}

#[derive(Debug)]
pub(crate) enum AttemptFailure {
    Response(HttpResponse),
    Error(DispatchError),
}

impl AttemptFailure {
    fn surface(self) -> DispatchResult<HttpResponse> {
        match self {
            Self::Response(response) => Ok(response),
            Self::Error(error) => Err(error),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Response(response) => format!("status {}", response.status().as_u16()),
            Self::Error(error) => error.to_string(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    Success(HttpResponse),
    Retryable {
        failure: AttemptFailure,
        suggested_delay: Option<Duration>,
    },
    Fatal(AttemptFailure),
}

/// Maps one transport result onto an attempt outcome.
pub(crate) fn classify_attempt(
    policy: &RetryPolicy,
    result: Result<HttpResponse, TransportError>,
    method: &Method,
    uri: &str,
    now: SystemTime,
) -> AttemptOutcome {
    match result {
        Ok(response) if response.is_success() => AttemptOutcome::Success(response),
        Ok(response) if policy.is_retryable_status(response.status()) => {
            let suggested_delay = parse_retry_after(response.headers(), now);
            AttemptOutcome::Retryable {
                failure: AttemptFailure::Response(response),
                suggested_delay,
            }
        }
        Ok(response) => AttemptOutcome::Fatal(AttemptFailure::Response(response)),
        Err(error) => {
            let kind = error.kind();
            let failure = AttemptFailure::Error(DispatchError::Transport {
                kind,
                method: method.clone(),
                uri: uri.to_owned(),
                source: error.into_source(),
            });
            if policy.is_retryable_transport_error(kind) {
                AttemptOutcome::Retryable {
                    failure,
                    suggested_delay: None,
                }
            } else {
                AttemptOutcome::Fatal(failure)
            }
        }
    }
}

pub(crate) struct RetryPlan<'a> {
    pub(crate) policy: &'a RetryPolicy,
    pub(crate) max_attempts: usize,
    pub(crate) client_name: &'a str,
    pub(crate) method: &'a Method,
    pub(crate) uri: &'a str,
}

/// Drives attempts until one settles the request.
///
/// Every attempt and every inter-attempt delay is raced against `signal`;
/// the signal firing ends the request with no further attempts.
pub(crate) async fn run_with_retry<F, Fut>(
    plan: RetryPlan<'_>,
    signal: &CancelSignal,
    metrics: &DispatcherMetrics,
    mut attempt: F,
) -> DispatchResult<HttpResponse>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = AttemptOutcome>,
{
    let max_attempts = plan.max_attempts.max(1);
    let mut attempt_index = 0;
    loop {
        let span = info_span!(
            "kym.request",
            client = %plan.client_name,
            method = %plan.method,
            uri = %plan.uri,
            attempt = attempt_index + 1,
            max_attempts = max_attempts
        );
        let started = Instant::now();
        let outcome = signal
            .guard(attempt(attempt_index))
            .instrument(span)
            .await
            .map_err(|reason| signal.abort_error(reason, plan.method, plan.uri))?;
        debug!(
            attempt = attempt_index + 1,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "attempt finished"
        );

        let (failure, suggested_delay) = match outcome {
            AttemptOutcome::Success(response) => return Ok(response),
            AttemptOutcome::Fatal(failure) => return failure.surface(),
            AttemptOutcome::Retryable {
                failure,
                suggested_delay,
            } => (failure, suggested_delay),
        };
        if attempt_index + 1 >= max_attempts {
            return failure.surface();
        }

        let delay =
            suggested_delay.unwrap_or_else(|| plan.policy.backoff_for_attempt(attempt_index));
        warn!(
            method = %plan.method,
            uri = %plan.uri,
            attempt = attempt_index + 1,
            delay_ms = delay.as_millis() as u64,
            reason = %failure.describe(),
            "retrying request"
        );
        metrics.record_retry();
        signal
            .guard(tokio::time::sleep(delay))
            .await
            .map_err(|reason| signal.abort_error(reason, plan.method, plan.uri))?;
        attempt_index += 1;
    }
}
