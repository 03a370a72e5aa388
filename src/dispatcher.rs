use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::DispatchResult;
use crate::cancel::CancelSignal;
use crate::dedupe::{InflightTable, Joined};
use crate::error::DispatchError;
use crate::limiters::OriginRegistry;
use crate::metrics::{DispatcherMetrics, DispatcherMetricsSnapshot};
use crate::request::{RequestBuilder, RequestDescriptor};
use crate::response::{HttpResponse, Payload};
use crate::retry::{RetryPlan, RetryPolicy, classify_attempt, default_idempotent_methods, run_with_retry};
use crate::transport::{Transport, TransportRequest};
use crate::util::{origin_key, redact_uri_for_logs, resolve_target, truncate_body};

const DEFAULT_MAX_CONCURRENCY: usize = 32;
const DEFAULT_MAX_CONCURRENCY_PER_ORIGIN: usize = 8;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;
const DEFAULT_CLIENT_NAME: &str = "kym";
const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

pub struct DispatcherBuilder {
    max_concurrency: usize,
    max_concurrency_per_origin: usize,
    default_timeout: Option<Duration>,
    retry_policy: RetryPolicy,
    idempotent_methods: Vec<Method>,
    base_url: Option<String>,
    client_name: String,
    transport: Option<Arc<dyn Transport>>,
    max_response_body_bytes: usize,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_concurrency_per_origin: DEFAULT_MAX_CONCURRENCY_PER_ORIGIN,
            default_timeout: Some(DEFAULT_TIMEOUT),
            retry_policy: RetryPolicy::standard(),
            idempotent_methods: default_idempotent_methods(),
            base_url: None,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            transport: None,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
        }
    }
}

impl DispatcherBuilder {
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn max_concurrency_per_origin(mut self, max_concurrency_per_origin: usize) -> Self {
        self.max_concurrency_per_origin = max_concurrency_per_origin.max(1);
        self
    }

    /// A zero duration disables the default timeout.
    pub fn default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = (!default_timeout.is_zero()).then_some(default_timeout);
        self
    }

    pub fn no_default_timeout(mut self) -> Self {
        self.default_timeout = None;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Methods retried without an explicit idempotence flag on the request.
    pub fn idempotent_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.idempotent_methods = methods.into_iter().collect();
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn transport<T>(self, transport: T) -> Self
    where
        T: Transport,
    {
        self.shared_transport(Arc::new(transport))
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host.max(1);
        self
    }

    pub fn try_build(self) -> DispatchResult<Dispatcher> {
        let base_url = self
            .base_url
            .as_deref()
            .map(|base_url| resolve_target(None, base_url))
            .transpose()?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(
                self.pool_idle_timeout,
                self.pool_max_idle_per_host,
                self.max_response_body_bytes,
            )?,
        };

        Ok(Dispatcher {
            inner: Arc::new(DispatcherInner {
                registry: OriginRegistry::new(
                    self.max_concurrency,
                    self.max_concurrency_per_origin,
                ),
                inflight: Arc::new(InflightTable::default()),
                transport,
                retry_policy: self.retry_policy,
                idempotent_methods: self.idempotent_methods,
                default_timeout: self.default_timeout,
                base_url,
                client_name: self.client_name,
                metrics: DispatcherMetrics::default(),
            }),
        })
    }

    pub fn build(self) -> Dispatcher {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build kym dispatcher: {error}"))
    }
}

#[cfg(feature = "hyper-transport")]
fn default_transport(
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    max_response_body_bytes: usize,
) -> DispatchResult<Arc<dyn Transport>> {
    let transport = crate::transport::HyperTransport::try_new(
        pool_idle_timeout,
        pool_max_idle_per_host,
        max_response_body_bytes,
    )?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "hyper-transport"))]
fn default_transport(
    _pool_idle_timeout: Duration,
    _pool_max_idle_per_host: usize,
    _max_response_body_bytes: usize,
) -> DispatchResult<Arc<dyn Transport>> {
    Err(DispatchError::TransportInit {
        message: "no transport configured and the `hyper-transport` feature is disabled"
            .to_owned(),
    })
}

/// Concurrency-limited request dispatcher.
///
/// Clones share one set of gates, one deduplication table and one metrics
/// registry; separately built dispatchers share nothing.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: OriginRegistry,
    inflight: Arc<InflightTable>,
    transport: Arc<dyn Transport>,
    retry_policy: RetryPolicy,
    idempotent_methods: Vec<Method>,
    default_timeout: Option<Duration>,
    base_url: Option<Url>,
    client_name: String,
    metrics: DispatcherMetrics,
}

/// Everything one execution needs, owned so it can move onto a task.
struct PreparedRequest {
    method: Method,
    url: Url,
    uri: String,
    headers: HeaderMap,
    body: Bytes,
    retry_policy: RetryPolicy,
    allow_retry: bool,
    signal: CancelSignal,
    scheduled_at: Instant,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    pub fn request(&self, method: Method, target: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, target.into())
    }

    pub fn get(&self, target: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, target)
    }

    pub fn head(&self, target: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, target)
    }

    pub fn post(&self, target: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, target)
    }

    pub fn put(&self, target: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, target)
    }

    pub fn delete(&self, target: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, target)
    }

    pub fn metrics_snapshot(&self) -> DispatcherMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Number of origins that have been given their own gate so far.
    pub fn origin_count(&self) -> usize {
        self.inner.registry.origin_count()
    }

    pub fn available_permits(&self) -> usize {
        self.inner.registry.global().available()
    }

    /// Runs the request and returns the final response whatever its status.
    ///
    /// Fails only on invalid input, transport errors, cancellation and
    /// timeouts.
    pub async fn fetch_response(&self, descriptor: RequestDescriptor) -> DispatchResult<HttpResponse> {
        let started_at = Instant::now();
        self.inner.metrics.record_request_started();
        let _in_flight = self.inner.metrics.enter_in_flight();
        let result = self.dispatch(descriptor).await;
        self.inner
            .metrics
            .record_request_completed(&result, started_at.elapsed());
        result
    }

    /// Runs the request and decodes a successful body by content type.
    ///
    /// A non-success status becomes [`DispatchError::HttpStatus`] carrying a
    /// truncated body excerpt.
    pub async fn fetch_decoded(&self, descriptor: RequestDescriptor) -> DispatchResult<Payload> {
        let method = descriptor.method().clone();
        let uri = resolve_target(self.inner.base_url.as_ref(), descriptor.target())
            .map(|url| redact_uri_for_logs(&url))
            .unwrap_or_else(|_| descriptor.target().to_owned());
        let response = self.fetch_response(descriptor).await?;
        if !response.is_success() {
            let status = response.status().as_u16();
            let body = truncate_body(response.body());
            warn!(
                status,
                method = %method,
                uri = %uri,
                body = %body,
                "http status error"
            );
            return Err(DispatchError::HttpStatus {
                status,
                method,
                uri,
                body,
            });
        }
        Payload::decode(&response)
    }

    pub async fn fetch_json<T>(&self, descriptor: RequestDescriptor) -> DispatchResult<T>
    where
        T: DeserializeOwned,
    {
        self.fetch_decoded(descriptor).await?.into_json()
    }

    async fn dispatch(&self, descriptor: RequestDescriptor) -> DispatchResult<HttpResponse> {
        let inner = &self.inner;
        let url = resolve_target(inner.base_url.as_ref(), descriptor.target())?;
        let signal = CancelSignal::new(
            descriptor.cancellation_token.clone(),
            descriptor.effective_timeout(inner.default_timeout),
        );
        let uri = redact_uri_for_logs(&url);
        let dedupe_key = descriptor.dedupe_key.resolve(
            &descriptor.method,
            &url,
            &descriptor.headers,
            &descriptor.body,
        );
        debug!(
            method = %descriptor.method,
            uri = %uri,
            origin = %origin_key(&url),
            dedupe_key = dedupe_key.as_deref(),
            "request scheduled"
        );

        let retry_policy = descriptor.effective_retry_policy(&inner.retry_policy);
        let allow_retry = descriptor
            .idempotence
            .allows_retry(&descriptor.method, &inner.idempotent_methods);
        let method = descriptor.method;
        let prepared = PreparedRequest {
            method: method.clone(),
            url,
            uri: uri.clone(),
            headers: descriptor.headers,
            body: descriptor.body,
            retry_policy,
            allow_retry,
            signal: signal.clone(),
            scheduled_at: Instant::now(),
        };

        let Some(dedupe_key) = dedupe_key else {
            return execute(Arc::clone(inner), prepared).await;
        };
        let execution_inner = Arc::clone(inner);
        let Joined {
            execution,
            is_follower,
            attachment: _attachment,
        } = inner
            .inflight
            .run_or_join(dedupe_key, &method, &uri, move |abandon| {
                let prepared = PreparedRequest {
                    signal: CancelSignal::new(Some(abandon), None),
                    ..prepared
                };
                execute(execution_inner, prepared)
            });
        if is_follower {
            inner.metrics.record_deduplicated();
            debug!(method = %method, uri = %uri, "joined in-flight request");
        }
        signal
            .guard(execution)
            .await
            .map_err(|reason| signal.abort_error(reason, &method, &uri))?
    }
}

/// Admission, then the retry loop, for one logical execution.
async fn execute(inner: Arc<DispatcherInner>, request: PreparedRequest) -> DispatchResult<HttpResponse> {
    let PreparedRequest {
        method,
        url,
        uri,
        headers,
        body,
        retry_policy,
        allow_retry,
        signal,
        scheduled_at,
    } = request;

    let admission = signal
        .guard(inner.registry.admit(&url))
        .await
        .map_err(|reason| signal.abort_error(reason, &method, &uri))??;
    inner.metrics.record_execution();
    let started_at = Instant::now();
    debug!(
        method = %method,
        uri = %uri,
        wait_global_ms = admission.wait_global.as_millis() as u64,
        wait_origin_ms = admission.wait_origin.as_millis() as u64,
        queued_ms = scheduled_at.elapsed().as_millis() as u64,
        "request admitted"
    );

    let plan = RetryPlan {
        policy: &retry_policy,
        max_attempts: if allow_retry {
            retry_policy.max_attempts()
        } else {
            1
        },
        client_name: &inner.client_name,
        method: &method,
        uri: &uri,
    };
    let transport = inner.transport.as_ref();
    let metrics = &inner.metrics;
    let (policy, method_ref, uri_ref, url_ref, headers_ref, body_ref) =
        (&retry_policy, &method, uri.as_str(), &url, &headers, &body);
    let result = run_with_retry(plan, &signal, metrics, |_attempt_index| {
        let request = TransportRequest {
            method: method_ref.clone(),
            url: url_ref.clone(),
            headers: headers_ref.clone(),
            body: body_ref.clone(),
        };
        async move {
            metrics.record_attempt();
            let result = transport.send(request).await;
            classify_attempt(policy, result, method_ref, uri_ref, SystemTime::now())
        }
    })
    .await;

    let status = result.as_ref().ok().map(|response| response.status().as_u16());
    debug!(
        method = %method,
        uri = %uri,
        status,
        ok = result.as_ref().is_ok_and(HttpResponse::is_success),
        execution_ms = started_at.elapsed().as_millis() as u64,
        total_ms = scheduled_at.elapsed().as_millis() as u64,
        "request finished"
    );
    drop(admission);
    result
}
