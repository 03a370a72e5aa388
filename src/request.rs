use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::DispatchResult;
use crate::dedupe::DedupeKey;
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::response::{HttpResponse, Payload};
use crate::retry::{Idempotence, RetryPolicy};
use crate::util::{parse_header_name, parse_header_value};

/// How long a request may run, counted from when it is scheduled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimeoutOverride {
    /// Use the dispatcher's default timeout.
    #[default]
    Inherit,
    After(Duration),
    Disabled,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) enum RetryOverride {
    #[default]
    Inherit,
    MaxRetries(usize),
    Policy(RetryPolicy),
}

/// One logical request.
///
/// Built once per call and consumed by [`Dispatcher::fetch_response`] or
/// [`Dispatcher::fetch_decoded`].
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) cancellation_token: Option<CancellationToken>,
    pub(crate) timeout: TimeoutOverride,
    pub(crate) retry: RetryOverride,
    pub(crate) idempotence: Idempotence,
    pub(crate) dedupe_key: DedupeKey,
}

impl RequestDescriptor {
    /// `target` is an absolute `http`/`https` url, or a path resolved against
    /// the dispatcher's base url.
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            cancellation_token: None,
            timeout: TimeoutOverride::Inherit,
            retry: RetryOverride::Inherit,
            idempotence: Idempotence::MethodDefault,
            dedupe_key: DedupeKey::Derive,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> DispatchResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T>(self, payload: &T) -> DispatchResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload)
            .map_err(|source| DispatchError::Serialize {
                source: Arc::new(source),
            })?;
        Ok(self
            .body(body)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// A zero duration disables the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() {
            TimeoutOverride::Disabled
        } else {
            TimeoutOverride::After(timeout)
        };
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = TimeoutOverride::Disabled;
        self
    }

    /// Overrides only the retry count of the dispatcher's policy.
    pub fn retries(mut self, max_retries: usize) -> Self {
        self.retry = RetryOverride::MaxRetries(max_retries);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry = RetryOverride::Policy(retry_policy);
        self
    }

    pub fn idempotent(self, idempotent: bool) -> Self {
        self.idempotence(Idempotence::from(idempotent))
    }

    pub fn idempotence(mut self, idempotence: Idempotence) -> Self {
        self.idempotence = idempotence;
        self
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = DedupeKey::Explicit(key.into());
        self
    }

    pub fn no_dedupe(mut self) -> Self {
        self.dedupe_key = DedupeKey::Disabled;
        self
    }

    pub(crate) fn effective_timeout(&self, default_timeout: Option<Duration>) -> Option<Duration> {
        match self.timeout {
            TimeoutOverride::Inherit => default_timeout,
            TimeoutOverride::After(timeout) => Some(timeout),
            TimeoutOverride::Disabled => None,
        }
    }

    pub(crate) fn effective_retry_policy(&self, default_policy: &RetryPolicy) -> RetryPolicy {
        match &self.retry {
            RetryOverride::Inherit => default_policy.clone(),
            RetryOverride::MaxRetries(max_retries) => {
                default_policy.clone().max_retries(*max_retries)
            }
            RetryOverride::Policy(policy) => policy.clone(),
        }
    }
}

/// Fluent front end over [`RequestDescriptor`] bound to one dispatcher.
pub struct RequestBuilder<'a> {
    dispatcher: &'a Dispatcher,
    descriptor: RequestDescriptor,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(dispatcher: &'a Dispatcher, method: Method, target: String) -> Self {
        Self {
            dispatcher,
            descriptor: RequestDescriptor::new(method, target),
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.descriptor = self.descriptor.header(name, value);
        self
    }

    pub fn try_header(mut self, name: &str, value: &str) -> DispatchResult<Self> {
        self.descriptor = self.descriptor.try_header(name, value)?;
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.descriptor = self.descriptor.body(body);
        self
    }

    pub fn json<T>(mut self, payload: &T) -> DispatchResult<Self>
    where
        T: Serialize + ?Sized,
    {
        self.descriptor = self.descriptor.json(payload)?;
        Ok(self)
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.descriptor = self.descriptor.cancellation_token(token);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.descriptor = self.descriptor.timeout(timeout);
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.descriptor = self.descriptor.no_timeout();
        self
    }

    pub fn retries(mut self, max_retries: usize) -> Self {
        self.descriptor = self.descriptor.retries(max_retries);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.descriptor = self.descriptor.retry_policy(retry_policy);
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.descriptor = self.descriptor.idempotent(idempotent);
        self
    }

    pub fn idempotence(mut self, idempotence: Idempotence) -> Self {
        self.descriptor = self.descriptor.idempotence(idempotence);
        self
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.descriptor = self.descriptor.dedupe_key(key);
        self
    }

    pub fn no_dedupe(mut self) -> Self {
        self.descriptor = self.descriptor.no_dedupe();
        self
    }

    pub fn into_descriptor(self) -> RequestDescriptor {
        self.descriptor
    }

    pub async fn send(self) -> DispatchResult<HttpResponse> {
        self.dispatcher.fetch_response(self.descriptor).await
    }

    pub async fn send_decoded(self) -> DispatchResult<Payload> {
        self.dispatcher.fetch_decoded(self.descriptor).await
    }

    pub async fn send_json<T>(self) -> DispatchResult<T>
    where
        T: DeserializeOwned,
    {
        self.dispatcher.fetch_json(self.descriptor).await
    }
}
