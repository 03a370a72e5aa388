use std::sync::Arc;

use http::Method;
use thiserror::Error;

pub(crate) type SharedSource = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl TransportErrorKind {
    pub const ALL: [Self; 5] = [Self::Dns, Self::Connect, Self::Tls, Self::Read, Self::Other];
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Failure reported by a [`Transport`](crate::Transport) before any response exists.
#[derive(Clone, Debug, Error)]
#[error("{kind} error: {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: SharedSource,
}

impl TransportError {
    pub fn new(
        kind: TransportErrorKind,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            source: Arc::from(source.into()),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub(crate) fn into_source(self) -> SharedSource {
        self.source
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DispatchErrorCode {
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    Transport,
    Cancelled,
    Timeout,
    HttpStatus,
    Serialize,
    Deserialize,
    TransportInit,
    ConcurrencyLimitClosed,
    ExecutionAborted,
}

impl DispatchErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::Transport => "transport",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::HttpStatus => "http_status",
            Self::Serialize => "serialize",
            Self::Deserialize => "deserialize",
            Self::TransportInit => "transport_init",
            Self::ConcurrencyLimitClosed => "concurrency_limit_closed",
            Self::ExecutionAborted => "execution_aborted",
        }
    }
}

/// Every failure a dispatch can surface.
///
/// The type is `Clone` because one deduplicated execution fans its result
/// out to every caller that joined it.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: Arc<http::header::InvalidHeaderName>,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: Arc<http::header::InvalidHeaderValue>,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: SharedSource,
    },
    #[error("http request cancelled for {method} {uri}")]
    Cancelled { method: Method, uri: String },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("http status error {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("failed to encode request json: {source}")]
    Serialize {
        #[source]
        source: Arc<serde_json::Error>,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: Arc<serde_json::Error>,
        body: String,
    },
    #[error("failed to initialize http transport: {message}")]
    TransportInit { message: String },
    #[error("request concurrency limiter is closed")]
    ConcurrencyLimitClosed,
    #[error("shared execution for {method} {uri} ended without a result: {message}")]
    ExecutionAborted {
        method: Method,
        uri: String,
        message: String,
    },
}

impl DispatchError {
    pub const fn code(&self) -> DispatchErrorCode {
        match self {
            Self::InvalidUri { .. } => DispatchErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => DispatchErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => DispatchErrorCode::InvalidHeaderValue,
            Self::Transport { .. } => DispatchErrorCode::Transport,
            Self::Cancelled { .. } => DispatchErrorCode::Cancelled,
            Self::Timeout { .. } => DispatchErrorCode::Timeout,
            Self::HttpStatus { .. } => DispatchErrorCode::HttpStatus,
            Self::Serialize { .. } => DispatchErrorCode::Serialize,
            Self::Deserialize { .. } => DispatchErrorCode::Deserialize,
            Self::TransportInit { .. } => DispatchErrorCode::TransportInit,
            Self::ConcurrencyLimitClosed => DispatchErrorCode::ConcurrencyLimitClosed,
            Self::ExecutionAborted { .. } => DispatchErrorCode::ExecutionAborted,
        }
    }

    /// True for explicit cancellation and elapsed deadlines.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::Timeout { .. })
    }

    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn deserialize(source: serde_json::Error, body: String) -> Self {
        Self::Deserialize {
            source: Arc::new(source),
            body,
        }
    }
}
