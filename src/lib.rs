//! `kym_dispatch` is the outbound request layer of the kym mint explorer: a
//! concurrency-limited HTTP dispatcher with retry, jittered backoff,
//! cancellation and in-flight request deduplication.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use kym_dispatch::prelude::{Dispatcher, RetryPolicy};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct MintInfo {
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Dispatcher::builder()
//!         .base_url("https://api.audit.8333.space/")
//!         .max_concurrency(16)
//!         .max_concurrency_per_origin(4)
//!         .default_timeout(Duration::from_secs(10))
//!         .retry_policy(
//!             RetryPolicy::standard()
//!                 .max_retries(2)
//!                 .backoff_base(Duration::from_millis(250))
//!                 .backoff_cap(Duration::from_secs(5)),
//!         )
//!         .try_build()?;
//!
//!     let info: MintInfo = dispatcher.get("mints/1").send_json().await?;
//!     println!("mint={}", info.name);
//!
//!     let response = dispatcher.get("mints/999999").send().await?;
//!     if response.status() == http::StatusCode::NOT_FOUND {
//!         println!("not audited yet");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Behavior
//!
//! - Every physical request holds a global permit and a per-origin permit,
//!   both granted in arrival order.
//! - Only idempotent requests retry. `PUT` and `DELETE` count as idempotent
//!   unless [`DispatcherBuilder::idempotent_methods`] says otherwise.
//! - Concurrent `GET`/`HEAD`/`OPTIONS` requests with identical method, url,
//!   headers and body share one execution.

mod cancel;
mod dedupe;
mod dispatcher;
mod error;
mod limiters;
mod metrics;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub use crate::dedupe::DedupeKey;
pub use crate::dispatcher::{Dispatcher, DispatcherBuilder};
pub use crate::error::{DispatchError, DispatchErrorCode, TransportError, TransportErrorKind};
pub use crate::limiters::{GatePermit, PermitGate};
pub use crate::metrics::DispatcherMetricsSnapshot;
pub use crate::request::{RequestBuilder, RequestDescriptor, TimeoutOverride};
pub use crate::response::{HttpResponse, Payload};
pub use crate::retry::{Idempotence, RetryPolicy, default_idempotent_methods};
#[cfg(feature = "hyper-transport")]
pub use crate::transport::HyperTransport;
pub use crate::transport::{Transport, TransportRequest};

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

pub mod prelude {
    pub use crate::{
        DedupeKey, DispatchError, DispatchErrorCode, DispatchResult, Dispatcher,
        DispatcherBuilder, DispatcherMetricsSnapshot, HttpResponse, Idempotence, Payload,
        RequestDescriptor, RetryPolicy, Transport, TransportError, TransportErrorKind,
        TransportRequest,
    };
}
