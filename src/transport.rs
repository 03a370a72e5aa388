use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, Method};
use url::Url;

use crate::error::TransportError;
use crate::response::HttpResponse;

/// One physical request as handed to a [`Transport`].
#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Outbound capability the dispatcher runs attempts through.
///
/// Implementations report any non-exceptional HTTP exchange as `Ok`,
/// whatever the status; retry classification happens in the dispatcher.
/// The returned future may be dropped at any await point when the caller
/// cancels or the deadline passes.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, request: TransportRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>>;
}

#[cfg(feature = "hyper-transport")]
pub use self::hyper_transport::HyperTransport;

#[cfg(feature = "hyper-transport")]
mod hyper_transport {
    use std::time::Duration;

    use bytes::Bytes;
    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;
    use http::Request;
    use http_body_util::{BodyExt, Full};
    use hyper::body::Incoming;
    use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
    use hyper_util::client::legacy::Client;
    use hyper_util::client::legacy::connect::HttpConnector;
    use hyper_util::rt::TokioExecutor;

    use super::{Transport, TransportRequest};
    use crate::error::{DispatchError, TransportError, TransportErrorKind};
    use crate::response::HttpResponse;

    type PooledClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

    /// Pooled HTTP/1.1 + HTTP/2 client over rustls with webpki roots.
    #[derive(Clone, Debug)]
    pub struct HyperTransport {
        client: PooledClient,
        max_response_body_bytes: usize,
    }

    impl HyperTransport {
        pub fn try_new(
            pool_idle_timeout: Duration,
            pool_max_idle_per_host: usize,
            max_response_body_bytes: usize,
        ) -> Result<Self, DispatchError> {
            let https = HttpsConnectorBuilder::new()
                .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
                .map_err(|source| DispatchError::TransportInit {
                    message: source.to_string(),
                })?
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .build();
            let client = Client::builder(TokioExecutor::new())
                .pool_idle_timeout(pool_idle_timeout)
                .pool_max_idle_per_host(pool_max_idle_per_host)
                .build(https);
            Ok(Self {
                client,
                max_response_body_bytes: max_response_body_bytes.max(1),
            })
        }

        async fn execute(&self, request: TransportRequest) -> Result<HttpResponse, TransportError> {
            let mut builder = Request::builder()
                .method(request.method)
                .uri(request.url.as_str());
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            let http_request = builder
                .body(Full::new(request.body))
                .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;

            let response = self
                .client
                .request(http_request)
                .await
                .map_err(|source| TransportError::new(classify_transport_error(&source), source))?;
            let (parts, body) = response.into_parts();
            let body = read_body_limited(body, self.max_response_body_bytes).await?;
            Ok(HttpResponse::new(parts.status, parts.headers, body))
        }
    }

    impl Transport for HyperTransport {
        fn send(
            &self,
            request: TransportRequest,
        ) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
            self.execute(request).boxed()
        }
    }

    async fn read_body_limited(mut body: Incoming, max_bytes: usize) -> Result<Bytes, TransportError> {
        let mut collected = Vec::new();
        while let Some(frame) = body.frame().await {
            let frame =
                frame.map_err(|source| TransportError::new(TransportErrorKind::Read, source))?;
            if let Some(data) = frame.data_ref() {
                if collected.len().saturating_add(data.len()) > max_bytes {
                    return Err(TransportError::new(
                        TransportErrorKind::Read,
                        format!("response body exceeds {max_bytes} bytes"),
                    ));
                }
                collected.extend_from_slice(data);
            }
        }
        Ok(Bytes::from(collected))
    }

    pub(super) fn classify_transport_error(
        error: &hyper_util::client::legacy::Error,
    ) -> TransportErrorKind {
        let text = error_chain_text(error);
        if error.is_connect() {
            if text.contains("dns")
                || text.contains("name or service not known")
                || text.contains("failed to lookup address")
                || text.contains("no such host")
            {
                return TransportErrorKind::Dns;
            }
            if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
                return TransportErrorKind::Tls;
            }
            return TransportErrorKind::Connect;
        }

        if text.contains("read")
            || text.contains("connection reset")
            || text.contains("broken pipe")
            || text.contains("unexpected eof")
            || text.contains("connection closed")
        {
            return TransportErrorKind::Read;
        }
        TransportErrorKind::Other
    }

    fn error_chain_text(error: &(dyn std::error::Error + 'static)) -> String {
        let mut text = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            text.push_str(": ");
            text.push_str(&cause.to_string());
            source = cause.source();
        }
        text.to_ascii_lowercase()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn connection_refused_classifies_as_connect() {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            let address = listener.local_addr().expect("local addr");
            drop(listener);

            let transport =
                HyperTransport::try_new(Duration::from_secs(5), 1, 1024).expect("transport");
            let url = url::Url::parse(&format!("http://{address}/v1/info")).expect("url");
            let error = transport
                .send(TransportRequest {
                    method: http::Method::GET,
                    url,
                    headers: http::HeaderMap::new(),
                    body: Bytes::new(),
                })
                .await
                .expect_err("nothing listens on the port");
            assert_eq!(error.kind(), TransportErrorKind::Connect);
        }
    }
}
