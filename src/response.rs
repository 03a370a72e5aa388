use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::DispatchResult;
use crate::error::DispatchError;
use crate::util::truncate_body;

#[derive(Clone, Debug)]
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Whether the `content-type` header names a JSON media type.
    pub fn is_json(&self) -> bool {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| {
                let essence = value
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_ascii_lowercase();
                essence == "application/json" || essence.ends_with("+json")
            })
            .unwrap_or(false)
    }

    pub fn json<T>(&self) -> DispatchResult<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body)
            .map_err(|source| DispatchError::deserialize(source, truncate_body(&self.body)))
    }
}

/// A successful response body decoded by its content type.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Text(String),
}

impl Payload {
    pub(crate) fn decode(response: &HttpResponse) -> DispatchResult<Self> {
        if response.is_json() {
            return response.json().map(Self::Json);
        }
        Ok(Self::Text(response.text_lossy()))
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Json(_) => None,
            Self::Text(text) => Some(text),
        }
    }

    /// Deserializes the payload into `T`; text payloads are parsed as JSON.
    pub fn into_json<T>(self) -> DispatchResult<T>
    where
        T: DeserializeOwned,
    {
        match self {
            Self::Json(value) => serde_json::from_value(value)
                .map_err(|source| DispatchError::deserialize(source, String::new())),
            Self::Text(text) => serde_json::from_str(&text)
                .map_err(|source| DispatchError::deserialize(source, truncate_body(text.as_bytes()))),
        }
    }
}
