//! HTTP transport abstraction.
//!
//! The executor talks to the network only through [`HttpTransport`], which
//! keeps pacing, sessions and classification testable without sockets.
//! Cookies travel as plain `Cookie` / `Set-Cookie` headers; the session
//! layer owns them.

pub mod reqwest_client;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, SET_COOKIE};
use http::{HeaderName, HeaderValue, Method};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::modules::proxy::ProxyEndpoint;

pub use reqwest_client::{ReqwestTransport, TimeoutConfig};

/// Contract for the component that performs the actual HTTP exchange.
///
/// Implementations must enforce connect and total timeouts so a hung peer
/// cannot stall the executor.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(
        &self,
        request: OutboundRequest,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<TransportResponse, TransportError>;
}

/// Fully prepared request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Overrides the transport's total timeout for this request.
    pub timeout: Option<Duration>,
}

impl OutboundRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Option<Bytes>) -> Self {
        self.body = body;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Response as observed by the executor.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Final URL after redirects.
    pub url: Url,
}

impl TransportResponse {
    pub fn new(status: u16, url: Url, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            url,
        }
    }

    /// Appends a header, ignoring names or values that are not valid HTTP.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn set_cookie_headers(&self) -> Vec<String> {
        self.headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect()
    }
}

/// Network-level failures. Converted into outcomes by the executor.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("invalid proxy configuration: {0}")]
    Proxy(String),
    #[error("http transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_every_set_cookie_header() {
        let url = Url::parse("https://example.com/").unwrap();
        let response = TransportResponse::new(200, url, "ok")
            .with_header("set-cookie", "a=1; Path=/")
            .with_header("Set-Cookie", "b=2")
            .with_header("bad header", "ignored");
        assert_eq!(response.set_cookie_headers(), vec!["a=1; Path=/", "b=2"]);
        assert_eq!(response.text(), "ok");
    }
}
