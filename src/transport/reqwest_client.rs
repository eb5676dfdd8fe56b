//! Reqwest-based implementation of the [`HttpTransport`] trait.
//!
//! Keeps one `reqwest::Client` per egress path (direct or per proxy), each
//! configured with the browser-like default headers and both timeouts.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap as HttpHeaderMap, HeaderName as HttpHeaderName, HeaderValue as HttpHeaderValue};
use reqwest::{Client, Method, header::HeaderMap};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{HttpTransport, OutboundRequest, TransportError, TransportResponse};
use crate::modules::proxy::ProxyEndpoint;

/// Connect and total timeouts in seconds. Both are always applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_secs: f64,
    pub total_secs: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10.0,
            total_secs: 30.0,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs_f64(self.connect_secs)
    }

    pub fn total(&self) -> Duration {
        Duration::from_secs_f64(self.total_secs)
    }
}

/// Reqwest-backed transport with a client pool keyed by proxy.
pub struct ReqwestTransport {
    timeouts: TimeoutConfig,
    default_headers: HeaderMap,
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl ReqwestTransport {
    pub fn new(
        timeouts: TimeoutConfig,
        default_headers: &BTreeMap<String, String>,
    ) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        for (name, value) in default_headers {
            let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| TransportError::Other(format!("header '{name}': {err}")))?;
            let header_value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|err| TransportError::Other(format!("header '{name}': {err}")))?;
            headers.insert(header_name, header_value);
        }

        Ok(Self {
            timeouts,
            default_headers: headers,
            clients: Mutex::new(HashMap::new()),
        })
    }

    async fn client(&self, proxy: Option<&ProxyEndpoint>) -> Result<Client, TransportError> {
        let mut guard = self.clients.lock().await;
        let key = proxy.map(ProxyEndpoint::url);
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .default_headers(self.default_headers.clone())
            .connect_timeout(self.timeouts.connect())
            .timeout(self.timeouts.total());

        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(endpoint.url())
                .map_err(|err| TransportError::Proxy(format!("{endpoint}: {err}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|err| TransportError::Other(err.to_string()))?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        request: OutboundRequest,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<TransportResponse, TransportError> {
        let client = self.client(proxy).await?;
        let method = Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|err| TransportError::Other(err.to_string()))?;

        let mut builder = client
            .request(method, request.url.as_str())
            .headers(convert_headers(&request.headers)?);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(map_error)?;
        let status = response.status().as_u16();
        let headers = convert_back_headers(response.headers())?;
        let url = response.url().clone();
        let body = response.bytes().await.map_err(map_error)?;

        Ok(TransportResponse {
            status,
            headers,
            body,
            url,
        })
    }
}

fn map_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

fn convert_headers(headers: &HttpHeaderMap) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers.iter() {
        let name = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|err| TransportError::Other(err.to_string()))?;
        let value = reqwest::header::HeaderValue::from_bytes(value.as_bytes())
            .map_err(|err| TransportError::Other(err.to_string()))?;
        map.append(name, value);
    }
    Ok(map)
}

fn convert_back_headers(map: &HeaderMap) -> Result<HttpHeaderMap, TransportError> {
    let mut headers = HttpHeaderMap::new();
    for (name, value) in map.iter() {
        let http_name = HttpHeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|err| TransportError::Other(err.to_string()))?;
        let http_value = HttpHeaderValue::from_bytes(value.as_bytes())
            .map_err(|err| TransportError::Other(err.to_string()))?;
        headers.append(http_name, http_value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::proxy::ProxyProtocol;

    #[test]
    fn rejects_invalid_default_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(ReqwestTransport::new(TimeoutConfig::default(), &headers).is_err());
    }

    #[tokio::test]
    async fn reuses_client_per_egress_path() {
        let transport = ReqwestTransport::new(TimeoutConfig::default(), &BTreeMap::new()).unwrap();
        let proxy = ProxyEndpoint::new("127.0.0.1", 3128);
        transport.client(None).await.unwrap();
        transport.client(Some(&proxy)).await.unwrap();
        transport.client(Some(&proxy)).await.unwrap();
        assert_eq!(transport.clients.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn same_address_with_different_scheme_or_login_gets_its_own_client() {
        let transport = ReqwestTransport::new(TimeoutConfig::default(), &BTreeMap::new()).unwrap();
        let plain = ProxyEndpoint::new("127.0.0.1", 1080);
        let socks = plain.clone().with_protocol(ProxyProtocol::Socks5);
        let authed = plain.clone().with_credentials("user", "secret");
        for endpoint in [&plain, &socks, &authed, &plain] {
            transport.client(Some(endpoint)).await.unwrap();
        }
        assert_eq!(transport.clients.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn refused_connection_maps_to_connect_error() {
        let transport = ReqwestTransport::new(
            TimeoutConfig {
                connect_secs: 2.0,
                total_secs: 5.0,
            },
            &BTreeMap::new(),
        )
        .unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = url::Url::parse(&format!("http://{addr}/")).unwrap();
        let err = transport
            .send(OutboundRequest::get(url), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)), "{err:?}");
    }
}
