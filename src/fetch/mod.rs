//! HTTP access for plugin steps.
//!
//! [`HttpFetcher`] is the seam the executors talk to; [`ReqwestFetcher`] is the
//! production implementation. [`cache::ResponseCache`] sits in front of it and
//! adds per-step TTL caching and single-flight coalescing.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use encoding_rs::Encoding;
use reqwest::{
    Client, Method,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use thiserror::Error;

pub mod cache;
pub mod metrics;

pub use cache::{CacheTtl, ResponseCache};

/// Upper bound for a single request, independent of instance cancellation.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A fully resolved request; no placeholders left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub body: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Charset label, e.g. `windows-1252`.
    pub encoding: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            body: None,
            headers: BTreeMap::new(),
            encoding: None,
        }
    }
}

/// Cloneable so one coalesced result can be handed to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("server answered with status {0}")]
    Status(u16),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("could not decode response body: {0}")]
    Decode(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = e.status() {
            FetchError::Status(status.as_u16())
        } else if e.is_decode() || e.is_body() {
            FetchError::Decode(e.to_string())
        } else if e.is_builder() {
            FetchError::InvalidRequest(e.to_string())
        } else {
            FetchError::Connection(e.to_string())
        }
    }
}

#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Perform the request and return the decoded body of a 2xx response.
    async fn fetch(&self, request: &FetchRequest) -> Result<String, FetchError>;
}

#[derive(Clone, Debug)]
pub struct ReqwestFetcher {
    client: Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("plugin-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::InvalidRequest(format!("reqwest client: {e}")))?;
        Ok(Self { client })
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, FetchError> {
    let mut map = HeaderMap::new();
    for (k, v) in headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| FetchError::InvalidRequest(format!("header `{k}`: {e}")))?;
        let value = HeaderValue::from_str(v)
            .map_err(|e| FetchError::InvalidRequest(format!("header `{k}`: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, FetchError> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|e| FetchError::InvalidRequest(format!("method `{}`: {e}", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .headers(header_map(&request.headers)?);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        // A step encoding wins over whatever charset the server declares.
        let forced = request
            .encoding
            .as_deref()
            .and_then(|label| Encoding::for_label(label.trim().as_bytes()));
        match forced {
            Some(encoding) => {
                let bytes = response.bytes().await?;
                let (text, _, _) = encoding.decode(&bytes);
                Ok(text.into_owned())
            }
            None => Ok(response.text().await?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    /// Serve one connection with `response` (or never answer when `None`) and
    /// return the base URL.
    async fn serve_once(response: Option<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            match response {
                Some(bytes) => {
                    socket.write_all(&bytes).await.unwrap();
                    socket.shutdown().await.ok();
                }
                None => tokio::time::sleep(Duration::from_secs(30)).await,
            }
        });
        format!("http://{addr}/")
    }

    fn http_response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn step_encoding_overrides_declared_charset() {
        let url = serve_once(Some(http_response(
            "200 OK",
            "text/plain; charset=utf-8",
            b"caf\xE9",
        )))
        .await;
        let fetcher = ReqwestFetcher::new(Duration::from_secs(5)).unwrap();
        let mut request = FetchRequest::get(url);
        request.encoding = Some("windows-1252".into());

        assert_eq!(fetcher.fetch(&request).await.unwrap(), "café");
    }

    #[tokio::test]
    async fn unknown_encoding_label_uses_declared_charset() {
        let url = serve_once(Some(http_response(
            "200 OK",
            "text/plain; charset=utf-8",
            "café".as_bytes(),
        )))
        .await;
        let fetcher = ReqwestFetcher::new(Duration::from_secs(5)).unwrap();
        let mut request = FetchRequest::get(url);
        request.encoding = Some("no-such-charset".into());

        assert_eq!(fetcher.fetch(&request).await.unwrap(), "café");
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let url = serve_once(Some(http_response(
            "503 Service Unavailable",
            "text/plain",
            b"down",
        )))
        .await;
        let fetcher = ReqwestFetcher::new(Duration::from_secs(5)).unwrap();

        assert_eq!(
            fetcher.fetch(&FetchRequest::get(url)).await,
            Err(FetchError::Status(503))
        );
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let url = serve_once(None).await;
        let fetcher = ReqwestFetcher::new(Duration::from_millis(200)).unwrap();

        assert_eq!(
            fetcher.fetch(&FetchRequest::get(url)).await,
            Err(FetchError::Timeout)
        );
    }

    #[tokio::test]
    async fn bad_header_is_an_invalid_request() {
        let fetcher = ReqwestFetcher::new(Duration::from_secs(1)).unwrap();
        let mut request = FetchRequest::get("http://127.0.0.1:1/");
        request.headers.insert("bad header".into(), "x".into());

        assert!(matches!(
            fetcher.fetch(&request).await,
            Err(FetchError::InvalidRequest(_))
        ));
    }
}
