//! reqwest-backed retrieval mapped onto [`FetchError`].

use std::error::Error as _;
use std::time::Duration;

use bytes::Bytes;

use crate::BoxFuture;
use crate::error::FetchError;
use crate::health::HealthProbe;

const USER_AGENT: &str = concat!("climate-layer-engine/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::Transport(format!("client init: {e}")))?;
        Ok(Self { client, timeout })
    }

    pub fn from_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// GETs `url` and returns the full body. Non-2xx answers become [`FetchError::Status`].
    pub async fn get_bytes(&self, url: &str) -> Result<Bytes, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::status(status, url));
        }

        resp.bytes().await.map_err(|e| self.map_error(e))
    }

    fn map_error(&self, e: reqwest::Error) -> FetchError {
        let detail = error_chain(&e);
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else if e.is_builder() || e.is_decode() {
            FetchError::Malformed(detail)
        } else if e.is_connect() {
            let lower = detail.to_ascii_lowercase();
            if lower.contains("dns") || lower.contains("resolve") {
                FetchError::Dns(detail)
            } else {
                FetchError::ConnectionRefused(detail)
            }
        } else {
            FetchError::Transport(detail)
        }
    }
}

fn error_chain(e: &reqwest::Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}

/// Health probe that issues a GET against a fixed URL (the data service's `/health`).
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    fetcher: HttpFetcher,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(fetcher: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }

    /// Probe for `{api_base}/health`.
    pub fn for_api_base(fetcher: HttpFetcher, api_base: &str) -> Self {
        Self::new(fetcher, format!("{}/health", api_base.trim_end_matches('/')))
    }
}

impl HealthProbe for HttpHealthProbe {
    fn target(&self) -> &str {
        &self.url
    }

    fn probe(&self) -> BoxFuture<'_, Result<(), FetchError>> {
        Box::pin(async move { self.fetcher.get_bytes(&self.url).await.map(|_| ()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_url_is_not_retryable() {
        let fetcher = HttpFetcher::new(Duration::from_secs(1)).unwrap();
        let err = fetcher.get_bytes("not a url").await.unwrap_err();
        assert!(!err.is_retryable(), "{err:?}");
    }

    #[test]
    fn health_url_from_api_base() {
        let fetcher = HttpFetcher::new(Duration::from_secs(1)).unwrap();
        let probe = HttpHealthProbe::for_api_base(fetcher, "http://127.0.0.1:5000/");
        assert_eq!(probe.target(), "http://127.0.0.1:5000/health");
    }
}
