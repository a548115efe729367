use resilience::{BoxFuture, FetchError, HttpFetcher};

use crate::payload::LayerPayload;

/// Retrieves the payload behind an expanded data source URL.
///
/// One call is one attempt; retry and circuit breaking happen around it.
pub trait LayerFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<LayerPayload, FetchError>>;
}

#[derive(Debug, Clone)]
pub struct HttpLayerFetcher {
    http: HttpFetcher,
}

impl HttpLayerFetcher {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

impl LayerFetcher for HttpLayerFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<LayerPayload, FetchError>> {
        Box::pin(async move {
            let bytes = self.http.get_bytes(url).await?;
            if bytes.is_empty() {
                return Err(FetchError::Malformed(format!("empty body from {url}")));
            }
            Ok(LayerPayload::new(bytes))
        })
    }
}
