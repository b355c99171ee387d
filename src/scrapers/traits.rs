use crate::error::FetchError;
use crate::scrapers::types::{FetchResponse, SearchParams};
use async_trait::async_trait;

/// Anything that can fetch a marketplace results page.
///
/// The crawler only talks to this trait, so the real proxy client can be
/// swapped for a scripted one in tests.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch one results page. Retries are the implementation's business.
    async fn fetch(&self, params: &SearchParams) -> Result<FetchResponse, FetchError>;

    /// Get the name of the fetcher, used in logs
    fn source_name(&self) -> &'static str;
}
