pub mod extractor;
pub mod proxy;
pub mod traits;
pub mod types;

pub use extractor::{parse_price, CardFields, ExtractedPage, ListingExtractor, Listings};
pub use proxy::{ProxyClient, ProxyClientConfig, RetryPolicy};
pub use traits::PageFetcher;
pub use types::{FetchResponse, SearchParams};
