//! Scrape vehicle listings from a web marketplace through a proxy pool,
//! extract them into records and keep a deduplicated SQLite copy.

pub mod config;
pub mod crawler;
pub mod error;
pub mod models;
pub mod scrapers;
pub mod storage;

pub use config::Settings;
pub use crawler::{CrawlOptions, Crawler};
pub use error::{ExtractError, FetchError, FetchErrorKind, StoreError, StoreErrorKind};
pub use models::{ChainOutcome, CrawlSummary, CrawlTask, Listing, StopReason, TaskState};
pub use scrapers::{ListingExtractor, PageFetcher, ProxyClient, ProxyClientConfig};
pub use storage::{ListingStore, UpsertOutcome};
