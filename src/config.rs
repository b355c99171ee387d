//! Crawl settings
//!
//! Loaded from a config file (any format the `config` crate understands)
//! layered with `MARKETPLACE_SCOUT_*` environment variables, e.g.
//! `MARKETPLACE_SCOUT_PROXY_CREDENTIALS__PASS`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "MARKETPLACE_SCOUT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {source}")]
    Load {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

/// How requests reach the marketplace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    Direct,
    #[default]
    Forward,
    ScraperApi,
}

/// Forward-proxy endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyCredentials {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
}

impl ProxyCredentials {
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Hosted scraping endpoint that fetches the page on our behalf
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperApiSettings {
    #[serde(default = "default_scraper_api_endpoint")]
    pub endpoint: String,
    pub token: String,
    #[serde(default = "default_locale")]
    pub locale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceSettings {
    pub base_url: String,
}

impl Default for MarketplaceSettings {
    fn default() -> Self {
        Self {
            base_url: "https://www.facebook.com".to_string(),
        }
    }
}

/// Retry schedule shared by every fetch, read-only after startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorSettings {
    pub card: String,
    pub title: String,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            card: r#"a[href*="/marketplace/item/"]"#.to_string(),
            title: r#"span[style*="line-clamp"], [data-listing-title]"#.to_string(),
        }
    }
}

/// Repeat the crawl on an interval, the way a watcher would
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    pub interval_secs: u64,
    pub duration_secs: u64,
}

impl ScheduleSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub cities: Vec<String>,
    pub queries: Vec<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages_per_query: u32,
    /// Attempts per fetch inside the proxy client
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Times the crawler requeues a task after the client gave up
    #[serde(default = "default_task_requeue_limit")]
    pub task_requeue_limit: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub proxy_mode: ProxyMode,
    #[serde(default)]
    pub proxy_credentials: Option<ProxyCredentials>,
    #[serde(default)]
    pub scraper_api: Option<ScraperApiSettings>,
    #[serde(default)]
    pub marketplace: MarketplaceSettings,
    #[serde(default)]
    pub backoff: BackoffSettings,
    #[serde(default)]
    pub selectors: SelectorSettings,
    #[serde(default)]
    pub schedule: Option<ScheduleSettings>,
    pub database_path: String,
}

fn default_max_pages() -> u32 {
    5
}

fn default_retry_limit() -> u32 {
    3
}

fn default_task_requeue_limit() -> u32 {
    1
}

fn default_concurrency() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_scraper_api_endpoint() -> String {
    "https://scraper-api.smartproxy.com/v2/scrape".to_string()
}

fn default_locale() -> String {
    "en-US".to_string()
}

impl Settings {
    /// Load from `path` (extension optional) plus environment overrides
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cities")
                    .with_list_parse_key("queries")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = settings.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::Validation {
                message: message.to_string(),
            })
        };

        if self.cities.iter().all(|c| c.trim().is_empty()) {
            return invalid("at least one city is required");
        }
        if self.queries.iter().all(|q| q.trim().is_empty()) {
            return invalid("at least one query is required");
        }
        if self.max_pages_per_query == 0 {
            return invalid("max_pages_per_query must be greater than 0");
        }
        if self.retry_limit == 0 {
            return invalid("retry_limit must be greater than 0");
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be greater than 0");
        }
        if self.database_path.trim().is_empty() {
            return invalid("database_path is required");
        }
        if url::Url::parse(&self.marketplace.base_url).is_err() {
            return invalid("marketplace.base_url must be an absolute URL");
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return invalid("backoff.base_delay_ms cannot exceed backoff.max_delay_ms");
        }
        match self.proxy_mode {
            ProxyMode::Forward if self.proxy_credentials.is_none() => {
                return invalid("proxy_mode 'forward' requires proxy_credentials");
            }
            ProxyMode::ScraperApi if self.scraper_api.is_none() => {
                return invalid("proxy_mode 'scraper_api' requires a scraper_api section");
            }
            _ => {}
        }
        if let Some(schedule) = &self.schedule {
            if schedule.interval_secs == 0 {
                return invalid("schedule.interval_secs must be greater than 0");
            }
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
