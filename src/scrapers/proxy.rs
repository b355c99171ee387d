use crate::config::{ProxyCredentials, ProxyMode, ScraperApiSettings, Settings};
use crate::error::{FetchError, FetchErrorKind};
use crate::scrapers::traits::PageFetcher;
use crate::scrapers::types::{FetchResponse, SearchParams};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use reqwest::{Client, Proxy};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Bounded retry schedule: `max_attempts` tries, exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.retry_limit,
            base_delay: Duration::from_millis(settings.backoff.base_delay_ms),
            max_delay: Duration::from_millis(settings.backoff.max_delay_ms),
            jitter: Duration::from_millis(settings.backoff.jitter_ms),
        }
    }

    /// Delay before the next try, after `failed_attempts` failures (>= 1)
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay);

        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// Everything needed to build a [`ProxyClient`]
#[derive(Debug, Clone)]
pub struct ProxyClientConfig {
    pub mode: ProxyMode,
    pub credentials: Option<ProxyCredentials>,
    pub scraper_api: Option<ScraperApiSettings>,
    pub base_url: Url,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl ProxyClientConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = Url::parse(&settings.marketplace.base_url)
            .context("Invalid marketplace base URL")?;

        Ok(Self {
            mode: settings.proxy_mode,
            credentials: settings.proxy_credentials.clone(),
            scraper_api: settings.scraper_api.clone(),
            base_url,
            timeout: settings.request_timeout(),
            retry: RetryPolicy::from_settings(settings),
        })
    }

    /// No proxy at all, straight to `base_url`
    pub fn direct(base_url: Url) -> Self {
        Self {
            mode: ProxyMode::Direct,
            credentials: None,
            scraper_api: None,
            base_url,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

enum Route {
    Direct,
    Forward { endpoint: String },
    ScraperApi(ScraperApiSettings),
}

#[derive(Debug, Deserialize)]
struct ScraperApiResponse {
    #[serde(default)]
    results: Vec<ScraperApiResult>,
}

#[derive(Debug, Deserialize)]
struct ScraperApiResult {
    #[serde(default)]
    content: String,
    status_code: Option<u16>,
}

/// One failed try, before it is known whether it will be retried
struct AttemptFailure {
    kind: FetchErrorKind,
    detail: String,
}

impl AttemptFailure {
    fn new(kind: FetchErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FetchErrorKind::Timeout
        } else if err.is_decode() {
            FetchErrorKind::InvalidResponse
        } else {
            FetchErrorKind::Connect
        };
        Self::new(kind, err.to_string())
    }
}

/// Stateless request executor routed through the configured proxy.
///
/// The only state is the pooled `reqwest::Client`; retry counters live on
/// the stack of each [`ProxyClient::fetch_url`] call.
pub struct ProxyClient {
    client: Client,
    route: Route,
    base_url: Url,
    retry: RetryPolicy,
}

impl ProxyClient {
    pub fn new(config: ProxyClientConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT);

        let route = match config.mode {
            ProxyMode::Direct => Route::Direct,
            ProxyMode::Forward => {
                let credentials = config
                    .credentials
                    .context("Forward proxy mode requires proxy credentials")?;
                let endpoint = credentials.proxy_url();
                let mut proxy = Proxy::all(&endpoint)
                    .with_context(|| format!("Invalid proxy endpoint: {endpoint}"))?;
                if let Some(user) = &credentials.user {
                    proxy = proxy.basic_auth(user, credentials.pass.as_deref().unwrap_or(""));
                }
                builder = builder.proxy(proxy);
                Route::Forward { endpoint }
            }
            ProxyMode::ScraperApi => {
                let api = config
                    .scraper_api
                    .context("Scraper API mode requires a scraper_api section")?;
                Route::ScraperApi(api)
            }
        };

        let client = builder.build().context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            route,
            base_url: config.base_url,
            retry: config.retry,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Endpoint requests are routed through, for logging
    pub fn endpoint(&self) -> &str {
        match &self.route {
            Route::Direct => "direct",
            Route::Forward { endpoint } => endpoint.as_str(),
            Route::ScraperApi(api) => api.endpoint.as_str(),
        }
    }

    /// Fetch `url`, retrying transient failures per the retry policy
    pub async fn fetch_url(&self, url: &Url) -> Result<FetchResponse, FetchError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(url = %url, attempt, via = self.endpoint(), "Fetching page");

            let failure = match self.attempt(url).await {
                Ok((status, body)) => {
                    debug!(url = %url, status, bytes = body.len(), "Fetched page");
                    return Ok(FetchResponse {
                        url: url.to_string(),
                        status,
                        body,
                        fetched_at: Utc::now(),
                    });
                }
                Err(failure) => failure,
            };

            if !failure.kind.is_retryable() || attempt >= max_attempts {
                warn!(url = %url, attempt, kind = ?failure.kind, "Giving up on page");
                return Err(FetchError::new(failure.kind, url.as_str(), failure.detail)
                    .with_attempts(attempt));
            }

            let delay = self.retry.delay_for(attempt);
            info!(
                url = %url,
                attempt,
                kind = ?failure.kind,
                delay_ms = delay.as_millis() as u64,
                "Retrying after failure"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self, url: &Url) -> Result<(u16, String), AttemptFailure> {
        match &self.route {
            Route::Direct | Route::Forward { .. } => self.attempt_get(url).await,
            Route::ScraperApi(api) => self.attempt_scraper_api(api, url).await,
        }
    }

    async fn attempt_get(&self, url: &Url) -> Result<(u16, String), AttemptFailure> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| AttemptFailure::from_reqwest(&e))?;

        let status = response.status().as_u16();
        if let Some(kind) = FetchErrorKind::from_status(status) {
            return Err(AttemptFailure::new(kind, format!("HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AttemptFailure::from_reqwest(&e))?;
        Ok((status, body))
    }

    async fn attempt_scraper_api(
        &self,
        api: &ScraperApiSettings,
        url: &Url,
    ) -> Result<(u16, String), AttemptFailure> {
        let payload = json!({
            "target": "universal",
            "locale": api.locale,
            "device_type": "desktop",
            "headless": "html",
            "url": url.as_str(),
        });

        let response = self
            .client
            .post(&api.endpoint)
            .header("accept", "application/json")
            .header("authorization", &api.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AttemptFailure::from_reqwest(&e))?;

        let status = response.status().as_u16();
        let kind = match status {
            401 => Some(FetchErrorKind::ProxyAuthFailure),
            other => FetchErrorKind::from_status(other),
        };
        if let Some(kind) = kind {
            return Err(AttemptFailure::new(kind, format!("scraper API HTTP {status}")));
        }

        let parsed: ScraperApiResponse = response
            .json()
            .await
            .map_err(|e| AttemptFailure::new(FetchErrorKind::InvalidResponse, e.to_string()))?;

        let Some(first) = parsed.results.into_iter().next() else {
            debug!(url = %url, "Scraper API returned no results");
            return Ok((status, String::new()));
        };

        let upstream = first.status_code.unwrap_or(status);
        if let Some(kind) = FetchErrorKind::from_status(upstream) {
            return Err(AttemptFailure::new(kind, format!("upstream HTTP {upstream}")));
        }
        Ok((upstream, first.content))
    }
}

#[async_trait]
impl PageFetcher for ProxyClient {
    async fn fetch(&self, params: &SearchParams) -> Result<FetchResponse, FetchError> {
        let url = params.search_url(&self.base_url);
        self.fetch_url(&url).await
    }

    fn source_name(&self) -> &'static str {
        match self.route {
            Route::Direct => "direct",
            Route::Forward { .. } => "forward-proxy",
            Route::ScraperApi(_) => "scraper-api",
        }
    }
}
