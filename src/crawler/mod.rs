use crate::config::Settings;
use crate::error::FetchError;
use crate::models::{ChainOutcome, CrawlSummary, CrawlTask, StopReason};
use crate::scrapers::{FetchResponse, ListingExtractor, PageFetcher, RetryPolicy, SearchParams};
use crate::storage::{ListingStore, UpsertOutcome};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Knobs the crawler reads, fixed for the whole run
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    /// Pages per (city, query) chain, offsets `0..max_pages`
    pub max_pages: u32,
    pub task_requeue_limit: u32,
    /// Chains crawled at the same time
    pub concurrency: usize,
    /// Wait before a requeued page is fetched again
    pub requeue_backoff: RetryPolicy,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            max_pages: 5,
            task_requeue_limit: 1,
            concurrency: 4,
            requeue_backoff: RetryPolicy::default(),
        }
    }
}

impl CrawlOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_pages: settings.max_pages_per_query,
            task_requeue_limit: settings.task_requeue_limit,
            concurrency: settings.concurrency,
            requeue_backoff: RetryPolicy::from_settings(settings),
        }
    }
}

/// Drives fetch → extract → upsert for every (city, query) pair
pub struct Crawler {
    fetcher: Arc<dyn PageFetcher>,
    extractor: Arc<ListingExtractor>,
    store: Arc<ListingStore>,
    options: CrawlOptions,
    cancel: CancellationToken,
}

impl Crawler {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        extractor: Arc<ListingExtractor>,
        store: Arc<ListingStore>,
        options: CrawlOptions,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            store,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancelling this token stops every chain before its next page
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Crawl every city × query pair once.
    ///
    /// Chains run concurrently, up to `concurrency` at a time; pages within a
    /// chain run in order. Per-chain failures end up in the summary, they
    /// never abort the run.
    pub async fn run(&self, cities: &[String], queries: &[String]) -> CrawlSummary {
        let pairs: Vec<(String, String)> = cities
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .flat_map(|city| {
                queries
                    .iter()
                    .map(|q| q.trim())
                    .filter(|q| !q.is_empty())
                    .map(move |query| (city.to_string(), query.to_string()))
            })
            .collect();

        info!(
            chains = pairs.len(),
            concurrency = self.options.concurrency,
            source = self.fetcher.source_name(),
            "Starting crawl"
        );

        let chains = stream::iter(pairs)
            .map(|(city, query)| self.crawl_chain(city, query))
            .buffered(self.options.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let summary = CrawlSummary { chains };
        info!(
            inserted = summary.total_inserted(),
            updated = summary.total_updated(),
            failures = summary.total_failures(),
            pages = summary.pages_fetched(),
            "Crawl finished"
        );
        summary
    }

    /// Repeat [`Crawler::run`] every `interval` until `duration` has passed
    /// or the crawl is cancelled.
    pub async fn run_periodically(
        &self,
        cities: &[String],
        queries: &[String],
        interval: Duration,
        duration: Duration,
    ) -> Vec<CrawlSummary> {
        let deadline = Instant::now() + duration;
        info!(?interval, ?duration, "Starting periodic crawl");

        let mut runs = Vec::new();
        loop {
            runs.push(self.run(cities, queries).await);

            if self.cancel.is_cancelled() || Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => break,
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        info!(runs = runs.len(), "Periodic crawl finished");
        runs
    }

    async fn crawl_chain(&self, city: String, query: String) -> ChainOutcome {
        let mut outcome = ChainOutcome::new(&city, &query);
        let mut task = CrawlTask::new(city, query, 0);

        loop {
            if self.cancel.is_cancelled() {
                outcome.stop = StopReason::Cancelled;
                break;
            }
            if task.page >= self.options.max_pages {
                outcome.stop = StopReason::PageLimit;
                break;
            }

            let response = match self.fetch_task(&mut task).await {
                Ok(Some(response)) => response,
                Ok(None) => {
                    outcome.stop = StopReason::Cancelled;
                    break;
                }
                Err(err) => {
                    error!(
                        city = %task.city,
                        query = %task.query,
                        page = task.page,
                        kind = ?err.kind,
                        "Page fetch failed: {}",
                        err
                    );
                    outcome.errors.push(err.to_string());
                    outcome.stop = StopReason::Failed;
                    break;
                }
            };
            outcome.pages_fetched += 1;

            let (listings, misses) = match self.extractor.extract_all(&response.body) {
                Ok(extracted) => extracted,
                Err(err) => {
                    task.fail(false, self.options.task_requeue_limit);
                    error!(city = %task.city, query = %task.query, page = task.page, "Extraction failed: {}", err);
                    outcome.errors.push(err.to_string());
                    outcome.stop = StopReason::Failed;
                    break;
                }
            };
            outcome.parse_misses += misses;

            if listings.is_empty() {
                task.complete();
                info!(city = %task.city, query = %task.query, page = task.page, "No listings, pagination exhausted");
                outcome.stop = StopReason::Exhausted;
                break;
            }

            let found = listings.len();
            let mut new_on_page = 0;
            let mut store_failure = None;
            for listing in listings {
                let listing = listing.seen_at(response.fetched_at);
                match self.store.upsert(&listing).await {
                    Ok(UpsertOutcome::Inserted) => {
                        outcome.inserted += 1;
                        new_on_page += 1;
                    }
                    Ok(UpsertOutcome::Updated) => outcome.updated += 1,
                    Err(err) => {
                        store_failure = Some(err);
                        break;
                    }
                }
            }

            if let Some(err) = store_failure {
                task.fail(false, self.options.task_requeue_limit);
                error!(city = %task.city, query = %task.query, page = task.page, kind = ?err.kind, "Store write failed: {}", err);
                outcome.errors.push(err.to_string());
                outcome.stop = StopReason::Failed;
                break;
            }

            task.complete();
            info!(
                city = %task.city,
                query = %task.query,
                page = task.page,
                found,
                new = new_on_page,
                misses,
                "Page stored"
            );

            if new_on_page == 0 {
                outcome.stop = StopReason::Saturated;
                break;
            }
            task = task.next_page();
        }

        info!(
            city = %outcome.city,
            query = %outcome.query,
            pages = outcome.pages_fetched,
            inserted = outcome.inserted,
            updated = outcome.updated,
            stop = ?outcome.stop,
            "Chain finished"
        );
        outcome
    }

    /// Fetch the page for `task`, requeuing transient failures.
    /// `Ok(None)` means the crawl was cancelled mid-fetch.
    async fn fetch_task(&self, task: &mut CrawlTask) -> Result<Option<FetchResponse>, FetchError> {
        let params = SearchParams::new(task.city.as_str(), task.query.as_str(), task.page);

        loop {
            task.start();
            let result = tokio::select! {
                result = self.fetcher.fetch(&params) => result,
                _ = self.cancel.cancelled() => {
                    task.cancel();
                    return Ok(None);
                }
            };

            match result {
                Ok(response) => return Ok(Some(response)),
                Err(err) => {
                    if !task.fail(err.kind.is_transient(), self.options.task_requeue_limit) {
                        return Err(err);
                    }
                    let delay = self.options.requeue_backoff.delay_for(task.attempts);
                    warn!(
                        city = %task.city,
                        query = %task.query,
                        page = task.page,
                        attempts = task.attempts,
                        kind = ?err.kind,
                        delay_ms = delay.as_millis() as u64,
                        "Requeuing page"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Ok(None),
                    }
                }
            }
        }
    }
}
