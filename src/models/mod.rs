use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Core listing data model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    /// Marketplace item id, the deduplication key
    pub external_id: String,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub location: Option<String>,
    pub url: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Fields we don't normalize: mileage, year, image...
    pub raw_attributes: BTreeMap<String, String>,
}

impl Listing {
    /// Stamp both timestamps with the time the page was fetched
    pub fn seen_at(mut self, at: DateTime<Utc>) -> Self {
        self.first_seen = at;
        self.last_seen = at;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// One (city, query, page) unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlTask {
    pub city: String,
    pub query: String,
    pub page: u32,
    pub state: TaskState,
    /// Times this task went in flight
    pub attempts: u32,
}

impl CrawlTask {
    pub fn new(city: impl Into<String>, query: impl Into<String>, page: u32) -> Self {
        Self {
            city: city.into(),
            query: query.into(),
            page,
            state: TaskState::Pending,
            attempts: 0,
        }
    }

    pub fn start(&mut self) {
        debug_assert_eq!(self.state, TaskState::Pending);
        self.state = TaskState::InFlight;
        self.attempts += 1;
    }

    pub fn complete(&mut self) {
        self.state = TaskState::Done;
    }

    /// Give the task back unfinished, e.g. when the crawl is cancelled mid-fetch
    pub fn cancel(&mut self) {
        if self.state == TaskState::InFlight {
            self.state = TaskState::Pending;
        }
    }

    /// Record a failure. Returns `true` when the task went back to pending.
    ///
    /// `requeue_limit` counts requeues, so a task runs at most
    /// `requeue_limit + 1` times.
    pub fn fail(&mut self, retryable: bool, requeue_limit: u32) -> bool {
        if retryable && self.attempts <= requeue_limit {
            self.state = TaskState::Pending;
            true
        } else {
            self.state = TaskState::Failed;
            false
        }
    }

    /// The task for the next page of the same chain
    pub fn next_page(&self) -> Self {
        Self::new(self.city.clone(), self.query.clone(), self.page + 1)
    }
}

/// Why a (city, query) chain stopped paginating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// A page came back with no listings
    Exhausted,
    PageLimit,
    /// A non-empty page yielded no new identifiers
    Saturated,
    Failed,
    Cancelled,
}

/// Outcome of crawling one (city, query) chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainOutcome {
    pub city: String,
    pub query: String,
    pub pages_fetched: u32,
    pub inserted: usize,
    pub updated: usize,
    pub parse_misses: usize,
    pub errors: Vec<String>,
    pub stop: StopReason,
}

impl ChainOutcome {
    pub fn new(city: &str, query: &str) -> Self {
        Self {
            city: city.to_string(),
            query: query.to_string(),
            pages_fetched: 0,
            inserted: 0,
            updated: 0,
            parse_misses: 0,
            errors: Vec::new(),
            stop: StopReason::Exhausted,
        }
    }
}

/// End-of-run report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlSummary {
    pub chains: Vec<ChainOutcome>,
}

impl CrawlSummary {
    pub fn total_inserted(&self) -> usize {
        self.chains.iter().map(|c| c.inserted).sum()
    }

    pub fn total_updated(&self) -> usize {
        self.chains.iter().map(|c| c.updated).sum()
    }

    pub fn total_failures(&self) -> usize {
        self.chains.iter().map(|c| c.errors.len()).sum()
    }

    pub fn pages_fetched(&self) -> u32 {
        self.chains.iter().map(|c| c.pages_fetched).sum()
    }
}

impl fmt::Display for CrawlSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for chain in &self.chains {
            writeln!(
                f,
                "{} / {}: {} page(s), {} new, {} updated, {} parse miss(es), {} error(s), stopped: {:?}",
                chain.city,
                chain.query,
                chain.pages_fetched,
                chain.inserted,
                chain.updated,
                chain.parse_misses,
                chain.errors.len(),
                chain.stop,
            )?;
        }
        write!(
            f,
            "total: {} inserted, {} updated, {} unrecovered failure(s)",
            self.total_inserted(),
            self.total_updated(),
            self.total_failures()
        )
    }
}
