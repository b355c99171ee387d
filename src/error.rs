use thiserror::Error;

/// Why a page fetch failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FetchErrorKind {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited or soft-blocked")]
    RateLimited,
    #[error("page not found")]
    NotFound,
    #[error("proxy rejected credentials")]
    ProxyAuthFailure,
    #[error("connection failed")]
    Connect,
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("invalid response")]
    InvalidResponse,
}

impl FetchErrorKind {
    /// Map an HTTP status code to a failure kind, `None` for success
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            403 | 429 | 503 => Some(Self::RateLimited),
            404 | 410 => Some(Self::NotFound),
            407 => Some(Self::ProxyAuthFailure),
            // a proxy exit that could not reach or hear back from upstream
            502 => Some(Self::Connect),
            504 => Some(Self::Timeout),
            other => Some(Self::Status(other)),
        }
    }

    /// Kinds the proxy client retries before giving up.
    ///
    /// Proxy-auth failures are retried by the client but never requeued by
    /// the crawler, see [`FetchErrorKind::is_transient`].
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::Connect | Self::ProxyAuthFailure
        )
    }

    /// Kinds worth requeuing at the task level once the client gave up
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited | Self::Connect)
    }
}

/// A fetch that failed for good, after `attempts` tries
#[derive(Debug, Clone, Error)]
#[error("{kind} fetching {url} after {attempts} attempt(s): {detail}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub url: String,
    pub attempts: u32,
    pub detail: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            attempts: 1,
            detail: detail.into(),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("document is not parseable as HTML: {reason}")]
    MalformedDocument { reason: String },

    #[error("invalid CSS selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    WriteFailed,
    ConnectionLost,
}

#[derive(Debug, Error)]
#[error("store {operation} failed ({kind:?})")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub operation: &'static str,
    #[source]
    pub source: sqlx::Error,
}

impl StoreError {
    pub fn new(operation: &'static str, source: sqlx::Error) -> Self {
        let kind = match &source {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreErrorKind::ConnectionLost
            }
            _ => StoreErrorKind::WriteFailed,
        };
        Self {
            kind,
            operation,
            source,
        }
    }
}
