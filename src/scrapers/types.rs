use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Search parameters for one results page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    /// City slug as the marketplace spells it, e.g. "toronto"
    pub city: String,
    /// Free-text search terms
    pub query: String,
    /// Zero-based page offset
    pub page: u32,
}

impl SearchParams {
    pub fn new(city: impl Into<String>, query: impl Into<String>, page: u32) -> Self {
        Self {
            city: city.into(),
            query: query.into(),
            page,
        }
    }

    /// Build the search URL under `base`
    pub fn search_url(&self, base: &Url) -> Url {
        let mut url = base.clone();
        url.set_path(&format!("/marketplace/{}/search/", self.city.trim()));
        url.set_query(None);
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("query", self.query.trim());
            pairs.append_pair("exact", "false");
            if self.page > 0 {
                pairs.append_pair("page", &self.page.to_string());
            }
        }
        url
    }
}

/// A page that came back successfully
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}
