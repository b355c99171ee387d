#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use marketplace_scout::scrapers::{FetchResponse, SearchParams};
use marketplace_scout::{FetchError, FetchErrorKind, PageFetcher};
use std::sync::Mutex;

type Responder = dyn Fn(&SearchParams, usize) -> Result<FetchResponse, FetchError> + Send + Sync;

/// Fetcher that answers from a closure and records every call
pub struct ScriptedFetcher {
    responder: Box<Responder>,
    calls: Mutex<Vec<SearchParams>>,
}

impl ScriptedFetcher {
    /// `responder` gets the params and how many times this exact page was asked for before
    pub fn new(
        responder: impl Fn(&SearchParams, usize) -> Result<FetchResponse, FetchError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<SearchParams> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, params: &SearchParams) -> Result<FetchResponse, FetchError> {
        let previous = {
            let mut calls = self.calls.lock().unwrap();
            let previous = calls.iter().filter(|p| *p == params).count();
            calls.push(params.clone());
            previous
        };
        (self.responder)(params, previous)
    }

    fn source_name(&self) -> &'static str {
        "scripted"
    }
}

/// Fetcher whose requests never complete
pub struct HangingFetcher;

#[async_trait]
impl PageFetcher for HangingFetcher {
    async fn fetch(&self, _params: &SearchParams) -> Result<FetchResponse, FetchError> {
        std::future::pending().await
    }

    fn source_name(&self) -> &'static str {
        "hanging"
    }
}

pub fn fetch_time(page: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 2, 10, page, 0).unwrap()
}

pub fn page(params: &SearchParams, ids: &[&str]) -> Result<FetchResponse, FetchError> {
    Ok(FetchResponse {
        url: format!("scripted://{}/{}/{}", params.city, params.query, params.page),
        status: 200,
        body: search_page(ids),
        fetched_at: fetch_time(params.page),
    })
}

pub fn failure(params: &SearchParams, kind: FetchErrorKind) -> Result<FetchResponse, FetchError> {
    Err(FetchError::new(
        kind,
        format!("scripted://{}/{}/{}", params.city, params.query, params.page),
        "scripted failure",
    )
    .with_attempts(3))
}

/// A search results page with one card per id
pub fn search_page(ids: &[&str]) -> String {
    let cards: String = ids
        .iter()
        .map(|id| {
            format!(
                r#"<div class="x9f619 x78zum5"><a href="/marketplace/item/{id}/?ref=search" role="link" tabindex="0">
                     <img alt="2018 Honda Accord {id}" src="https://scontent.example/{id}.jpg">
                     <div><span dir="auto">$18,900</span></div>
                     <div><span style="-webkit-line-clamp: 2;">2018 Honda Accord {id}</span></div>
                     <div><span>Toronto, ON</span></div>
                     <div><span>64K km</span></div>
                   </a></div>"#
            )
        })
        .collect();
    format!(
        "<!DOCTYPE html><html><head><title>Marketplace</title></head><body><div role=\"main\">{cards}</div></body></html>"
    )
}
