mod common;

use marketplace_scout::config::{ProxyMode, ScraperApiSettings};
use marketplace_scout::scrapers::{RetryPolicy, SearchParams};
use marketplace_scout::{
    CrawlOptions, Crawler, FetchErrorKind, ListingExtractor, ListingStore, PageFetcher,
    ProxyClient, ProxyClientConfig, StopReason,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

/// Matches on the `page` query parameter, `None` meaning absent
struct PageParam(Option<&'static str>);

impl Match for PageParam {
    fn matches(&self, request: &Request) -> bool {
        let page = request
            .url
            .query_pairs()
            .find(|(k, _)| k == "page")
            .map(|(_, v)| v.into_owned());
        page.as_deref() == self.0
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: Duration::ZERO,
    }
}

fn direct_client(server: &MockServer, max_attempts: u32) -> ProxyClient {
    let mut config = ProxyClientConfig::direct(Url::parse(&server.uri()).unwrap());
    config.retry = fast_retry(max_attempts);
    ProxyClient::new(config).unwrap()
}

fn toronto_sedan() -> SearchParams {
    SearchParams::new("toronto", "sedan", 0)
}

#[tokio::test]
async fn fetches_search_page_with_city_and_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/marketplace/toronto/search/"))
        .and(query_param("query", "sedan"))
        .and(query_param("exact", "false"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let client = direct_client(&server, 3);
    let response = client.fetch(&toronto_sedan()).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, "<html>ok</html>");
    assert!(response.url.contains("/marketplace/toronto/search/"));
}

#[tokio::test]
async fn rate_limited_is_retried_exactly_retry_limit_times() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let client = direct_client(&server, 3);
    let err = client.fetch(&toronto_sedan()).await.unwrap_err();

    assert_eq!(err.kind, FetchErrorKind::RateLimited);
    assert_eq!(err.attempts, 3);
}

#[tokio::test]
async fn not_found_fails_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let client = direct_client(&server, 5);
    let err = client.fetch(&toronto_sedan()).await.unwrap_err();

    assert_eq!(err.kind, FetchErrorKind::NotFound);
    assert_eq!(err.attempts, 1);
}

#[tokio::test]
async fn soft_block_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .expect(1)
        .mount(&server)
        .await;

    let client = direct_client(&server, 3);
    let response = client.fetch(&toronto_sedan()).await.unwrap();
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn bad_gateway_from_proxy_exit_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>second try</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let client = direct_client(&server, 3);
    let response = client.fetch(&toronto_sedan()).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "<html>second try</html>");
}

#[tokio::test]
async fn gateway_timeout_exhausts_retries_as_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(504))
        .expect(3)
        .mount(&server)
        .await;

    let client = direct_client(&server, 3);
    let err = client.fetch(&toronto_sedan()).await.unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::Timeout);
    assert_eq!(err.attempts, 3);
}

#[tokio::test]
async fn slow_responses_time_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .expect(2)
        .mount(&server)
        .await;

    let mut config = ProxyClientConfig::direct(Url::parse(&server.uri()).unwrap());
    config.retry = fast_retry(2);
    config.timeout = Duration::from_millis(100);
    let client = ProxyClient::new(config).unwrap();

    let err = client.fetch(&toronto_sedan()).await.unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::Timeout);
    assert_eq!(err.attempts, 2);
}

#[tokio::test]
async fn unreachable_endpoint_is_a_connection_failure() {
    // nothing listens on the discard port
    let mut config = ProxyClientConfig::direct(Url::parse("http://127.0.0.1:9").unwrap());
    config.retry = fast_retry(2);
    let client = ProxyClient::new(config).unwrap();

    let err = client.fetch(&toronto_sedan()).await.unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::Connect);
    assert_eq!(err.attempts, 2);
}

fn scraper_api_client(server: &MockServer, target: &str) -> ProxyClient {
    let mut config = ProxyClientConfig::direct(Url::parse(target).unwrap());
    config.mode = ProxyMode::ScraperApi;
    config.scraper_api = Some(ScraperApiSettings {
        endpoint: format!("{}/v2/scrape", server.uri()),
        token: "Basic c2NvdXQ6c2VjcmV0".to_string(),
        locale: "en-US".to_string(),
    });
    config.retry = fast_retry(3);
    ProxyClient::new(config).unwrap()
}

#[tokio::test]
async fn scraper_api_unwraps_first_result() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/scrape"))
        .and(header("authorization", "Basic c2NvdXQ6c2VjcmV0"))
        .and(body_json(json!({
            "target": "universal",
            "locale": "en-US",
            "device_type": "desktop",
            "headless": "html",
            "url": "https://www.facebook.com/marketplace/toronto/search/?query=sedan&exact=false",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "content": "<html>cards</html>", "status_code": 200 }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = scraper_api_client(&server, "https://www.facebook.com");
    assert_eq!(client.source_name(), "scraper-api");

    let response = client.fetch(&toronto_sedan()).await.unwrap();
    assert_eq!(response.body, "<html>cards</html>");
}

#[tokio::test]
async fn scraper_api_without_results_is_an_empty_page() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [] })))
        .mount(&server)
        .await;

    let client = scraper_api_client(&server, "https://www.facebook.com");
    let response = client.fetch(&toronto_sedan()).await.unwrap();
    assert!(response.body.is_empty());
}

#[tokio::test]
async fn scraper_api_upstream_block_is_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "content": "blocked", "status_code": 429 }]
        })))
        .expect(3)
        .mount(&server)
        .await;

    let client = scraper_api_client(&server, "https://www.facebook.com");
    let err = client.fetch(&toronto_sedan()).await.unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::RateLimited);
}

#[tokio::test]
async fn scraper_api_bad_token_is_proxy_auth_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .expect(3)
        .mount(&server)
        .await;

    let client = scraper_api_client(&server, "https://www.facebook.com");
    let err = client.fetch(&toronto_sedan()).await.unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::ProxyAuthFailure);
    assert_eq!(err.attempts, 3);
}

#[tokio::test]
async fn crawl_over_http_into_store() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/marketplace/toronto/search/"))
        .and(PageParam(None))
        .respond_with(ResponseTemplate::new(200).set_body_string(common::search_page(&["A", "B"])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/marketplace/toronto/search/"))
        .and(PageParam(Some("1")))
        .respond_with(ResponseTemplate::new(200).set_body_string(common::search_page(&["A", "C"])))
        .expect(1)
        .mount(&server)
        .await;

    let base = Url::parse(&server.uri()).unwrap();
    let client = direct_client(&server, 3);
    let extractor = ListingExtractor::with_default_selectors(base).unwrap();
    let store = Arc::new(ListingStore::in_memory().await.unwrap());
    let crawler = Crawler::new(
        Arc::new(client),
        Arc::new(extractor),
        store.clone(),
        CrawlOptions {
            max_pages: 2,
            task_requeue_limit: 1,
            concurrency: 1,
            requeue_backoff: fast_retry(3),
        },
    );

    let summary = crawler
        .run(&["toronto".to_string()], &["sedan".to_string()])
        .await;

    assert_eq!(summary.chains[0].stop, StopReason::PageLimit);
    assert_eq!(store.count().await.unwrap(), 3);

    let a = store.get("A").await.unwrap().unwrap();
    assert!(a.last_seen >= a.first_seen);
    assert_eq!(a.url, format!("{}/marketplace/item/A/", server.uri()));
}
