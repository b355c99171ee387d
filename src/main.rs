use anyhow::Context;
use marketplace_scout::{
    CrawlOptions, Crawler, ListingExtractor, ListingStore, ProxyClient, ProxyClientConfig,
    Settings,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "config/default";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());

    info!("🚗 Marketplace Scout");
    info!("Loading configuration from {}", config_path);

    let settings = Settings::from_file(&config_path)
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    // Readiness: the database must be reachable before any task starts
    let store = ListingStore::connect(&settings.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", settings.database_path))?;
    store.ping().await.context("Database readiness check failed")?;
    let store = Arc::new(store);

    let proxy_config = ProxyClientConfig::from_settings(&settings)?;
    let extractor = ListingExtractor::new(proxy_config.base_url.clone(), &settings.selectors)
        .context("Invalid listing selectors")?;
    let client = ProxyClient::new(proxy_config)?;
    info!(
        "Routing requests via {} ({} attempt(s) per page)",
        client.endpoint(),
        settings.retry_limit
    );

    let crawler = Crawler::new(
        Arc::new(client),
        Arc::new(extractor),
        Arc::clone(&store),
        CrawlOptions::from_settings(&settings),
    );

    let cancel = crawler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current page");
            cancel.cancel();
        }
    });

    let summaries = match &settings.schedule {
        Some(schedule) => {
            crawler
                .run_periodically(
                    &settings.cities,
                    &settings.queries,
                    schedule.interval(),
                    schedule.duration(),
                )
                .await
        }
        None => vec![crawler.run(&settings.cities, &settings.queries).await],
    };

    for (i, summary) in summaries.iter().enumerate() {
        if summaries.len() > 1 {
            println!("Run {}:", i + 1);
        }
        println!("{summary}");
        println!();
    }

    let stored = store.count().await.context("Failed to count stored listings")?;
    info!("💾 {} listings stored in {}", stored, settings.database_path);
    store.close().await;

    Ok(())
}
