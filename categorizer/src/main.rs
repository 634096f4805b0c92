mod classify;
mod error;
mod model;
mod pipeline;
mod prompt;
mod rate_limiters;
mod run_config;
mod source;
mod taxonomy;
#[cfg(test)]
mod testing;

use std::env;
use std::sync::Arc;
use std::time::Instant;

use sea_orm::{ConnectOptions, Database};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use classify::Categorization;
use model::categorized_product::CategorizedProductCtrl;
use pipeline::{PipelineSettings, TwoStagePipeline};
use prompt::mistral::MistralClient;
use rate_limiters::RateLimiter;
use run_config::cfg;
use source::Product;

pub type HttpClient = reqwest::Client;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(false))
        .init();

    // Force the config to load up front so a bad file aborts the run
    // before anything is scheduled or persisted.
    lazy_static::initialize(&cfg);
    if cfg.api.key.is_empty() {
        anyhow::bail!("API key missing: set api.key in categorizer.toml or CATEGORIZER_API_KEY");
    }

    let db_url = env::var("DATABASE_URL").expect("DATABASE_URL is not set in .env file");
    let mut db_options = ConnectOptions::new(db_url);
    db_options.sqlx_logging(false);
    let conn = Database::connect(db_options)
        .await
        .expect("Database connection failed");

    let products = source::load_pending_products(&conn, cfg.pipeline.limit_per_table).await?;
    if products.is_empty() {
        tracing::info!("No products need categorization");
        return Ok(());
    }

    let http_client = reqwest::ClientBuilder::new().use_rustls_tls().build()?;
    let limiter = RateLimiter::from_config();
    let pipeline = TwoStagePipeline::new(
        MistralClient::new(http_client),
        limiter.clone(),
        Arc::new(cfg.taxonomy.clone()),
        PipelineSettings::from_config(),
    );

    tracing::info!(
        "Starting categorization of {} products (batch size {}, concurrency {})",
        products.len(),
        cfg.pipeline.batch_size,
        cfg.pipeline.concurrency
    );
    let started = Instant::now();
    let results = pipeline.run(products).await;
    let saved = CategorizedProductCtrl::upsert_many(&conn, &results).await?;

    let stats = limiter.stats().await;
    let elapsed = started.elapsed().as_secs_f64();
    tracing::info!(
        "Categorization complete: {} products in {:.1}m ({:.1}/s), {} API requests, {} estimated tokens, {} records saved",
        results.len(),
        elapsed / 60.0,
        results.len() as f64 / elapsed.max(f64::EPSILON),
        stats.total_requests,
        stats.total_tokens,
        saved
    );

    log_quality_analysis(&results);
    Ok(())
}

/// Confidence-bucket summary so degraded results stand out in the run log.
fn log_quality_analysis(results: &[(Product, Categorization)]) {
    let mut high = 0usize;
    let mut good = 0usize;
    let mut medium = 0usize;
    let mut low = 0usize;
    let mut errors = 0usize;

    for (_, cat) in results {
        match cat.sub_confidence {
            c if c == 0.0 => errors += 1,
            c if c >= 0.9 => high += 1,
            c if c >= 0.7 => good += 1,
            c if c >= 0.5 => medium += 1,
            _ => low += 1,
        }
    }

    let total = results.len().max(1);
    let pct = |n: usize| n * 100 / total;
    tracing::info!(
        "Quality: high {} ({}%), good {} ({}%), medium {} ({}%), low {} ({}%), failed {} ({}%)",
        high,
        pct(high),
        good,
        pct(good),
        medium,
        pct(medium),
        low,
        pct(low),
        errors,
        pct(errors)
    );

    for (product, cat) in results.iter().take(5) {
        tracing::info!(
            "  {} -> {} / {} ({:.2})",
            product.name,
            cat.main_category,
            cat.sub_category,
            cat.sub_confidence
        );
    }
}
