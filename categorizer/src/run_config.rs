use std::{env, path::Path, result::Result};

use config::{Config, ConfigError};
use lazy_static::lazy_static;
use serde::Deserialize;

use crate::taxonomy::{Taxonomy, TaxonomyEntry};

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub key: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub temperature: f64,
}

/// Per-minute quota the external service publishes for this account,
/// minus whatever safety margin the operator wants to keep.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_min: usize,
    pub tokens_per_min: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Products per classification request.
    pub batch_size: usize,
    /// Max batches in flight at once.
    pub concurrency: usize,
    /// Cap on rows loaded per source table, mostly for test runs.
    pub limit_per_table: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    api: ApiConfig,
    model: ModelConfig,
    rate_limits: RateLimitConfig,
    pipeline: PipelineConfig,
    taxonomy: Vec<TaxonomyEntry>,
}

#[derive(Debug)]
pub struct RunConfig {
    pub api: ApiConfig,
    pub model: ModelConfig,
    pub rate_limits: RateLimitConfig,
    pub pipeline: PipelineConfig,
    pub taxonomy: Taxonomy,
}

fn config_root() -> String {
    env::var("APP_DIR").unwrap_or_else(|_| {
        let dir =
            env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR or APP_DIR is required");
        let dir = Path::new(&dir).parent().unwrap().display().to_string();
        format!("{}/config", dir)
    })
}

fn load(path: &str) -> Result<ConfigFile, ConfigError> {
    let builder = Config::builder()
        .add_source(config::File::with_name(path))
        .build()?;

    let mut file: ConfigFile = builder.try_deserialize()?;

    // The API key may live in the environment instead of the config file.
    if let Ok(key) = env::var("CATEGORIZER_API_KEY") {
        file.api.key = key;
    }

    Ok(file)
}

fn validate(file: ConfigFile) -> RunConfig {
    if file.pipeline.batch_size == 0 {
        panic!("pipeline.batch_size must be at least 1");
    }
    if file.pipeline.concurrency == 0 {
        panic!("pipeline.concurrency must be at least 1");
    }
    if file.rate_limits.requests_per_min == 0 || file.rate_limits.tokens_per_min == 0 {
        panic!("rate_limits must be non-zero");
    }
    let taxonomy = Taxonomy::new(file.taxonomy).expect("Invalid taxonomy in config");

    RunConfig {
        api: file.api,
        model: file.model,
        rate_limits: file.rate_limits,
        pipeline: file.pipeline,
        taxonomy,
    }
}

lazy_static! {
    pub static ref cfg: RunConfig = {
        let path = format!("{}/categorizer", config_root());
        let file = load(&path)
            .unwrap_or_else(|e| panic!("Failed to load config from {path}.toml: {e}"));
        validate(file)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shipped_config_parses_and_validates() {
        let path = format!("{}/categorizer", config_root());
        let file = load(&path).expect("shipped config should parse");
        let config = validate(file);

        assert!(config.pipeline.batch_size >= 1);
        assert!(config.pipeline.concurrency >= 1);
        assert!(config.rate_limits.requests_per_min > 0);
        assert!(config.rate_limits.tokens_per_min > 0);
        assert!(config.taxonomy.contains_main(crate::taxonomy::FALLBACK_MAIN));
        assert!(config.api.endpoint.starts_with("https://"));
    }
}
