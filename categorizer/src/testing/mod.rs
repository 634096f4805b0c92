//! Shared helpers for unit tests: a scripted classifier and small fixtures.

use std::sync::{Arc, Mutex};

use crate::error::{AppError, AppResult};
use crate::prompt::ClassifyClient;
use crate::source::Product;
use crate::taxonomy::{Taxonomy, TaxonomyEntry, FALLBACK_MAIN, FALLBACK_SUB};

type Handler = dyn Fn(&str, &str) -> AppResult<String> + Send + Sync;

/// Classifier stub driven by a handler closure. Records every prompt pair
/// it was sent so tests can assert on vocabulary restriction and call count.
#[derive(Clone)]
pub struct StubClassifier {
    handler: Arc<Handler>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl StubClassifier {
    pub fn new(handler: impl Fn(&str, &str) -> AppResult<String> + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always answers with the given content.
    pub fn ok(content: &str) -> Self {
        let content = content.to_string();
        Self::new(move |_, _| Ok(content.clone()))
    }

    /// Always fails at the transport level.
    pub fn failing(message: &str) -> Self {
        let message = message.to_string();
        Self::new(move |_, _| Err(AppError::Internal(anyhow::anyhow!(message.clone()))))
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ClassifyClient for StubClassifier {
    async fn complete(&self, system_prompt: String, user_content: String) -> AppResult<String> {
        let result = (self.handler)(&system_prompt, &user_content);
        self.calls.lock().unwrap().push((system_prompt, user_content));
        result
    }
}

pub fn product(id: &str, name: &str) -> Product {
    Product {
        id: id.to_string(),
        name: name.to_string(),
        description: String::new(),
        existing_categories: String::new(),
        market: "test_market".to_string(),
    }
}

pub fn taxonomy() -> Taxonomy {
    let entry = |main: &str, subs: &[&str]| TaxonomyEntry {
        main: main.to_string(),
        subs: subs.iter().map(|s| s.to_string()).collect(),
    };
    Taxonomy::new(vec![
        entry("Food", &["Pasta", "Flour"]),
        entry("Drinks", &["Water", "Coffee"]),
        entry("Household", &["Cleaning", "Laundry"]),
        entry(FALLBACK_MAIN, &[FALLBACK_SUB]),
    ])
    .unwrap()
}
