//! One classification call per batch, with positional alignment and
//! failure substitution so the caller always gets exactly one answer per
//! input product.

use crate::prompt::{
    batch_user_prompt, parse_batch_answer, system_prompt, ClassifyClient, PromptPass,
    RawBatchEntry,
};
use crate::source::Product;
use crate::taxonomy::{Taxonomy, FALLBACK_MAIN, FALLBACK_SUB};

/// Reasoning text on entries padded in when the service answered for fewer
/// products than it was sent. `loadPending` treats it as a retry marker, so
/// the exact string matters.
pub const MISSING_FROM_BATCH: &str = "Missing from batch response";

const DEFAULT_CONFIDENCE: f32 = 0.5;

/// Answer for one product from one classification pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryAnswer {
    pub label: String,
    pub confidence: f32,
    pub reasoning: Option<String>,
}

impl CategoryAnswer {
    pub fn fallback(label: &str, reasoning: String) -> Self {
        Self {
            label: label.to_string(),
            confidence: 0.0,
            reasoning: Some(reasoning),
        }
    }
}

/// Merged result of both passes for one product.
#[derive(Debug, Clone, PartialEq)]
pub struct Categorization {
    pub main_category: String,
    pub main_confidence: f32,
    pub main_reasoning: Option<String>,
    pub sub_category: String,
    pub sub_confidence: f32,
    pub sub_reasoning: Option<String>,
}

/// Label substituted when the service omits or garbles an entry: the
/// top-level miscellaneous category for the coarse pass, the group's first
/// subcategory for the fine pass.
pub fn fallback_label<'a>(pass: &'a PromptPass, taxonomy: &'a Taxonomy) -> &'a str {
    match pass {
        PromptPass::Coarse => FALLBACK_MAIN,
        PromptPass::Fine { main } => taxonomy
            .subs_for(main)
            .and_then(|subs| subs.first())
            .map(String::as_str)
            .unwrap_or(FALLBACK_SUB),
    }
}

/// Classify one batch with exactly one external call.
///
/// Always returns `products.len()` answers in input order: a transport or
/// parse failure substitutes fallback answers for the whole batch, a short
/// response is padded with [`MISSING_FROM_BATCH`] entries, a long response
/// is truncated.
pub async fn classify_batch<C: ClassifyClient>(
    client: &C,
    taxonomy: &Taxonomy,
    pass: &PromptPass,
    products: &[&Product],
) -> Vec<CategoryAnswer> {
    let fallback = fallback_label(pass, taxonomy);
    let system = system_prompt(pass, taxonomy);
    let user = batch_user_prompt(products);

    let content = match client.complete(system, user).await {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!("Batch classification call failed: {e}");
            return products
                .iter()
                .map(|_| CategoryAnswer::fallback(fallback, format!("Error: {e}")))
                .collect();
        }
    };

    let entries = match parse_batch_answer(&content) {
        Some(entries) => entries,
        None => {
            tracing::warn!("Malformed batch response: {}", truncate(&content, 200));
            return products
                .iter()
                .map(|_| {
                    CategoryAnswer::fallback(fallback, "Malformed batch response".to_string())
                })
                .collect();
        }
    };

    if entries.len() < products.len() {
        tracing::warn!(
            "Expected {} batch entries, got {}",
            products.len(),
            entries.len()
        );
    }

    let mut answers: Vec<CategoryAnswer> = entries
        .into_iter()
        .take(products.len())
        .map(|entry| resolve_entry(entry, fallback))
        .collect();

    while answers.len() < products.len() {
        answers.push(CategoryAnswer::fallback(
            fallback,
            MISSING_FROM_BATCH.to_string(),
        ));
    }

    answers
}

fn resolve_entry(entry: RawBatchEntry, fallback: &str) -> CategoryAnswer {
    CategoryAnswer {
        label: entry.label.unwrap_or_else(|| fallback.to_string()),
        confidence: entry
            .confidence
            .unwrap_or(DEFAULT_CONFIDENCE)
            .clamp(0.0, 1.0),
        reasoning: entry.reasoning,
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{product, taxonomy, StubClassifier};

    fn products() -> Vec<Product> {
        vec![
            product("1", "Penne Rigate"),
            product("2", "Sparkling Water"),
            product("3", "Dish Soap"),
        ]
    }

    #[tokio::test]
    async fn aligned_response_maps_in_order() {
        let client = StubClassifier::ok(
            r#"{"products": [
                {"label": "Food", "confidence": 0.9, "reasoning": "pasta"},
                {"label": "Drinks", "confidence": 0.8},
                {"label": "Household", "confidence": 0.7}
            ]}"#,
        );
        let items = products();
        let refs: Vec<&Product> = items.iter().collect();

        let answers = classify_batch(&client, &taxonomy(), &PromptPass::Coarse, &refs).await;
        assert_eq!(answers.len(), 3);
        assert_eq!(answers[0].label, "Food");
        assert_eq!(answers[1].label, "Drinks");
        assert_eq!(answers[2].label, "Household");
    }

    #[tokio::test]
    async fn short_response_is_padded_with_the_sentinel() {
        let client = StubClassifier::ok(
            r#"{"products": [{"label": "Food", "confidence": 0.9, "reasoning": "pasta"}]}"#,
        );
        let items = products();
        let refs: Vec<&Product> = items.iter().collect();

        let answers = classify_batch(&client, &taxonomy(), &PromptPass::Coarse, &refs).await;
        assert_eq!(answers.len(), 3);
        assert_eq!(answers[0].label, "Food");
        assert_eq!(answers[0].confidence, 0.9);
        for padded in &answers[1..] {
            assert_eq!(padded.label, FALLBACK_MAIN);
            assert_eq!(padded.confidence, 0.0);
            assert_eq!(padded.reasoning.as_deref(), Some(MISSING_FROM_BATCH));
        }
    }

    #[tokio::test]
    async fn long_response_is_truncated() {
        let client = StubClassifier::ok(
            r#"{"products": [
                {"label": "Food", "confidence": 0.9},
                {"label": "Drinks", "confidence": 0.8},
                {"label": "Household", "confidence": 0.7},
                {"label": "Food", "confidence": 0.6},
                {"label": "Food", "confidence": 0.5}
            ]}"#,
        );
        let items = products();
        let refs: Vec<&Product> = items.iter().collect();

        let answers = classify_batch(&client, &taxonomy(), &PromptPass::Coarse, &refs).await;
        assert_eq!(answers.len(), 3);
        assert_eq!(answers[2].label, "Household");
    }

    #[tokio::test]
    async fn transport_failure_substitutes_the_whole_batch() {
        let client = StubClassifier::failing("connection reset");
        let items = products();
        let refs: Vec<&Product> = items.iter().collect();

        let answers = classify_batch(&client, &taxonomy(), &PromptPass::Coarse, &refs).await;
        assert_eq!(answers.len(), 3);
        for answer in &answers {
            assert_eq!(answer.label, FALLBACK_MAIN);
            assert_eq!(answer.confidence, 0.0);
            let reasoning = answer.reasoning.as_deref().unwrap();
            assert!(reasoning.starts_with("Error:"));
            // Padding sentinel is reserved for positional under-delivery.
            assert_ne!(reasoning, MISSING_FROM_BATCH);
        }
    }

    #[tokio::test]
    async fn malformed_response_substitutes_with_distinct_reasoning() {
        let client = StubClassifier::ok("I could not categorize these products, sorry.");
        let items = products();
        let refs: Vec<&Product> = items.iter().collect();

        let answers = classify_batch(&client, &taxonomy(), &PromptPass::Coarse, &refs).await;
        assert_eq!(answers.len(), 3);
        for answer in &answers {
            assert_eq!(answer.confidence, 0.0);
            assert_eq!(answer.reasoning.as_deref(), Some("Malformed batch response"));
        }
    }

    #[tokio::test]
    async fn missing_fields_get_defaults() {
        let client = StubClassifier::ok(
            r#"{"products": [{"reasoning": "no idea"}, {"label": "Drinks", "confidence": 1.7}, {}]}"#,
        );
        let items = products();
        let refs: Vec<&Product> = items.iter().collect();

        let answers = classify_batch(&client, &taxonomy(), &PromptPass::Coarse, &refs).await;
        assert_eq!(answers[0].label, FALLBACK_MAIN);
        assert_eq!(answers[0].confidence, DEFAULT_CONFIDENCE);
        assert_eq!(answers[0].reasoning.as_deref(), Some("no idea"));
        // Out-of-range confidence is clamped.
        assert_eq!(answers[1].confidence, 1.0);
        assert!(answers[2].reasoning.is_none());
    }

    #[tokio::test]
    async fn fine_pass_falls_back_to_the_groups_first_subcategory() {
        let client = StubClassifier::ok(r#"{"products": []}"#);
        let items = vec![product("1", "Penne Rigate")];
        let refs: Vec<&Product> = items.iter().collect();
        let pass = PromptPass::Fine {
            main: "Food".to_string(),
        };

        let answers = classify_batch(&client, &taxonomy(), &pass, &refs).await;
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].label, "Pasta");
        assert_eq!(answers[0].reasoning.as_deref(), Some(MISSING_FROM_BATCH));
    }
}
