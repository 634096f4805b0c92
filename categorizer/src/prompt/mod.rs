pub mod mistral;

use std::future::Future;

use indoc::formatdoc;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::source::Product;
use crate::taxonomy::Taxonomy;

/// Seam between the pipeline and the external chat-completions service.
/// The real implementation is [`mistral::MistralClient`]; tests stub it.
pub trait ClassifyClient: Clone + Send + Sync + 'static {
    /// Sends one system/user prompt pair, returns the raw answer content.
    fn complete(
        &self,
        system_prompt: String,
        user_content: String,
    ) -> impl Future<Output = AppResult<String>> + Send;
}

/// Which classification pass a prompt is built for.
#[derive(Debug, Clone)]
pub enum PromptPass {
    /// Stage 1: pick a main category from the full taxonomy.
    Coarse,
    /// Stage 2: pick a subcategory within an already-assigned main category.
    Fine { main: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PromptUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ModelLength,
    Error,
    ToolCalls,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: i32,
    pub message: ChatMessage,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiResponse {
    pub choices: Vec<ChatChoice>,
    pub usage: PromptUsage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiError {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatApiResponseOrError {
    Response(ChatApiResponse),
    Error(ChatApiError),
}

/// One per-product entry parsed out of the batch answer. Fields the model
/// omitted stay `None`; the classification stage fills in defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBatchEntry {
    pub label: Option<String>,
    pub confidence: Option<f32>,
    pub reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBatchAnswer {
    products: Vec<RawBatchEntry>,
}

/// Parse the model's JSON answer into ordered per-product entries.
/// Returns None if the content is not JSON or lacks the `products` array.
pub fn parse_batch_answer(content: &str) -> Option<Vec<RawBatchEntry>> {
    serde_json::from_str::<RawBatchAnswer>(content)
        .ok()
        .map(|answer| answer.products)
}

pub fn system_prompt(pass: &PromptPass, taxonomy: &Taxonomy) -> String {
    let (task, vocabulary) = match pass {
        PromptPass::Coarse => (
            "Assign each product below ONE main category from this taxonomy \
             (subcategories are listed for context only; the label you return \
             is the main category):"
                .to_string(),
            taxonomy.compressed(),
        ),
        PromptPass::Fine { main } => {
            let subs = taxonomy.subs_for(main).unwrap_or(&[]);
            (
                format!(
                    "All products below belong to the main category \"{main}\". \
                     Assign each ONE subcategory from this list:"
                ),
                subs.join(", "),
            )
        }
    };

    formatdoc! {r#"
        You are a product categorization expert for supermarket catalogs.

        {task}

        {vocabulary}

        RULES:
        1. Choose the most specific and relevant label
        2. If multiple labels fit, choose the primary use case
        3. Confidence scoring:
           - 0.9-1.0: Clear match
           - 0.7-0.89: Good match, minor ambiguity
           - 0.5-0.69: Multiple options, chose most likely
           - <0.5: Uncertain, needs review
        4. Return labels IN THE SAME ORDER as the input products
        5. Keep reasoning brief (1 sentence)

        Respond ONLY with a JSON object with a "products" array containing one
        {{"label", "confidence", "reasoning"}} object per input product, in order."#
    }
}

pub fn batch_user_prompt(products: &[&Product]) -> String {
    let listing = products
        .iter()
        .enumerate()
        .map(|(i, p)| {
            formatdoc! {"
                Product {n}:
                Name: {name}
                Description: {description}
                Source categories: {existing}",
                n = i + 1,
                name = p.name,
                description = if p.description.is_empty() { "None" } else { p.description.as_str() },
                existing = if p.existing_categories.is_empty() { "None" } else { p.existing_categories.as_str() },
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "{listing}\n\nReturn a JSON object with a \"products\" array containing \
         labels for ALL products above, in order."
    )
}

// Token estimation mirrors what the hosted endpoint bills for: a roughly
// constant system prompt + taxonomy component, the user content at ~4
// characters per token, and ~100 output tokens per product.
const SYSTEM_PROMPT_TOKENS: u64 = 350;
const TAXONOMY_TOKENS: u64 = 800;
const OUTPUT_TOKENS_PER_PRODUCT: u64 = 100;

pub fn estimate_batch_tokens(products: &[&Product]) -> u64 {
    let user_chars = batch_user_prompt(products).chars().count() as u64;
    SYSTEM_PROMPT_TOKENS
        + TAXONOMY_TOKENS
        + user_chars / 4
        + products.len() as u64 * OUTPUT_TOKENS_PER_PRODUCT
}
