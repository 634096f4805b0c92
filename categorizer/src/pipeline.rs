//! Two-stage classification pipeline.
//!
//! Stage 1 assigns every product a main category; once all coarse batches
//! have finished (hard barrier, not a stream), products are regrouped by
//! that label and stage 2 assigns a subcategory within each group's own
//! vocabulary. Both stages compete for one semaphore and one rate limiter.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::classify::{classify_batch, fallback_label, CategoryAnswer, Categorization};
use crate::prompt::{estimate_batch_tokens, ClassifyClient, PromptPass};
use crate::rate_limiters::RateLimiter;
use crate::source::Product;
use crate::taxonomy::{Taxonomy, FALLBACK_MAIN};

const PROGRESS_LOG_EVERY: usize = 10;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub concurrency: usize,
}

impl PipelineSettings {
    pub fn from_config() -> Self {
        let pipeline = &crate::run_config::cfg.pipeline;
        Self {
            batch_size: pipeline.batch_size,
            concurrency: pipeline.concurrency,
        }
    }
}

/// Slice an ordered index list into fixed-size batches, last batch shorter.
/// Input order is preserved and no index lands in two batches.
pub fn plan_batches(indices: &[usize], batch_size: usize) -> Vec<Vec<usize>> {
    assert!(batch_size > 0, "batch_size must be at least 1");
    indices.chunks(batch_size).map(|c| c.to_vec()).collect()
}

pub struct TwoStagePipeline<C> {
    client: C,
    limiter: RateLimiter,
    taxonomy: Arc<Taxonomy>,
    settings: PipelineSettings,
}

impl<C: ClassifyClient> TwoStagePipeline<C> {
    pub fn new(
        client: C,
        limiter: RateLimiter,
        taxonomy: Arc<Taxonomy>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            client,
            limiter,
            taxonomy,
            settings,
        }
    }

    /// Run both passes over the whole product set. Every input product comes
    /// back with some categorization; classification failures surface as
    /// fallback labels with confidence 0.0, never as missing entries.
    pub async fn run(&self, products: Vec<Product>) -> Vec<(Product, Categorization)> {
        if products.is_empty() {
            return Vec::new();
        }

        let products = Arc::new(products);
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));

        let all_indices: Vec<usize> = (0..products.len()).collect();
        let coarse_batches: Vec<(Vec<usize>, PromptPass)> =
            plan_batches(&all_indices, self.settings.batch_size)
                .into_iter()
                .map(|batch| (batch, PromptPass::Coarse))
                .collect();
        tracing::info!(
            "Coarse pass: {} products in {} batches",
            products.len(),
            coarse_batches.len()
        );
        let coarse = self
            .run_pass("coarse", &products, coarse_batches, &semaphore)
            .await;

        // Barrier passed. Pin down a valid main category per product before
        // grouping so every group has a well-defined fine vocabulary.
        let coarse: Vec<CategoryAnswer> = coarse
            .into_iter()
            .map(|answer| self.validate_coarse(answer))
            .collect();

        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, answer) in coarse.iter().enumerate() {
            groups.entry(answer.label.clone()).or_default().push(idx);
        }

        let mut fine_batches: Vec<(Vec<usize>, PromptPass)> = Vec::new();
        for (main, indices) in &groups {
            for batch in plan_batches(indices, self.settings.batch_size) {
                fine_batches.push((batch, PromptPass::Fine { main: main.clone() }));
            }
        }
        tracing::info!(
            "Fine pass: {} batches across {} groups",
            fine_batches.len(),
            groups.len()
        );
        let fine = self
            .run_pass("fine", &products, fine_batches, &semaphore)
            .await;

        let fine: Vec<CategoryAnswer> = fine
            .into_iter()
            .enumerate()
            .map(|(idx, answer)| self.validate_fine(answer, &coarse[idx].label))
            .collect();

        let products = Arc::try_unwrap(products).unwrap_or_else(|arc| arc.as_ref().clone());
        products
            .into_iter()
            .zip(coarse)
            .zip(fine)
            .map(|((product, c), f)| {
                let merged = Categorization {
                    main_category: c.label,
                    main_confidence: c.confidence,
                    main_reasoning: c.reasoning,
                    sub_category: f.label,
                    sub_confidence: f.confidence,
                    sub_reasoning: f.reasoning,
                };
                (product, merged)
            })
            .collect()
    }

    /// Schedule every batch as its own task and wait for all of them.
    /// Returns one slot per product; `None` marks a product whose batch
    /// task died outright (distinct from classification failure, which the
    /// stage already resolved into fallback answers).
    async fn run_pass(
        &self,
        pass_name: &'static str,
        products: &Arc<Vec<Product>>,
        batches: Vec<(Vec<usize>, PromptPass)>,
        semaphore: &Arc<Semaphore>,
    ) -> Vec<Option<CategoryAnswer>> {
        let total: usize = batches.iter().map(|(indices, _)| indices.len()).sum();
        let progress = ProgressTracker::new(pass_name, total);

        let mut handles: Vec<JoinHandle<(Vec<usize>, Vec<CategoryAnswer>)>> =
            Vec::with_capacity(batches.len());
        for (indices, pass) in batches {
            let products = Arc::clone(products);
            let semaphore = Arc::clone(semaphore);
            let client = self.client.clone();
            let limiter = self.limiter.clone();
            let taxonomy = Arc::clone(&self.taxonomy);
            let progress = progress.clone();

            handles.push(tokio::spawn(async move {
                // The permit spans admission, the call, and fallback
                // resolution, so the concurrency bound counts true
                // in-flight work rather than queued work.
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");

                let batch: Vec<&Product> = indices.iter().map(|&i| &products[i]).collect();
                let estimated_tokens = estimate_batch_tokens(&batch);
                limiter.acquire(estimated_tokens).await;

                let answers = classify_batch(&client, &taxonomy, &pass, &batch).await;
                progress.batch_done(batch.len(), &limiter).await;
                (indices, answers)
            }));
        }

        let mut answers: Vec<Option<CategoryAnswer>> = vec![None; products.len()];
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok((indices, batch_answers)) => {
                    for (idx, answer) in indices.into_iter().zip(batch_answers) {
                        answers[idx] = Some(answer);
                    }
                }
                Err(e) => tracing::error!("Batch task failed: {e}"),
            }
        }
        answers
    }

    fn validate_coarse(&self, answer: Option<CategoryAnswer>) -> CategoryAnswer {
        let answer = match answer {
            Some(answer) => answer,
            None => {
                return CategoryAnswer::fallback(FALLBACK_MAIN, "Batch task failed".to_string())
            }
        };
        if self.taxonomy.contains_main(&answer.label) {
            return answer;
        }
        tracing::warn!(
            "Main category \"{}\" is not in the taxonomy, moving to fallback group",
            answer.label
        );
        CategoryAnswer::fallback(
            FALLBACK_MAIN,
            format!("Label \"{}\" not in taxonomy", answer.label),
        )
    }

    fn validate_fine(&self, answer: Option<CategoryAnswer>, main: &str) -> CategoryAnswer {
        let group_fallback = fallback_label(
            &PromptPass::Fine {
                main: main.to_string(),
            },
            &self.taxonomy,
        )
        .to_string();

        let answer = match answer {
            Some(answer) => answer,
            None => return CategoryAnswer::fallback(&group_fallback, "Batch task failed".to_string()),
        };
        if self.taxonomy.group_contains(main, &answer.label) {
            return answer;
        }
        tracing::warn!(
            "Subcategory \"{}\" is not valid for \"{}\", substituting",
            answer.label,
            main
        );
        CategoryAnswer::fallback(
            &group_fallback,
            format!("Label \"{}\" not in {} subcategories", answer.label, main),
        )
    }
}

/// Completed-work counters shared by all batch tasks of one pass.
#[derive(Clone)]
struct ProgressTracker {
    inner: Arc<ProgressInner>,
}

struct ProgressInner {
    pass: &'static str,
    total_products: usize,
    completed_products: AtomicUsize,
    completed_batches: AtomicUsize,
    started: Instant,
}

impl ProgressTracker {
    fn new(pass: &'static str, total_products: usize) -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                pass,
                total_products,
                completed_products: AtomicUsize::new(0),
                completed_batches: AtomicUsize::new(0),
                started: Instant::now(),
            }),
        }
    }

    async fn batch_done(&self, batch_len: usize, limiter: &RateLimiter) {
        let batches = self.inner.completed_batches.fetch_add(1, Relaxed) + 1;
        let done = self.inner.completed_products.fetch_add(batch_len, Relaxed) + batch_len;
        if batches % PROGRESS_LOG_EVERY != 0 && done != self.inner.total_products {
            return;
        }

        let elapsed = self.inner.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 { done as f64 / elapsed } else { 0.0 };
        let stats = limiter.stats().await;
        tracing::info!(
            "{} pass: {}/{} products, {:.1}/s, RPM {}/{}, TPM {}/{}",
            self.inner.pass,
            done,
            self.inner.total_products,
            rate,
            stats.current_rpm,
            stats.rpm_limit,
            stats.current_tpm,
            stats.tpm_limit
        );
    }
}
