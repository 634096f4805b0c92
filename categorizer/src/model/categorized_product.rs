use std::collections::HashMap;

use entity::categorized_product;
use entity::prelude::CategorizedProduct;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue::Set, ConnectionTrait, EntityTrait};

use crate::classify::{Categorization, MISSING_FROM_BATCH};
use crate::error::AppResult;
use crate::source::Product;

/// Chunk size for batch database inserts
pub const DB_INSERT_CHUNK_SIZE: usize = 1000;

pub struct CategorizedProductCtrl;

impl CategorizedProductCtrl {
    /// All stored classifications, keyed by product id. Loaded once per run
    /// so source filtering never round-trips per product.
    pub async fn load_all(
        conn: &impl ConnectionTrait,
    ) -> AppResult<HashMap<String, categorized_product::Model>> {
        let models = CategorizedProduct::find().all(conn).await?;
        Ok(models.into_iter().map(|m| (m.id.clone(), m)).collect())
    }

    /// Insert-or-update the final classification for each product. Safe to
    /// call repeatedly with the same results.
    pub async fn upsert_many(
        conn: &impl ConnectionTrait,
        results: &[(Product, Categorization)],
    ) -> AppResult<usize> {
        if results.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().naive_utc();
        let mut saved = 0usize;
        for chunk in results.chunks(DB_INSERT_CHUNK_SIZE) {
            let models: Vec<categorized_product::ActiveModel> = chunk
                .iter()
                .map(|(product, cat)| categorized_product::ActiveModel {
                    id: Set(product.id.clone()),
                    name: Set(product.name.clone()),
                    description: Set(Some(product.description.clone())),
                    existing_categories: Set(Some(product.existing_categories.clone())),
                    main_category: Set(Some(cat.main_category.clone())),
                    sub_category: Set(Some(cat.sub_category.clone())),
                    confidence: Set(Some(cat.sub_confidence)),
                    reasoning: Set(cat.sub_reasoning.clone()),
                    market: Set(Some(product.market.clone())),
                    categorized_at: Set(Some(now)),
                })
                .collect();

            CategorizedProduct::insert_many(models)
                .on_conflict(
                    OnConflict::column(categorized_product::Column::Id)
                        .update_columns([
                            categorized_product::Column::MainCategory,
                            categorized_product::Column::SubCategory,
                            categorized_product::Column::Confidence,
                            categorized_product::Column::Reasoning,
                            categorized_product::Column::CategorizedAt,
                        ])
                        .to_owned(),
                )
                .exec_without_returning(conn)
                .await?;
            saved += chunk.len();
        }
        Ok(saved)
    }
}

/// A product is (re)offered for classification unless a stored record
/// already carries both labels and its reasoning is not the batch-padding
/// sentinel. The sentinel deliberately marks "retry me", unlike ordinary
/// failure reasonings which stick.
pub fn needs_categorization(existing: Option<&categorized_product::Model>) -> bool {
    match existing {
        Some(model) => {
            model.main_category.is_none()
                || model.sub_category.is_none()
                || model.reasoning.as_deref() == Some(MISSING_FROM_BATCH)
        }
        None => true,
    }
}
