//! Final classification record, one row per catalog product.
//!
//! `id` is the product's stable identifier from its source table and stays
//! the same across runs, so re-running the pipeline updates rows in place.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products_categorized")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub existing_categories: Option<String>,
    pub main_category: Option<String>,
    pub sub_category: Option<String>,
    pub confidence: Option<f32>,
    #[sea_orm(column_type = "Text", nullable)]
    pub reasoning: Option<String>,
    pub market: Option<String>,
    pub categorized_at: Option<DateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
