//! Item source over the per-market product tables the scrapers populate.
//!
//! Every public table except the bookkeeping ones is treated as one market's
//! catalog. Rows only need `id` and `name`; the description is normalized
//! from whichever of `description`/`categories`/`category` is present.

use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, QueryResult, Statement};

use crate::error::AppResult;
use crate::model::categorized_product::{needs_categorization, CategorizedProductCtrl};

/// One catalog entry awaiting classification. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Source-site category hint, passed to the prompt verbatim.
    pub existing_categories: String,
    /// Source table (market) the product came from.
    pub market: String,
}

const EXCLUDED_TABLES: &[&str] = &["all_products"];
const RESULT_TABLE_PREFIX: &str = "products_categorized";

/// Enumerate the per-market source tables.
pub async fn source_tables(conn: &impl ConnectionTrait) -> AppResult<Vec<String>> {
    let rows = conn
        .query_all(Statement::from_string(
            DbBackend::Postgres,
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'public' ORDER BY table_name",
        ))
        .await?;

    let mut tables = Vec::new();
    for row in rows {
        let name: String = row.try_get("", "table_name")?;
        if EXCLUDED_TABLES.contains(&name.as_str()) || name.starts_with(RESULT_TABLE_PREFIX) {
            continue;
        }
        tables.push(name);
    }
    Ok(tables)
}

/// Load every product that still needs a classification: not yet stored,
/// stored without a main category, or stored with the batch-padding
/// sentinel as its reasoning (a deliberate retry marker).
pub async fn load_pending_products(
    conn: &DatabaseConnection,
    limit_per_table: Option<u64>,
) -> AppResult<Vec<Product>> {
    let existing = CategorizedProductCtrl::load_all(conn).await?;
    let tables = source_tables(conn).await?;
    tracing::info!("Loading products from {} source tables", tables.len());

    let mut products = Vec::new();
    for table in tables {
        let mut sql = format!("SELECT * FROM \"{table}\"");
        if let Some(limit) = limit_per_table {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let rows = conn
            .query_all(Statement::from_string(DbBackend::Postgres, sql))
            .await?;

        let mut table_count = 0usize;
        for row in rows {
            let Some(id) = row_id(&row) else { continue };
            if !needs_categorization(existing.get(&id)) {
                continue;
            }

            let name: String = row.try_get("", "name").unwrap_or_default();
            let description = normalize_description(&row);
            products.push(Product {
                id,
                name,
                existing_categories: description.clone(),
                description,
                market: table.clone(),
            });
            table_count += 1;
        }
        tracing::info!("  {}: {} products", table, table_count);
    }

    tracing::info!("Total products to categorize: {}", products.len());
    Ok(products)
}

/// Product ids are UUIDs in some markets and plain text in others.
fn row_id(row: &QueryResult) -> Option<String> {
    if let Ok(id) = row.try_get::<String>("", "id") {
        return Some(id);
    }
    row.try_get::<sea_orm::prelude::Uuid>("", "id")
        .ok()
        .map(|id| id.to_string())
}

fn normalize_description(row: &QueryResult) -> String {
    for column in ["description", "categories", "category"] {
        if let Ok(Some(value)) = row.try_get::<Option<String>>("", column) {
            if !value.is_empty() {
                return join_if_list(value);
            }
        }
    }
    String::new()
}

/// Some scrapers store category lists as JSON arrays in a text column;
/// flatten those to one comma-joined string.
fn join_if_list(raw: String) -> String {
    if raw.trim_start().starts_with('[') {
        if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(&raw) {
            return items
                .iter()
                .map(|v| match v.as_str() {
                    Some(s) => s.to_string(),
                    None => v.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", ");
        }
    }
    raw
}
