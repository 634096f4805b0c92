pub mod categorized_product;
pub mod prelude;
