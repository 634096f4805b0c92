pub mod categorized_product;
