pub use super::categorized_product::Entity as CategorizedProduct;
