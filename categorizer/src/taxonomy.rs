use serde::Deserialize;
use thiserror::Error;

/// Reserved top-level category for products that could not be classified.
pub const FALLBACK_MAIN: &str = "Miscellaneous";
/// Reserved subcategory inside [`FALLBACK_MAIN`].
pub const FALLBACK_SUB: &str = "Other";

/// One `[[taxonomy]]` entry from the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct TaxonomyEntry {
    pub main: String,
    pub subs: Vec<String>,
}

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("taxonomy has no entries")]
    Empty,
    #[error("taxonomy entry \"{0}\" has no subcategories")]
    EmptyGroup(String),
    #[error("taxonomy entry \"{0}\" appears more than once")]
    DuplicateMain(String),
    #[error("reserved fallback pair \"Miscellaneous\" / \"Other\" missing from taxonomy")]
    MissingFallback,
}

/// The two-level classification vocabulary. Every subcategory is only valid
/// within its own main category.
#[derive(Debug, Clone)]
pub struct Taxonomy {
    entries: Vec<TaxonomyEntry>,
}

impl Taxonomy {
    pub fn new(entries: Vec<TaxonomyEntry>) -> Result<Self, TaxonomyError> {
        if entries.is_empty() {
            return Err(TaxonomyError::Empty);
        }
        for (i, entry) in entries.iter().enumerate() {
            if entry.subs.is_empty() {
                return Err(TaxonomyError::EmptyGroup(entry.main.clone()));
            }
            if entries[..i].iter().any(|e| e.main == entry.main) {
                return Err(TaxonomyError::DuplicateMain(entry.main.clone()));
            }
        }
        let has_fallback = entries
            .iter()
            .any(|e| e.main == FALLBACK_MAIN && e.subs.iter().any(|s| s == FALLBACK_SUB));
        if !has_fallback {
            return Err(TaxonomyError::MissingFallback);
        }

        Ok(Self { entries })
    }

    /// Single-string rendering used in the coarse-pass system prompt,
    /// one "Main: sub, sub, ..." line per category.
    pub fn compressed(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}: {}", e.main, e.subs.join(", ")))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn contains_main(&self, main: &str) -> bool {
        self.entries.iter().any(|e| e.main == main)
    }

    pub fn subs_for(&self, main: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|e| e.main == main)
            .map(|e| e.subs.as_slice())
    }

    pub fn group_contains(&self, main: &str, sub: &str) -> bool {
        self.subs_for(main)
            .map(|subs| subs.iter().any(|s| s == sub))
            .unwrap_or(false)
    }
}
