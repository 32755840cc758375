//! Bundled example snippets

use crate::controller::Backend;
use serde::Deserialize;
use std::collections::BTreeSet;
use tracing::error;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Example {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub backend: Backend,
    pub code: String,
}

impl Example {
    /// Code without the trailing newline multi-line TOML strings keep
    pub fn code(&self) -> &str {
        self.code.trim_end()
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(rename = "example", default)]
    examples: Vec<Example>,
}

const BUNDLED: &str = include_str!("../assets/examples.toml");

lazy_static::lazy_static! {
    static ref EXAMPLES: Vec<Example> = parse(BUNDLED).unwrap_or_else(|e| {
        error!("Bundled example catalog is invalid: {}", e);
        Vec::new()
    });
}

/// Parse a catalog in the bundled format
pub fn parse(content: &str) -> Result<Vec<Example>, String> {
    let file: CatalogFile = toml::from_str(content).map_err(|e| e.to_string())?;
    let mut seen = BTreeSet::new();
    for example in &file.examples {
        if !seen.insert(example.id.as_str()) {
            return Err(format!("duplicate example id '{}'", example.id));
        }
    }
    Ok(file.examples)
}

pub fn all() -> &'static [Example] {
    &EXAMPLES
}

pub fn get(id: &str) -> Option<&'static Example> {
    EXAMPLES.iter().find(|e| e.id == id)
}

pub fn by_category(category: &str) -> Vec<&'static Example> {
    EXAMPLES
        .iter()
        .filter(|e| e.category.eq_ignore_ascii_case(category))
        .collect()
}

/// Categories in first-appearance order
pub fn categories() -> Vec<&'static str> {
    let mut categories: Vec<&'static str> = Vec::new();
    for example in EXAMPLES.iter() {
        if !categories.contains(&example.category.as_str()) {
            categories.push(&example.category);
        }
    }
    categories
}
