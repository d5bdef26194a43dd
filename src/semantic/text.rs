//! Text templates fed to the embedding model.
//!
//! Indexed documents and search queries share the `Description:` and
//! `Examples:` lines so their embeddings stay comparable.

use crate::definitions::SemanticTypeDefinition;

pub const MAX_EXAMPLES: usize = 10;
pub const MAX_HEADER_EXAMPLES: usize = 5;

/// A draft type to compare against the index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimilarityQuery {
    pub description: String,
    pub positive_examples: Vec<String>,
    pub header_examples: Vec<String>,
}

impl SimilarityQuery {
    pub fn new(description: &str) -> Self {
        SimilarityQuery {
            description: description.to_string(),
            ..Default::default()
        }
    }

    pub fn with_examples(mut self, examples: &[&str]) -> Self {
        self.positive_examples = examples.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn with_headers(mut self, headers: &[&str]) -> Self {
        self.header_examples = headers.iter().map(|h| h.to_string()).collect();
        self
    }

    /// Query describing an existing definition, e.g. to find near-duplicates
    /// of it.
    pub fn from_definition(def: &SemanticTypeDefinition) -> Self {
        SimilarityQuery {
            description: def.description.clone(),
            positive_examples: def.examples(),
            header_examples: def.header_examples(),
        }
    }
}

/// `Semantic Type: ..`, `Description: ..`, `Examples: ..` (first 10).
pub fn index_text(name: &str, description: &str, examples: &[String]) -> String {
    let mut text = format!("Semantic Type: {name}\n");

    if !description.is_empty() {
        text.push_str(&format!("Description: {description}\n"));
    }

    if !examples.is_empty() {
        text.push_str("Examples: ");
        text.push_str(&join_first(examples, MAX_EXAMPLES));
    }

    text
}

pub fn query_text(query: &SimilarityQuery) -> String {
    let mut text = String::new();

    if !query.description.is_empty() {
        text.push_str(&format!("Description: {}\n", query.description));
    }

    if !query.positive_examples.is_empty() {
        text.push_str("Examples: ");
        text.push_str(&join_first(&query.positive_examples, MAX_EXAMPLES));
        text.push('\n');
    }

    if !query.header_examples.is_empty() {
        text.push_str("Header Examples: ");
        text.push_str(&join_first(&query.header_examples, MAX_HEADER_EXAMPLES));
    }

    text
}

fn join_first(items: &[String], limit: usize) -> String {
    items
        .iter()
        .take(limit)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
