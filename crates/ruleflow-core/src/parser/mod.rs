//! Definition document loading and grammar validation (§4.1).

pub mod document;
pub mod grammar;

pub use document::Node;
pub use grammar::{IoSpec, ParsedDefinition, RuleSpec};

use crate::error::RuleflowResult;

/// Parse and grammar-validate a definition document's text in one step.
pub fn parse_definition(text: &str) -> RuleflowResult<ParsedDefinition> {
    let tree = document::parse_document(text)?;
    grammar::validate(&tree)
}
