//! Grammar validator (§4.1): checks the shape of a parsed [`Node`] tree
//! against the workflow grammar and produces a [`ParsedDefinition`].
//!
//! The validator is total over malformed input — it never panics, and it
//! never touches the filesystem.

use std::collections::HashSet;

use super::document::Node;
use crate::error::{RuleflowError, RuleflowResult};

/// A fully shape-validated, but not yet bound, rule entry.
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub rule_name: String,
    pub tool: String,
    pub input: IoSpec,
    pub output: IoSpec,
    pub params: Vec<(String, String)>,
}

/// The `files`/`tables` sub-block of an `input:`/`output:` block.
#[derive(Debug, Clone, Default)]
pub struct IoSpec {
    pub files: Vec<(String, String)>,
    pub tables: Vec<(String, String)>,
}

/// A grammar-valid document: an ordered list of rule entries.
#[derive(Debug, Clone)]
pub struct ParsedDefinition {
    pub rules: Vec<RuleSpec>,
}

const RULE_KEYS: &[&str] = &["tool", "input", "output", "params"];
const IOSPEC_KEYS: &[&str] = &["files", "tables"];

/// Validate a document tree produced by [`super::document::parse_document`].
pub fn validate(doc: &Node) -> RuleflowResult<ParsedDefinition> {
    let top = doc.as_mapping().ok_or_else(|| RuleflowError::GrammarViolation {
        rule_name: None,
        detail: "document must be a mapping of 'rule <name>:' entries".to_string(),
    })?;

    let mut rules = Vec::with_capacity(top.len());
    let mut seen_names: HashSet<String> = HashSet::new();

    for (key, value) in top {
        let rule_name = parse_rule_key(key)?;
        if !seen_names.insert(rule_name.clone()) {
            return Err(RuleflowError::DuplicateRule { rule_name });
        }
        rules.push(validate_rule(&rule_name, value)?);
    }

    Ok(ParsedDefinition { rules })
}

/// `key` must be exactly `"rule <identifier>"`; returns the identifier.
fn parse_rule_key(key: &str) -> RuleflowResult<String> {
    let mut parts = key.split_whitespace();
    let head = parts.next().unwrap_or_default();
    let name = parts.next();
    let trailing = parts.next();

    if head != "rule" || name.is_none() || trailing.is_some() {
        return Err(RuleflowError::GrammarViolation {
            rule_name: None,
            detail: format!("top-level key '{}' must match 'rule <identifier>'", key),
        });
    }
    let name = name.unwrap();
    if !is_identifier(name) {
        return Err(RuleflowError::GrammarViolation {
            rule_name: None,
            detail: format!("'{}' is not a valid rule identifier", name),
        });
    }
    Ok(name.to_string())
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate_rule(rule_name: &str, value: &Node) -> RuleflowResult<RuleSpec> {
    let body = value.as_mapping().ok_or_else(|| RuleflowError::GrammarViolation {
        rule_name: Some(rule_name.to_string()),
        detail: "rule body must be a mapping".to_string(),
    })?;

    for (key, _) in body {
        if !RULE_KEYS.contains(&key.as_str()) {
            return Err(RuleflowError::GrammarViolation {
                rule_name: Some(rule_name.to_string()),
                detail: format!("unknown key '{}', expected one of {:?}", key, RULE_KEYS),
            });
        }
    }

    let tool = value
        .get("tool")
        .ok_or_else(|| RuleflowError::GrammarViolation {
            rule_name: Some(rule_name.to_string()),
            detail: "missing required key 'tool'".to_string(),
        })?
        .as_scalar()
        .ok_or_else(|| RuleflowError::GrammarViolation {
            rule_name: Some(rule_name.to_string()),
            detail: "'tool' must be a scalar string".to_string(),
        })?
        .to_string();

    let input = match value.get("input") {
        Some(node) => validate_iospec(rule_name, "input", node)?,
        None => IoSpec::default(),
    };
    let output = match value.get("output") {
        Some(node) => validate_iospec(rule_name, "output", node)?,
        None => IoSpec::default(),
    };
    let params = match value.get("params") {
        Some(node) => validate_params(rule_name, node)?,
        None => Vec::new(),
    };

    Ok(RuleSpec {
        rule_name: rule_name.to_string(),
        tool,
        input,
        output,
        params,
    })
}

fn validate_iospec(rule_name: &str, which: &str, node: &Node) -> RuleflowResult<IoSpec> {
    let mapping = node.as_mapping().ok_or_else(|| RuleflowError::GrammarViolation {
        rule_name: Some(rule_name.to_string()),
        detail: format!("'{}' must be a mapping", which),
    })?;

    for (key, _) in mapping {
        if !IOSPEC_KEYS.contains(&key.as_str()) {
            return Err(RuleflowError::GrammarViolation {
                rule_name: Some(rule_name.to_string()),
                detail: format!(
                    "unknown key '{}' under '{}', expected one of {:?}",
                    key, which, IOSPEC_KEYS
                ),
            });
        }
    }

    let files = match node.get("files") {
        Some(n) => validate_string_leaf_mapping(rule_name, &format!("{which}.files"), n, false)?,
        None => Vec::new(),
    };
    let tables = match node.get("tables") {
        Some(n) => validate_string_leaf_mapping(rule_name, &format!("{which}.tables"), n, true)?,
        None => Vec::new(),
    };

    Ok(IoSpec { files, tables })
}

/// `files:`/`tables:`/`params:` are all `identifier: scalar` mappings; for
/// `tables`, the value must itself be an identifier (a model reference).
fn validate_string_leaf_mapping(
    rule_name: &str,
    which: &str,
    node: &Node,
    value_must_be_identifier: bool,
) -> RuleflowResult<Vec<(String, String)>> {
    let mapping = node.as_mapping().ok_or_else(|| RuleflowError::GrammarViolation {
        rule_name: Some(rule_name.to_string()),
        detail: format!("'{}' must be a mapping", which),
    })?;

    let mut out = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let scalar = value.as_scalar().ok_or_else(|| RuleflowError::GrammarViolation {
            rule_name: Some(rule_name.to_string()),
            detail: format!("'{}.{}' must be a scalar string", which, key),
        })?;
        if value_must_be_identifier && !is_identifier(scalar) {
            return Err(RuleflowError::GrammarViolation {
                rule_name: Some(rule_name.to_string()),
                detail: format!("'{}.{}' value '{}' is not a valid identifier", which, key, scalar),
            });
        }
        out.push((key.clone(), scalar.to_string()));
    }
    Ok(out)
}

fn validate_params(rule_name: &str, node: &Node) -> RuleflowResult<Vec<(String, String)>> {
    let mapping = node.as_mapping().ok_or_else(|| RuleflowError::GrammarViolation {
        rule_name: Some(rule_name.to_string()),
        detail: "'params' must be a mapping".to_string(),
    })?;
    let mut out = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let scalar = value.as_scalar().ok_or_else(|| RuleflowError::GrammarViolation {
            rule_name: Some(rule_name.to_string()),
            detail: format!("'params.{}' must be a scalar", key),
        })?;
        out.push((key.clone(), scalar.to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::document::parse_document;

    #[test]
    fn validates_a_minimal_rule() {
        let doc = parse_document("rule a:\n  tool: demo.word_count\n  input:\n    files:\n      corpus: data/c.txt\n").unwrap();
        let parsed = validate(&doc).unwrap();
        assert_eq!(parsed.rules.len(), 1);
        assert_eq!(parsed.rules[0].rule_name, "a");
        assert_eq!(parsed.rules[0].tool, "demo.word_count");
        assert_eq!(parsed.rules[0].input.files, vec![("corpus".to_string(), "data/c.txt".to_string())]);
    }

    #[test]
    fn rejects_missing_tool() {
        let doc = parse_document("rule a:\n  input:\n    files:\n      corpus: data/c.txt\n").unwrap();
        let err = validate(&doc).unwrap_err();
        assert!(matches!(err, RuleflowError::GrammarViolation { .. }));
    }

    #[test]
    fn rejects_unknown_key() {
        let doc = parse_document("rule a:\n  tool: demo.x\n  bogus: 1\n").unwrap();
        let err = validate(&doc).unwrap_err();
        assert!(matches!(err, RuleflowError::GrammarViolation { .. }));
    }

    #[test]
    fn rejects_two_rules_with_the_same_literal_name() {
        let doc = parse_document("rule a:\n  tool: demo.x\nrule a:\n  tool: demo.y\n").unwrap();
        let err = validate(&doc).unwrap_err();
        assert!(matches!(err, RuleflowError::DuplicateRule { rule_name } if rule_name == "a"));
    }
}
