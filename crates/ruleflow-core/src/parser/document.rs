//! The untyped document tree definitions are loaded into (§4.1, §6).
//!
//! The definition grammar is a small indentation-delimited mapping language,
//! not general YAML (no anchors, no flow collections, no multi-line
//! scalars) — so rather than bolt duplicate-key detection onto a general
//! YAML library (which silently lets later keys win), the tree is built by
//! a dedicated line scanner that rejects a repeated key at the moment it
//! would overwrite an earlier one.

use crate::error::{RuleflowError, RuleflowResult};

/// One node of the parsed-but-unvalidated document tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// An ordered mapping; order is preserved for readable error messages,
    /// but lookups are by key.
    Mapping(Vec<(String, Node)>),
    /// A leaf scalar value (always parsed as a string; the grammar
    /// validator narrows further per field).
    Scalar(String),
}

impl Node {
    pub fn as_mapping(&self) -> Option<&[(String, Node)]> {
        match self {
            Node::Mapping(entries) => Some(entries),
            Node::Scalar(_) => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Node::Scalar(s) => Some(s.as_str()),
            Node::Mapping(_) => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.as_mapping()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

struct Line<'a> {
    indent: usize,
    content: &'a str,
}

fn tokenize(text: &str) -> Vec<Line<'_>> {
    text.lines()
        .filter_map(|raw| {
            let trimmed = raw.trim_end();
            let stripped = trimmed.trim_start();
            if stripped.is_empty() || stripped.starts_with('#') {
                return None;
            }
            let indent = trimmed.len() - stripped.len();
            Some(Line {
                indent,
                content: stripped,
            })
        })
        .collect()
}

/// Parse the definition document's text into a [`Node::Mapping`] tree.
///
/// Returns [`RuleflowError::DuplicateKey`] the moment a nested mapping level
/// would see the same key twice. A repeated key at the top level (two rule
/// entries) is left for [`super::grammar::validate`] to reject as
/// [`RuleflowError::DuplicateRule`] — the more specific error the spec's
/// duplicate-rule-name scenario expects, rather than racing it out here.
pub fn parse_document(text: &str) -> RuleflowResult<Node> {
    let lines = tokenize(text);
    let (node, consumed) = parse_block(&lines, 0, 0, true)?;
    debug_assert!(consumed <= lines.len());
    Ok(node)
}

/// Parse a run of sibling `key: ...` entries starting at `start`, all at
/// exactly `indent`. Returns the mapping and the number of lines consumed.
/// `top_level` suppresses duplicate-key rejection here so the root's
/// rule-name duplicates surface as `DuplicateRule` instead.
fn parse_block(lines: &[Line<'_>], start: usize, indent: usize, top_level: bool) -> RuleflowResult<(Node, usize)> {
    let mut entries: Vec<(String, Node)> = Vec::new();
    let mut i = start;

    while i < lines.len() {
        let line = &lines[i];
        if line.indent < indent {
            break;
        }
        if line.indent > indent {
            // A malformed jump in indentation with no owning key; the
            // grammar validator will reject whatever shape this produces,
            // so surface it plainly rather than guessing a parent.
            return Err(RuleflowError::GrammarViolation {
                rule_name: None,
                detail: format!("unexpected indentation before '{}'", line.content),
            });
        }

        let (key, rest) = split_key(line.content)?;

        if !top_level && entries.iter().any(|(k, _)| k == &key) {
            return Err(RuleflowError::DuplicateKey { key });
        }

        if rest.is_empty() {
            // Value is a nested block on following, more-indented lines.
            let nested_indent = indent + child_indent(lines, i + 1, indent);
            let (child, consumed) = parse_block(lines, i + 1, nested_indent, false)?;
            entries.push((key, child));
            i = consumed;
        } else {
            entries.push((key, Node::Scalar(rest.to_string())));
            i += 1;
        }
    }

    Ok((Node::Mapping(entries), i))
}

/// The indent level of the first line after `from` that is deeper than
/// `parent_indent`, used so nested blocks are not hard-coded to exactly
/// `parent_indent + 1`.
fn child_indent(lines: &[Line<'_>], from: usize, parent_indent: usize) -> usize {
    lines
        .get(from)
        .map(|l| l.indent.saturating_sub(parent_indent))
        .filter(|delta| *delta > 0)
        .unwrap_or(1)
}

/// Split `key: value` (or `key:` with an empty rest) on the first colon.
fn split_key(content: &str) -> RuleflowResult<(String, &str)> {
    match content.split_once(':') {
        Some((key, rest)) => Ok((key.trim().to_string(), rest.trim())),
        None => Err(RuleflowError::GrammarViolation {
            rule_name: None,
            detail: format!("expected 'key: value' or 'key:', got '{}'", content),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_mapping() {
        let doc = "rule a:\n  tool: demo.x\n  input:\n    files:\n      in1: data/a.txt\n";
        let node = parse_document(doc).unwrap();
        let rule = node.get("rule a").unwrap();
        assert_eq!(rule.get("tool").unwrap().as_scalar(), Some("demo.x"));
        let in1 = rule
            .get("input")
            .unwrap()
            .get("files")
            .unwrap()
            .get("in1")
            .unwrap();
        assert_eq!(in1.as_scalar(), Some("data/a.txt"));
    }

    #[test]
    fn rejects_duplicate_key_same_level() {
        let doc = "rule a:\n  tool: demo.x\n  tool: demo.y\n";
        let err = parse_document(doc).unwrap_err();
        assert!(matches!(err, RuleflowError::DuplicateKey { key } if key == "tool"));
    }

    #[test]
    fn tolerates_duplicate_top_level_key_for_grammar_to_reject() {
        // Two rules named "a" are a grammar-level DuplicateRule (see
        // grammar.rs), not a document-level DuplicateKey — the document
        // tree just ends up with two "rule a" entries, both preserved.
        let doc = "rule a:\n  tool: demo.x\nrule a:\n  tool: demo.y\n";
        let node = parse_document(doc).unwrap();
        let entries = node.as_mapping().unwrap();
        assert_eq!(entries.iter().filter(|(k, _)| k == "rule a").count(), 2);
    }
}
