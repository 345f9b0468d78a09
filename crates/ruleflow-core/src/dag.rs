//! The DAG builder (§4.3): derives predecessor edges from output/input
//! overlap across bound rules — `r' -> r` iff some output of `r'` (a file
//! path or table model identifier) equals some input of `r` — rejects
//! cycles, and exposes a DOT-format renderer for visualization tooling.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::binder::BoundRule;
use crate::error::{RuleflowError, RuleflowResult};

/// A bound rule set plus the edges derived from its declared inputs/outputs.
pub struct Dag {
    rules: Vec<BoundRule>,
    predecessors: Vec<Vec<usize>>,
    successors: Vec<Vec<usize>>,
}

impl Dag {
    /// Build the graph, rejecting it with [`RuleflowError::CyclicWorkflow`]
    /// if any rule transitively depends on itself.
    pub fn build(rules: Vec<BoundRule>) -> RuleflowResult<Self> {
        let n = rules.len();
        let mut producers_by_file: HashMap<&std::path::Path, Vec<usize>> = HashMap::new();
        let mut producers_by_model: HashMap<&str, Vec<usize>> = HashMap::new();

        for (idx, rule) in rules.iter().enumerate() {
            for descriptor in &rule.output_files {
                producers_by_file.entry(descriptor.path.as_path()).or_default().push(idx);
            }
            for descriptor in &rule.output_tables {
                producers_by_model
                    .entry(descriptor.model_identifier.as_str())
                    .or_default()
                    .push(idx);
            }
        }

        let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (idx, rule) in rules.iter().enumerate() {
            let mut preds: HashSet<usize> = HashSet::new();
            for descriptor in &rule.input_files {
                if let Some(producers) = producers_by_file.get(descriptor.path.as_path()) {
                    preds.extend(producers.iter().copied().filter(|&p| p != idx));
                }
            }
            for descriptor in &rule.input_tables {
                if let Some(producers) = producers_by_model.get(descriptor.model_identifier.as_str()) {
                    preds.extend(producers.iter().copied().filter(|&p| p != idx));
                }
            }
            for p in preds {
                predecessors[idx].push(p);
                successors[p].push(idx);
            }
        }

        let dag = Dag {
            rules,
            predecessors,
            successors,
        };
        dag.check_acyclic()?;
        Ok(dag)
    }

    fn check_acyclic(&self) -> RuleflowResult<()> {
        let n = self.rules.len();
        let mut indegree: Vec<usize> = self.predecessors.iter().map(|p| p.len()).collect();
        let mut queue: VecDeque<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut visited = 0usize;

        while let Some(idx) = queue.pop_front() {
            visited += 1;
            for &succ in &self.successors[idx] {
                indegree[succ] -= 1;
                if indegree[succ] == 0 {
                    queue.push_back(succ);
                }
            }
        }

        if visited == n {
            return Ok(());
        }

        let cycle = self.find_cycle(&indegree);
        Err(RuleflowError::CyclicWorkflow {
            cycle: cycle.into_iter().map(|i| self.rules[i].rule.rule_name.clone()).collect(),
        })
    }

    /// Finds one concrete cycle among the rules Kahn's algorithm never
    /// reduced to zero in-degree, for the error payload.
    fn find_cycle(&self, indegree: &[usize]) -> Vec<usize> {
        let remaining: HashSet<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d > 0)
            .map(|(i, _)| i)
            .collect();
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        for &start in &remaining {
            if visited.contains(&start) {
                continue;
            }
            if let Some(cycle) = dfs_find_cycle(start, &self.successors, &remaining, &mut visited, &mut stack) {
                return cycle;
            }
        }
        Vec::new()
    }

    pub fn rules(&self) -> &[BoundRule] {
        &self.rules
    }

    pub fn predecessors(&self, idx: usize) -> &[usize] {
        &self.predecessors[idx]
    }

    pub fn successors(&self, idx: usize) -> &[usize] {
        &self.successors[idx]
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Render as a Graphviz DOT digraph, one node per rule labeled with its
    /// name and tool identifier.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph ruleflow {\n");
        for (idx, rule) in self.rules.iter().enumerate() {
            out.push_str(&format!(
                "  n{idx} [label=\"{}\\n{}\"];\n",
                escape_dot(&rule.rule.rule_name),
                escape_dot(&rule.rule.tool_identifier)
            ));
        }
        for (idx, succs) in self.successors.iter().enumerate() {
            for &succ in succs {
                out.push_str(&format!("  n{idx} -> n{succ};\n"));
            }
        }
        out.push_str("}\n");
        out
    }
}

fn dfs_find_cycle(
    node: usize,
    successors: &[Vec<usize>],
    remaining: &HashSet<usize>,
    visited: &mut HashSet<usize>,
    stack: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    if let Some(pos) = stack.iter().position(|&n| n == node) {
        return Some(stack[pos..].to_vec());
    }
    if visited.contains(&node) {
        return None;
    }
    stack.push(node);
    for &succ in &successors[node] {
        if remaining.contains(&succ) {
            if let Some(cycle) = dfs_find_cycle(succ, successors, remaining, visited, stack) {
                return Some(cycle);
            }
        }
    }
    stack.pop();
    visited.insert(node);
    None
}

fn escape_dot(s: &str) -> String {
    s.replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::RuleTool;
    use crate::model::{FileDescriptor, Role, Rule, RuleStatus};
    use crate::runtime::RuleHandle;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Arc;

    struct NoopTool;

    #[async_trait]
    impl RuleTool for NoopTool {
        async fn run(&self, _handle: &RuleHandle) -> crate::error::RuleflowResult<()> {
            Ok(())
        }
    }

    fn rule_row(id: i64, name: &str) -> Rule {
        Rule {
            id,
            execution_id: 1,
            rule_name: name.to_string(),
            tool_identifier: "demo".to_string(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: RuleStatus::NotExecuted,
        }
    }

    fn file(id: i64, rule_id: i64, name: &str, path: &str, role: Role) -> FileDescriptor {
        FileDescriptor {
            id,
            rule_id,
            name: name.to_string(),
            path: PathBuf::from(path),
            role,
            mtime_epoch_millis: None,
            size: None,
            used_at: None,
        }
    }

    fn bound(id: i64, name: &str, inputs: Vec<FileDescriptor>, outputs: Vec<FileDescriptor>) -> BoundRule {
        BoundRule {
            rule: rule_row(id, name),
            tool: Arc::new(NoopTool),
            input_files: inputs,
            output_files: outputs,
            input_tables: vec![],
            output_tables: vec![],
            options: vec![],
        }
    }

    #[test]
    fn diamond_shaped_workflow_orders_correctly() {
        // a -> {b, c} -> d, all joined through file paths.
        let a = bound(1, "a", vec![], vec![file(1, 1, "out", "a.txt", Role::Output)]);
        let b = bound(
            2,
            "b",
            vec![file(2, 2, "in", "a.txt", Role::Input)],
            vec![file(3, 2, "out", "b.txt", Role::Output)],
        );
        let c = bound(
            3,
            "c",
            vec![file(4, 3, "in", "a.txt", Role::Input)],
            vec![file(5, 3, "out", "c.txt", Role::Output)],
        );
        let d = bound(
            4,
            "d",
            vec![
                file(6, 4, "in1", "b.txt", Role::Input),
                file(7, 4, "in2", "c.txt", Role::Input),
            ],
            vec![],
        );

        let dag = Dag::build(vec![a, b, c, d]).unwrap();
        assert_eq!(dag.predecessors(0).len(), 0);
        assert_eq!(dag.predecessors(1), &[0]);
        assert_eq!(dag.predecessors(2), &[0]);
        let mut d_preds = dag.predecessors(3).to_vec();
        d_preds.sort();
        assert_eq!(d_preds, vec![1, 2]);
    }

    #[test]
    fn rejects_cycles() {
        let a = bound(
            1,
            "a",
            vec![file(1, 1, "in", "b.txt", Role::Input)],
            vec![file(2, 1, "out", "a.txt", Role::Output)],
        );
        let b = bound(
            2,
            "b",
            vec![file(3, 2, "in", "a.txt", Role::Input)],
            vec![file(4, 2, "out", "b.txt", Role::Output)],
        );

        let err = Dag::build(vec![a, b]).unwrap_err();
        assert!(matches!(err, RuleflowError::CyclicWorkflow { .. }));
    }

    #[test]
    fn renders_dot() {
        let a = bound(1, "a", vec![], vec![file(1, 1, "out", "a.txt", Role::Output)]);
        let b = bound(2, "b", vec![file(2, 2, "in", "a.txt", Role::Input)], vec![]);
        let dag = Dag::build(vec![a, b]).unwrap();
        let dot = dag.to_dot();
        assert!(dot.starts_with("digraph ruleflow {"));
        assert!(dot.contains("n0 -> n1"));
    }
}
