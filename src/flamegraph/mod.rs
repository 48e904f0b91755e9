//! Flame graphs: nested-interval trees over stack prefixes.
//!
//! Each tree node covers the usage of every stack sharing its prefix;
//! widths are proportional to usage. Sibling order is deterministic
//! (descending usage, ties by frame identity) so repeated exports of the
//! same snapshot are byte-identical. The folded text form is Brendan
//! Gregg's collapsed-stack format, consumable by the usual renderers.

use crate::snapshot::Snapshot;
use crate::trace::stack_table::{FrameId, StackTable};
use crate::utils::error::OutputError;
use log::debug;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// One prefix of the stack population.
#[derive(Debug, Clone, PartialEq)]
pub struct FlameNode {
    pub frame: FrameId,
    /// Summed usage of all stacks sharing this prefix
    pub value: f64,
    pub children: Vec<FlameNode>,
}

impl FlameNode {
    fn new(frame: FrameId) -> Self {
        Self {
            frame,
            value: 0.0,
            children: Vec::new(),
        }
    }

    fn insert(&mut self, frames: &[FrameId], size: f64) {
        self.value += size;
        if let Some((&head, tail)) = frames.split_first() {
            let child = match self.children.iter_mut().position(|c| c.frame == head) {
                Some(idx) => &mut self.children[idx],
                None => {
                    self.children.push(FlameNode::new(head));
                    self.children.last_mut().unwrap()
                }
            };
            child.insert(tail, size);
        }
    }

    fn sort(&mut self) {
        self.children.sort_by(|a, b| {
            b.value
                .partial_cmp(&a.value)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.frame.cmp(&b.frame))
        });
        for child in &mut self.children {
            child.sort();
        }
    }

    /// Usage attributed to exactly this prefix, excluding longer stacks.
    pub fn self_value(&self) -> f64 {
        self.value - self.children.iter().map(|c| c.value).sum::<f64>()
    }

    /// Fraction of the whole graph this node's interval covers.
    pub fn width(&self, total: f64) -> f64 {
        if total > 0.0 {
            self.value / total
        } else {
            0.0
        }
    }

    pub fn depth(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(FlameNode::depth)
            .max()
            .unwrap_or(0)
    }
}

/// The flame view of one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FlameGraph {
    pub time: f64,
    pub root: FlameNode,
    /// Usage whose stack reference could not be resolved
    pub other_usage: f64,
}

impl FlameGraph {
    /// Build the prefix tree for a snapshot.
    pub fn build(snapshot: &Snapshot, stacks: &StackTable) -> FlameGraph {
        let mut root = FlameNode::new(FrameId::ROOT);
        let mut other_usage = 0.0;

        for (&stack_ref, &size) in snapshot.usage() {
            match stacks.stack(stack_ref).filter(|f| !f.is_empty()) {
                Some(frames) => root.insert(frames, size),
                None => other_usage += size,
            }
        }
        root.value += other_usage;
        root.sort();

        debug!(
            "Flame graph at t={}: depth {}, total {}",
            snapshot.time(),
            root.depth(),
            root.value
        );
        FlameGraph {
            time: snapshot.time(),
            root,
            other_usage,
        }
    }

    /// Total usage covered by the graph, unresolved stacks included.
    pub fn total_usage(&self) -> f64 {
        self.root.value
    }

    /// Collapsed-stack text: one `frame;frame;... weight` line per leaf
    /// stack, with integer weights, in tree (width) order. Unresolved
    /// usage becomes a trailing `OTHER` line.
    pub fn folded(&self, stacks: &StackTable) -> String {
        let mut out = String::new();
        let mut path: Vec<String> = Vec::new();
        for child in &self.root.children {
            fold_node(child, stacks, &mut path, &mut out);
        }
        let other = self.other_usage.round() as i64;
        if other > 0 {
            out.push_str(&format!("OTHER {}\n", other));
        }
        out
    }

    /// Convenience: write the folded form to a file.
    pub fn write_folded(
        &self,
        path: impl AsRef<Path>,
        stacks: &StackTable,
    ) -> Result<(), OutputError> {
        let file = File::create(path.as_ref())?;
        let mut w = BufWriter::new(file);
        w.write_all(self.folded(stacks).as_bytes())?;
        Ok(())
    }

    /// Per-frame share of the first tree level, mostly for summaries.
    pub fn top_level_shares(&self, stacks: &StackTable) -> Vec<(String, f64)> {
        let total = self.root.value.max(1.0);
        self.root
            .children
            .iter()
            .map(|child| (stacks.label(child.frame), child.value / total))
            .collect()
    }
}

fn fold_node(node: &FlameNode, stacks: &StackTable, path: &mut Vec<String>, out: &mut String) {
    path.push(stacks.label(node.frame));
    let weight = node.self_value().round() as i64;
    if weight > 0 {
        out.push_str(&path.join(";"));
        out.push_str(&format!(" {}\n", weight));
    }
    for child in &node.children {
        fold_node(child, stacks, path, out);
    }
    path.pop();
}

/// Retained for callers that want the leaf population without the tree:
/// one `(stack string, weight)` pair per stack, sorted by weight
/// descending then stack string, matching the folded export's totals.
pub fn collapsed_stacks(snapshot: &Snapshot, stacks: &StackTable) -> Vec<(String, f64)> {
    let mut merged: HashMap<String, f64> = HashMap::new();
    for (&stack_ref, &size) in snapshot.usage() {
        let key = match stacks.stack(stack_ref).filter(|f| !f.is_empty()) {
            Some(frames) => frames
                .iter()
                .map(|&frame| stacks.label(frame))
                .collect::<Vec<_>>()
                .join(";"),
            None => "OTHER".to_string(),
        };
        *merged.entry(key).or_default() += size;
    }
    let mut collapsed: Vec<_> = merged.into_iter().collect();
    collapsed.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    collapsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;
    use crate::trace::stack_table::StackTable;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn fixture() -> (StackTable, Snapshot) {
        let mut stacks = StackTable::new();
        let ab = stacks.add_stack_lines(&[("a.py", 1), ("b.py", 2)]);
        let abc = stacks.add_stack_lines(&[("a.py", 1), ("b.py", 2), ("c.py", 3)]);
        let d = stacks.add_stack_lines(&[("d.py", 4)]);
        let snapshot = Snapshot::new(
            2.0,
            HashMap::from([(ab, 400.0), (abc, 600.0), (d, 1000.0)]),
        );
        (stacks, snapshot)
    }

    #[test]
    fn test_prefix_widths() {
        let (stacks, snapshot) = fixture();
        let graph = FlameGraph::build(&snapshot, &stacks);

        assert_eq!(graph.total_usage(), 2000.0);
        // a.py:1 covers both stacks through it.
        let a = &graph.root.children[0];
        assert_eq!(stacks.label(a.frame), "a.py:1");
        assert_eq!(a.value, 1000.0);
        assert_eq!(a.width(graph.total_usage()), 0.5);
    }

    #[test]
    fn test_sibling_order_deterministic() {
        let (stacks, snapshot) = fixture();
        let first = FlameGraph::build(&snapshot, &stacks);
        let second = FlameGraph::build(&snapshot, &stacks);
        assert_eq!(first, second);

        // Equal-value siblings (a subtree = d subtree = 1000) break the
        // tie by frame identity.
        let labels: Vec<_> = first
            .root
            .children
            .iter()
            .map(|c| stacks.label(c.frame))
            .collect();
        assert_eq!(labels, vec!["a.py:1", "d.py:4"]);
    }

    #[test]
    fn test_folded_output() {
        let (stacks, snapshot) = fixture();
        let graph = FlameGraph::build(&snapshot, &stacks);
        let folded = graph.folded(&stacks);
        let lines: Vec<_> = folded.lines().collect();

        assert!(lines.contains(&"a.py:1;b.py:2 400"));
        assert!(lines.contains(&"a.py:1;b.py:2;c.py:3 600"));
        assert!(lines.contains(&"d.py:4 1000"));
        let weight_sum: i64 = lines
            .iter()
            .map(|l| l.rsplit(' ').next().unwrap().parse::<i64>().unwrap())
            .sum();
        assert_eq!(weight_sum, 2000);
    }

    #[test]
    fn test_collapsed_stacks_sorted() {
        let (stacks, snapshot) = fixture();
        let collapsed = collapsed_stacks(&snapshot, &stacks);
        assert_eq!(collapsed[0].0, "d.py:4");
        assert_eq!(collapsed[0].1, 1000.0);
        assert_eq!(collapsed.len(), 3);
    }
}
