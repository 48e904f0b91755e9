//! Flow graphs: node/edge usage attribution over the frames of a
//! snapshot.
//!
//! Every stack's frames collapse into a shared node set keyed by frame
//! identity, so the graph stays bounded no matter how deep recursion
//! goes or how many distinct call paths exist. Three quantities are
//! attributed:
//!
//! * local usage of a node: usage of stacks whose innermost frame is it;
//!   local usage sums to the snapshot total.
//! * cumulative usage: usage of all stacks passing through the node,
//!   each stack counted once even when the frame recurs inside it.
//! * edge usage: usage of stacks containing that caller/callee pair
//!   adjacently.
//!
//! A synthetic root precedes every stack; its cumulative usage is the
//! total, and usage with no recorded stack is attributed to it locally.

use crate::snapshot::Snapshot;
use crate::trace::stack_table::{FrameId, StackTable};
use crate::utils::error::OutputError;
use crate::utils::si::bytes_string;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Usage attribution over the call graph of one snapshot, or the
/// difference of two (in which case values may be negative).
#[derive(Debug, Clone, PartialEq)]
pub struct FlowGraph {
    pub node_local: HashMap<FrameId, f64>,
    pub node_cumulative: HashMap<FrameId, f64>,
    pub edge_usage: HashMap<(FrameId, FrameId), f64>,
    pub total_usage: f64,
}

impl FlowGraph {
    /// Aggregate a snapshot into a flow graph.
    pub fn build(snapshot: &Snapshot, stacks: &StackTable) -> FlowGraph {
        let mut graph = FlowGraph {
            node_local: HashMap::new(),
            node_cumulative: HashMap::new(),
            edge_usage: HashMap::new(),
            total_usage: 0.0,
        };
        let mut seen: HashSet<FrameId> = HashSet::new();

        for (&stack_ref, &size) in snapshot.usage() {
            graph.total_usage += size;
            *graph.node_cumulative.entry(FrameId::ROOT).or_default() += size;

            let frames = stacks.stack(stack_ref).filter(|f| !f.is_empty());
            let Some(frames) = frames else {
                // No recorded stack: count it at the root so local usage
                // still sums to the total.
                *graph.node_local.entry(FrameId::ROOT).or_default() += size;
                continue;
            };

            *graph
                .edge_usage
                .entry((FrameId::ROOT, frames[0]))
                .or_default() += size;
            for pair in frames.windows(2) {
                *graph.edge_usage.entry((pair[0], pair[1])).or_default() += size;
            }
            *graph.node_local.entry(frames[frames.len() - 1]).or_default() += size;

            // Once per distinct frame, so self-recursion is not double
            // counted.
            seen.clear();
            for &frame in frames {
                if seen.insert(frame) {
                    *graph.node_cumulative.entry(frame).or_default() += size;
                }
            }
        }

        debug!(
            "Flow graph: {} nodes, {} edges, total {}",
            graph.node_cumulative.len(),
            graph.edge_usage.len(),
            bytes_string(graph.total_usage)
        );
        graph
    }

    /// Cumulative usage of the synthetic root; equals the total.
    pub fn root_cumulative(&self) -> f64 {
        self.node_cumulative
            .get(&FrameId::ROOT)
            .copied()
            .unwrap_or(0.0)
    }

    /// Diff graph: `self - other`, with anything missing on one side
    /// treated as zero there. Entries that cancel to zero are retained;
    /// negative values mean shrinkage.
    pub fn compare(&self, other: &FlowGraph) -> FlowGraph {
        FlowGraph {
            node_local: diff_map(&self.node_local, &other.node_local),
            node_cumulative: diff_map(&self.node_cumulative, &other.node_cumulative),
            edge_usage: diff_map(&self.edge_usage, &other.edge_usage),
            total_usage: self.total_usage - other.total_usage,
        }
    }

    /// Presentation filter: merge nodes whose cumulative usage is below
    /// `min_node_fraction` of the total (and edges below
    /// `min_edge_fraction`) into a synthetic "other" node. Strictly a
    /// view transform, applied after exact computation; totals are
    /// untouched.
    pub fn filtered(&self, min_node_fraction: f64, min_edge_fraction: f64) -> FlowGraph {
        let basis = self.total_usage.abs();
        if basis == 0.0 {
            return self.clone();
        }
        let node_floor = min_node_fraction * basis;
        let edge_floor = min_edge_fraction * basis;

        let remap = |frame: FrameId| -> FrameId {
            if frame == FrameId::ROOT {
                return frame;
            }
            let cumulative = self.node_cumulative.get(&frame).copied().unwrap_or(0.0);
            if cumulative.abs() >= node_floor {
                frame
            } else {
                FrameId::OTHER
            }
        };

        let mut node_local: HashMap<FrameId, f64> = HashMap::new();
        for (&frame, &value) in &self.node_local {
            *node_local.entry(remap(frame)).or_default() += value;
        }
        let mut node_cumulative: HashMap<FrameId, f64> = HashMap::new();
        for (&frame, &value) in &self.node_cumulative {
            *node_cumulative.entry(remap(frame)).or_default() += value;
        }

        let mut edge_usage: HashMap<(FrameId, FrameId), f64> = HashMap::new();
        for (&(src, dst), &value) in &self.edge_usage {
            let (src, mut dst) = (remap(src), remap(dst));
            if value.abs() < edge_floor {
                // Small edge: keep its source but fold the target into
                // the "other" bucket.
                dst = FrameId::OTHER;
            }
            // Collapsing both endpoints leaves an "other" self loop with
            // nothing to say; genuine self-recursion edges stay.
            if src == FrameId::OTHER && dst == FrameId::OTHER {
                continue;
            }
            *edge_usage.entry((src, dst)).or_default() += value;
        }

        FlowGraph {
            node_local,
            node_cumulative,
            edge_usage,
            total_usage: self.total_usage,
        }
    }

    /// Render as a Graphviz dot graph: node size tracks local usage,
    /// edge width tracks edge usage. Deterministic output.
    pub fn to_dot(&self, stacks: &StackTable, title: &str) -> String {
        let basis = self.total_usage.abs().max(1.0);
        let mut out = String::new();

        out.push_str("digraph memory {\n");
        out.push_str(&format!(
            "  // {} -- generated {}\n",
            title,
            chrono::Utc::now().to_rfc3339()
        ));
        out.push_str(&format!("  label=\"{}\";\n", dot_escape(title)));
        out.push_str("  node [shape=box, style=filled, fillcolor=lightsteelblue];\n");

        let mut nodes: Vec<_> = self.node_cumulative.keys().copied().collect();
        for frame in self.node_local.keys() {
            if !self.node_cumulative.contains_key(frame) {
                nodes.push(*frame);
            }
        }
        nodes.sort();
        nodes.dedup();

        for frame in nodes {
            let local = self.node_local.get(&frame).copied().unwrap_or(0.0);
            let cumulative = self.node_cumulative.get(&frame).copied().unwrap_or(0.0);
            let fontsize = 10.0 + 20.0 * (local.abs() / basis).min(1.0);
            out.push_str(&format!(
                "  {} [label=\"{}\\n{} / {}\", fontsize={:.1}];\n",
                dot_node_id(frame),
                dot_escape(&stacks.label(frame)),
                bytes_string(local),
                bytes_string(cumulative),
                fontsize,
            ));
        }

        let mut edges: Vec<_> = self.edge_usage.iter().collect();
        edges.sort_by_key(|((src, dst), _)| (*src, *dst));
        for ((src, dst), &value) in edges {
            let penwidth = 1.0 + 4.0 * (value.abs() / basis).min(1.0);
            out.push_str(&format!(
                "  {} -> {} [label=\"{}\", penwidth={:.2}];\n",
                dot_node_id(*src),
                dot_node_id(*dst),
                bytes_string(value),
                penwidth,
            ));
        }

        out.push_str("}\n");
        out
    }

    /// Convenience: write the dot rendering to a file.
    pub fn write_dot(
        &self,
        path: impl AsRef<Path>,
        stacks: &StackTable,
        title: &str,
    ) -> Result<(), OutputError> {
        let file = File::create(path.as_ref())?;
        let mut w = BufWriter::new(file);
        w.write_all(self.to_dot(stacks, title).as_bytes())?;
        Ok(())
    }
}

fn diff_map<K: std::hash::Hash + Eq + Copy>(
    left: &HashMap<K, f64>,
    right: &HashMap<K, f64>,
) -> HashMap<K, f64> {
    let mut out: HashMap<K, f64> = HashMap::new();
    for (&key, &value) in left {
        out.insert(key, value - right.get(&key).copied().unwrap_or(0.0));
    }
    for (&key, &value) in right {
        out.entry(key).or_insert(-value);
    }
    out
}

fn dot_node_id(frame: FrameId) -> String {
    match frame {
        FrameId::ROOT => "root".to_string(),
        FrameId::OTHER => "other".to_string(),
        _ => format!("n{}", frame.0),
    }
}

fn dot_escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}
