//! Usage-over-time series, grouped by allocation site.
//!
//! A time plot samples snapshots at a fixed interval and groups each
//! sample's usage by the innermost frame of the allocating stack (or by
//! that frame's file). Only the groups with the largest peaks get their
//! own series; everything else folds into `other`, which keeps the
//! output legible no matter how many distinct stacks a trace has.

use crate::snapshot::Snapshot;
use crate::trace::stack_table::StackTable;
use crate::utils::error::{FormatError, OutputError};
use log::debug;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const OTHER_LABEL: &str = "other";

/// How usage is attributed to a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    /// By innermost frame, `file:line`.
    Frame,
    /// By innermost frame's file only.
    File,
}

/// Aligned usage series over the lifetime of a trace.
///
/// Invariant: `times`, `total`, and every entry of `series` have the
/// same length, and `labels.len() == series.len()`.
#[derive(Debug, Clone, Serialize)]
pub struct TimePlot {
    /// Sample times, seconds since trace start.
    pub times: Vec<f64>,
    /// Total live bytes at each sample.
    pub total: Vec<f64>,
    /// One label per series, largest peak first; `other` last when
    /// present.
    pub labels: Vec<String>,
    pub series: Vec<Vec<f64>>,
}

impl TimePlot {
    /// Build a plot from a snapshot sequence. `top_n` bounds the number
    /// of named series; the rest merge into `other`.
    pub fn build(
        snapshots: impl Iterator<Item = Result<Snapshot, FormatError>>,
        stacks: &StackTable,
        group_by: GroupBy,
        top_n: usize,
    ) -> Result<TimePlot, FormatError> {
        let mut times = Vec::new();
        let mut total = Vec::new();
        let mut samples: Vec<HashMap<String, f64>> = Vec::new();

        for snapshot in snapshots {
            let snapshot = snapshot?;
            times.push(snapshot.time());
            total.push(snapshot.total_usage());
            samples.push(group_usage(&snapshot, stacks, group_by));
        }

        // Rank groups by their peak usage across the whole plot; ties
        // break lexicographically so output is deterministic.
        let mut peaks: HashMap<&str, f64> = HashMap::new();
        for sample in &samples {
            for (label, &value) in sample {
                let peak = peaks.entry(label).or_default();
                if value > *peak {
                    *peak = value;
                }
            }
        }
        let mut ranked: Vec<(&str, f64)> = peaks
            .into_iter()
            .filter(|(label, _)| *label != OTHER_LABEL)
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        let named: Vec<String> = ranked
            .iter()
            .take(top_n)
            .map(|(label, _)| label.to_string())
            .collect();
        let has_other = ranked.len() > named.len()
            || samples.iter().any(|s| s.contains_key(OTHER_LABEL));

        let mut labels = named;
        let mut series: Vec<Vec<f64>> = labels
            .iter()
            .map(|label| samples.iter().map(|s| *s.get(label).unwrap_or(&0.0)).collect())
            .collect();
        if has_other {
            // Everything not covered by a named series, including usage
            // with no resolvable stack.
            let other: Vec<f64> = samples
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    let named_sum: f64 = series.iter().map(|s| s[i]).sum();
                    (total[i] - named_sum).max(0.0)
                })
                .collect();
            labels.push(OTHER_LABEL.to_string());
            series.push(other);
        }

        debug!(
            "Time plot: {} samples, {} series ({} named)",
            times.len(),
            labels.len(),
            labels.len() - usize::from(has_other)
        );
        Ok(TimePlot {
            times,
            total,
            labels,
            series,
        })
    }

    pub fn sample_count(&self) -> usize {
        self.times.len()
    }

    /// Largest total across all samples.
    pub fn peak_total(&self) -> f64 {
        self.total.iter().copied().fold(0.0, f64::max)
    }

    /// Render as CSV with a `time,total,...` header, one row per sample.
    pub fn to_csv(&self) -> String {
        let mut out = String::from("time,total");
        for label in &self.labels {
            out.push(',');
            out.push_str(&csv_field(label));
        }
        out.push('\n');
        for i in 0..self.times.len() {
            out.push_str(&format!("{},{}", self.times[i], self.total[i]));
            for series in &self.series {
                out.push_str(&format!(",{}", series[i]));
            }
            out.push('\n');
        }
        out
    }

    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), OutputError> {
        let file = File::create(path.as_ref())?;
        let mut w = BufWriter::new(file);
        w.write_all(self.to_csv().as_bytes())?;
        Ok(())
    }
}

fn group_usage(snapshot: &Snapshot, stacks: &StackTable, group_by: GroupBy) -> HashMap<String, f64> {
    let mut groups: HashMap<String, f64> = HashMap::new();
    for (&stack_ref, &size) in snapshot.usage() {
        let label = match stacks
            .stack(stack_ref)
            .and_then(|frames| frames.last())
            .and_then(|&frame| stacks.frame(frame))
        {
            Some(frame) => match group_by {
                GroupBy::Frame => frame.to_string(),
                GroupBy::File => frame.filename.clone(),
            },
            None => OTHER_LABEL.to_string(),
        };
        *groups.entry(label).or_default() += size;
    }
    groups
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;
    use crate::trace::stack_table::{StackRef, StackTable};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn fixture() -> (StackTable, Vec<Result<Snapshot, FormatError>>) {
        let mut stacks = StackTable::new();
        let a = stacks.add_stack_lines(&[("main.py", 10), ("alloc.py", 1)]);
        let b = stacks.add_stack_lines(&[("main.py", 10), ("cache.py", 2)]);
        let c = stacks.add_stack_lines(&[("io.py", 3)]);
        let snapshots = vec![
            Ok(Snapshot::new(0.0, HashMap::from([(a, 100.0)]))),
            Ok(Snapshot::new(
                1.0,
                HashMap::from([(a, 100.0), (b, 900.0), (c, 50.0)]),
            )),
            Ok(Snapshot::new(2.0, HashMap::from([(b, 300.0)]))),
        ];
        (stacks, snapshots)
    }

    #[test]
    fn test_series_aligned() {
        let (stacks, snapshots) = fixture();
        let plot = TimePlot::build(snapshots.into_iter(), &stacks, GroupBy::Frame, 10).unwrap();

        assert_eq!(plot.times.len(), 3);
        assert_eq!(plot.total.len(), 3);
        assert_eq!(plot.labels.len(), plot.series.len());
        for series in &plot.series {
            assert_eq!(series.len(), plot.times.len());
        }
        // Named series cover everything, so totals match column sums.
        for i in 0..plot.times.len() {
            let column: f64 = plot.series.iter().map(|s| s[i]).sum();
            assert_eq!(column, plot.total[i]);
        }
    }

    #[test]
    fn test_top_n_folds_into_other() {
        let (stacks, snapshots) = fixture();
        let plot = TimePlot::build(snapshots.into_iter(), &stacks, GroupBy::Frame, 1).unwrap();

        // cache.py:2 has the largest peak (900); the rest is other.
        assert_eq!(plot.labels, vec!["cache.py:2", "other"]);
        assert_eq!(plot.series[0], vec![0.0, 900.0, 300.0]);
        assert_eq!(plot.series[1], vec![100.0, 150.0, 0.0]);
    }

    #[test]
    fn test_group_by_file_merges_lines() {
        let mut stacks = StackTable::new();
        let a = stacks.add_stack_lines(&[("m.py", 1)]);
        let b = stacks.add_stack_lines(&[("m.py", 2)]);
        let snapshots = vec![Ok(Snapshot::new(
            0.0,
            HashMap::from([(a, 10.0), (b, 20.0)]),
        ))];
        let plot = TimePlot::build(snapshots.into_iter(), &stacks, GroupBy::File, 10).unwrap();
        assert_eq!(plot.labels, vec!["m.py"]);
        assert_eq!(plot.series[0], vec![30.0]);
    }

    #[test]
    fn test_unresolved_stack_lands_in_other() {
        let stacks = StackTable::new();
        let snapshots = vec![Ok(Snapshot::new(
            0.0,
            HashMap::from([(StackRef(99), 40.0)]),
        ))];
        let plot = TimePlot::build(snapshots.into_iter(), &stacks, GroupBy::Frame, 10).unwrap();
        assert_eq!(plot.labels, vec!["other"]);
        assert_eq!(plot.series[0], vec![40.0]);
    }

    #[test]
    fn test_csv_shape() {
        let (stacks, snapshots) = fixture();
        let plot = TimePlot::build(snapshots.into_iter(), &stacks, GroupBy::Frame, 2).unwrap();
        let csv = plot.to_csv();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("time,total,"));
        assert_eq!(lines[1].split(',').count(), 2 + plot.labels.len());
    }
}
