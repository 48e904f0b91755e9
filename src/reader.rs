//! The profile reader: one handle over a trace, its stack table, and
//! its digest cache.
//!
//! Everything the analysis commands need hangs off this type. A profile
//! on disk is the file family `<base>.htrace` / `<base>.stacks.json` /
//! `<base>.htdigest`; `Reader::open` takes the base path and wires the
//! pieces together. The digest is attached lazily: queries work without
//! one, just slower, and `ensure_digest` upgrades the handle in place.

use crate::digest::Digest;
use crate::flamegraph::FlameGraph;
use crate::flowgraph::FlowGraph;
use crate::snapshot::{self, Snapshot, Snapshots};
use crate::timeplot::{GroupBy, TimePlot};
use crate::trace::reader::{TraceReader, TraceScan};
use crate::trace::stack_table::StackTable;
use crate::utils::config;
use crate::utils::error::{DigestError, FormatError, QueryError};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Headline numbers for one profile, as shown by `heaptrace info`.
#[derive(Debug, Clone)]
pub struct ProfileSummary {
    pub base: PathBuf,
    /// Wall-clock anchor, seconds since the epoch
    pub initial_time: f64,
    /// Trace span in seconds
    pub duration: f64,
    pub sampling_rate: f64,
    pub scale_factor: f64,
    pub chunk_count: usize,
    pub event_count: u64,
    pub stack_count: usize,
    pub frame_count: usize,
    pub has_digest: bool,
    /// True if the trace ends mid-record (producer stopped mid-write)
    pub truncated: bool,
    /// Highest total usage reached, and when
    pub peak_usage: f64,
    pub peak_time: f64,
}

/// Handle over one recorded profile.
pub struct Reader {
    base: PathBuf,
    trace: TraceReader,
    stacks: StackTable,
    // Lazily attached; `Arc` so in-flight queries keep a consistent
    // digest even if another thread swaps in a rebuilt one.
    digest: Mutex<Option<Arc<Digest>>>,
}

impl Reader {
    /// Open the profile rooted at `base`. The trace header and stack
    /// table are read eagerly; the digest is picked up if a valid one
    /// exists beside the trace.
    pub fn open(base: impl AsRef<Path>) -> Result<Self, FormatError> {
        let base = base.as_ref().to_path_buf();
        let trace = TraceReader::open(config::trace_path(&base))?;
        let stacks = StackTable::load(config::stacks_path(&base))?;
        let digest = Digest::load(trace.path()).map(Arc::new);
        debug!(
            "Opened profile {}: {} stacks, digest {}",
            base.display(),
            stacks.stack_count(),
            if digest.is_some() { "attached" } else { "absent" }
        );
        Ok(Self {
            base,
            trace,
            stacks,
            digest: Mutex::new(digest),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn trace(&self) -> &TraceReader {
        &self.trace
    }

    pub fn stack_table(&self) -> &StackTable {
        &self.stacks
    }

    /// Wall-clock anchor of the trace, seconds since the epoch.
    pub fn initial_time(&self) -> f64 {
        self.trace.initial_time()
    }

    /// Timestamp of the last event, seconds since trace start. Queries
    /// accept any time in `[0, final_time]`.
    pub fn final_time(&self) -> f64 {
        self.trace.final_time()
    }

    pub fn sampling_rate(&self) -> f64 {
        self.trace.sampling_rate()
    }

    pub fn scale_factor(&self) -> f64 {
        self.trace.scale_factor()
    }

    pub fn has_digest(&self) -> bool {
        self.digest_slot().is_some()
    }

    fn digest(&self) -> Option<Arc<Digest>> {
        self.digest_slot().clone()
    }

    // The slot holds a plain Option swap; a panic while poisoned leaves
    // nothing inconsistent behind.
    fn digest_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<Digest>>> {
        self.digest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Build and persist the digest at the given checkpoint spacing,
    /// then attach it. `force` rebuilds even if a valid one exists.
    pub fn make_digest(&self, interval: f64, force: bool) -> Result<(), DigestError> {
        let digest = Digest::materialize(&self.trace, interval, force)?;
        *self.digest_slot() = Some(Arc::new(digest));
        Ok(())
    }

    /// Make sure some digest is attached before a query burst. If the
    /// cache cannot be persisted (read-only directory, say) the built
    /// digest is kept in memory and queries proceed at full speed
    /// anyway.
    pub fn ensure_digest(&self, interval: f64) -> Result<(), FormatError> {
        if self.has_digest() {
            return Ok(());
        }
        match Digest::materialize(&self.trace, interval, false) {
            Ok(digest) => {
                *self.digest_slot() = Some(Arc::new(digest));
                Ok(())
            }
            Err(DigestError::Format(err)) => Err(err),
            Err(err) => {
                warn!("Could not persist digest ({}); using in-memory copy", err);
                let digest = Digest::build(&self.trace, interval)?;
                *self.digest_slot() = Some(Arc::new(digest));
                Ok(())
            }
        }
    }

    /// Eagerly decode the whole trace into memory for repeated queries.
    pub fn warm(&self) -> Result<(), FormatError> {
        self.trace.warm()
    }

    /// Live memory state at time `t` seconds after trace start.
    pub fn snapshot_at(&self, t: f64) -> Result<Snapshot, QueryError> {
        snapshot::snapshot_at(&self.trace, self.digest().as_deref(), t)
    }

    /// Total live bytes at time `t`; cheaper than a full snapshot when
    /// only the scalar is wanted.
    pub fn usage_at(&self, t: f64) -> Result<f64, QueryError> {
        snapshot::usage_at(&self.trace, self.digest().as_deref(), t)
    }

    /// Snapshots at `0, interval, ...` through the final trace time.
    pub fn snapshots(&self, interval: f64) -> Snapshots<'_> {
        Snapshots::new(&self.trace, interval)
    }

    /// Flow graph of the heap at time `t`.
    pub fn flow_graph_at(&self, t: f64) -> Result<FlowGraph, QueryError> {
        let snapshot = self.snapshot_at(t)?;
        Ok(FlowGraph::build(&snapshot, &self.stacks))
    }

    /// Flame graph of the heap at time `t`.
    pub fn flame_graph_at(&self, t: f64) -> Result<FlameGraph, QueryError> {
        let snapshot = self.snapshot_at(t)?;
        Ok(FlameGraph::build(&snapshot, &self.stacks))
    }

    /// Usage-over-time series at the given sample spacing, with at most
    /// `top_n` named groups.
    pub fn time_plot(
        &self,
        interval: f64,
        group_by: GroupBy,
        top_n: usize,
    ) -> Result<TimePlot, FormatError> {
        TimePlot::build(self.snapshots(interval), &self.stacks, group_by, top_n)
    }

    /// Exact peak of total usage over the whole trace, as `(time, bytes)`.
    pub fn peak_usage(&self) -> Result<(f64, f64), FormatError> {
        snapshot::peak_usage(&self.trace)
    }

    /// One full pass over the trace for the `info` command.
    pub fn summary(&self) -> Result<ProfileSummary, FormatError> {
        let scan: TraceScan = self.trace.scan()?;
        let (peak_time, peak_usage) = snapshot::peak_usage(&self.trace)?;
        Ok(ProfileSummary {
            base: self.base.clone(),
            initial_time: self.trace.initial_time(),
            duration: self.trace.final_time(),
            sampling_rate: self.trace.sampling_rate(),
            scale_factor: self.trace.scale_factor(),
            chunk_count: self.trace.metadata().chunks.len(),
            event_count: scan.event_count,
            stack_count: self.stacks.stack_count(),
            frame_count: self.stacks.frame_count(),
            has_digest: self.has_digest(),
            truncated: scan.truncated,
            peak_usage,
            peak_time,
        })
    }
}
