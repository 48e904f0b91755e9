//! Point-in-time snapshots of live memory, built by replaying events.
//!
//! A snapshot is an immutable mapping from stack reference to estimated
//! live bytes. Replay optionally resumes from the nearest digest
//! checkpoint at or before the requested time; the digest never changes
//! the answer, only how much of the trace has to be replayed.

use crate::digest::Digest;
use crate::trace::decoder::Event;
use crate::trace::reader::TraceReader;
use crate::trace::stack_table::StackRef;
use crate::utils::error::{FormatError, QueryError};
use log::debug;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Immutable state of the heap at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    time: f64,
    usage: HashMap<StackRef, f64>,
}

impl Snapshot {
    pub(crate) fn new(time: f64, usage: HashMap<StackRef, f64>) -> Self {
        Self { time, usage }
    }

    /// Seconds since trace start.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Live estimated bytes per stack. Stacks whose total reached zero
    /// are never present.
    pub fn usage(&self) -> &HashMap<StackRef, f64> {
        &self.usage
    }

    pub fn usage_of(&self, stack: StackRef) -> f64 {
        self.usage.get(&stack).copied().unwrap_or(0.0)
    }

    /// Total live bytes: the sum over all stacks.
    pub fn total_usage(&self) -> f64 {
        self.usage.values().sum()
    }

    pub fn stack_count(&self) -> usize {
        self.usage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.usage.is_empty()
    }
}

/// Running per-stack aggregate during replay.
///
/// Invariant: `total` always equals the sum of the retained map values;
/// a stack whose running total drops to zero or below is removed, never
/// kept with a non-positive value.
#[derive(Debug, Default, Clone)]
pub(crate) struct ReplayState {
    pub(crate) usage: HashMap<StackRef, f64>,
    pub(crate) total: f64,
}

impl ReplayState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(usage: HashMap<StackRef, f64>, total: f64) -> Self {
        Self { usage, total }
    }

    pub(crate) fn apply(&mut self, event: &Event) {
        let delta = event.estimated_bytes();
        match self.usage.entry(event.stack) {
            Entry::Occupied(mut slot) => {
                let updated = *slot.get() + delta;
                if updated <= 0.0 {
                    self.total -= *slot.get();
                    slot.remove();
                } else {
                    self.total += delta;
                    *slot.get_mut() = updated;
                }
            }
            Entry::Vacant(slot) => {
                // A free with no matching live allocation (sampling can
                // produce these) is dropped rather than going negative.
                if delta > 0.0 {
                    slot.insert(delta);
                    self.total += delta;
                }
            }
        }
    }

    pub(crate) fn into_snapshot(self, time: f64) -> Snapshot {
        Snapshot::new(time, self.usage)
    }

    pub(crate) fn to_snapshot(&self, time: f64) -> Snapshot {
        Snapshot::new(time, self.usage.clone())
    }
}

fn check_range(reader: &TraceReader, t: f64) -> Result<(), QueryError> {
    let end = reader.final_time();
    if t < 0.0 || t > end {
        return Err(QueryError::OutOfRange {
            requested: t,
            start: 0.0,
            end,
        });
    }
    Ok(())
}

/// Replay state at time `t`, seeded from the nearest checkpoint at or
/// before `t` when a digest is available.
fn replay_until(
    reader: &TraceReader,
    digest: Option<&Digest>,
    t: f64,
) -> Result<ReplayState, FormatError> {
    let (mut state, from) = match digest.and_then(|d| d.checkpoint_at_or_before(t)) {
        Some(checkpoint) => {
            debug!(
                "Replaying suffix ({}, {}] from checkpoint",
                checkpoint.time, t
            );
            (
                ReplayState::from_parts(checkpoint.usage.clone(), checkpoint.total),
                checkpoint.time,
            )
        }
        None => (ReplayState::new(), f64::NEG_INFINITY),
    };

    for event in reader.events_after(from) {
        let event = event?;
        if event.timestamp > t {
            break;
        }
        state.apply(&event);
    }
    Ok(state)
}

/// Build the snapshot at time `t`. Referentially transparent: equal `t`
/// yields equal snapshots, with or without a digest.
pub fn snapshot_at(
    reader: &TraceReader,
    digest: Option<&Digest>,
    t: f64,
) -> Result<Snapshot, QueryError> {
    check_range(reader, t)?;
    Ok(replay_until(reader, digest, t)?.into_snapshot(t))
}

/// Scalar total usage at time `t`, in checkpoint-plus-suffix time.
pub fn usage_at(reader: &TraceReader, digest: Option<&Digest>, t: f64) -> Result<f64, QueryError> {
    check_range(reader, t)?;
    Ok(replay_until(reader, digest, t)?.total)
}

/// Highest total usage over the whole trace, with the time it was
/// reached. One linear pass; the peak is exact, not sampled.
pub fn peak_usage(reader: &TraceReader) -> Result<(f64, f64), FormatError> {
    let mut state = ReplayState::new();
    let mut peak = 0.0f64;
    let mut peak_time = 0.0f64;
    for event in reader.events() {
        let event = event?;
        state.apply(&event);
        if state.total > peak {
            peak = state.total;
            peak_time = event.timestamp;
        }
    }
    Ok((peak_time, peak))
}

/// Lazy sequence of snapshots at fixed spacing across the trace.
///
/// State is carried forward between samples, but each emitted snapshot
/// equals what a from-scratch `snapshot_at` at that time would produce.
/// The sequence covers `0, interval, 2*interval, ...` through the final
/// trace time, ending with a sample exactly at the final time.
pub struct Snapshots<'a> {
    events: crate::trace::reader::Events<'a>,
    state: ReplayState,
    pending: Option<Event>,
    next_time: f64,
    interval: f64,
    final_time: f64,
    done: bool,
}

impl<'a> Snapshots<'a> {
    pub(crate) fn new(reader: &'a TraceReader, interval: f64) -> Self {
        Self {
            events: reader.events(),
            state: ReplayState::new(),
            pending: None,
            next_time: 0.0,
            // A non-positive spacing would make the sequence infinite.
            interval: crate::utils::config::sane_interval(interval),
            final_time: reader.final_time(),
            done: false,
        }
    }
}

impl Iterator for Snapshots<'_> {
    type Item = Result<Snapshot, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        // Apply everything at or before the sample time, holding back
        // the first event past it for the next sample.
        if let Some(event) = self.pending.take() {
            if event.timestamp <= self.next_time {
                self.state.apply(&event);
            } else {
                self.pending = Some(event);
            }
        }
        if self.pending.is_none() {
            loop {
                match self.events.next() {
                    Some(Ok(event)) => {
                        if event.timestamp <= self.next_time {
                            self.state.apply(&event);
                        } else {
                            self.pending = Some(event);
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                    None => break,
                }
            }
        }

        let snapshot = self.state.to_snapshot(self.next_time);
        if self.next_time >= self.final_time {
            self.done = true;
        } else {
            // Step by the interval, but never sample past the end; the
            // last sample lands exactly on the final time.
            self.next_time = (self.next_time + self.interval).min(self.final_time);
        }
        Some(Ok(snapshot))
    }
}
