//! Heaptrace Studio
//!
//! Offline analysis of sampled heap allocation traces: decode a
//! recorded profile, reconstruct live memory at any point in time, and
//! render the result as flow graphs, flame graphs, or usage-over-time
//! plots.
//!
//! A profile is a file family sharing one base path: `<base>.htrace`
//! holds the raw event stream, `<base>.stacks.json` the stack
//! side-table, and `<base>.htdigest` an optional checkpoint cache that
//! speeds up point-in-time queries without changing their answers.
//!
//! This crate provides the core implementation for the `heaptrace`
//! CLI tool; [`Reader`] is the entry point for library use.

pub mod digest;
pub mod flamegraph;
pub mod flowgraph;
pub mod reader;
pub mod snapshot;
pub mod timeplot;
pub mod trace;
pub mod utils;

pub use reader::{ProfileSummary, Reader};
pub use snapshot::Snapshot;
