//! Configuration and constants shared across the engine.

use std::path::{Path, PathBuf};

/// Magic bytes at the start of a raw trace file.
pub const TRACE_MAGIC: [u8; 4] = *b"HTRC";

/// Current raw trace format version
pub const TRACE_FORMAT_VERSION: u32 = 1;

/// Magic bytes at the start of a digest cache file.
pub const DIGEST_MAGIC: [u8; 4] = *b"HTDG";

/// Current digest cache format version
pub const DIGEST_FORMAT_VERSION: u32 = 1;

// Timestamp deltas are stored with microsecond granularity; finer
// resolution buys nothing and bloats the varints.
pub const MICROS_PER_SEC: f64 = 1_000_000.0;

/// Default spacing between digest checkpoints, in seconds
pub const DEFAULT_DIGEST_INTERVAL: f64 = 60.0;

/// Smallest accepted checkpoint/sample spacing, in seconds
pub const MIN_INTERVAL: f64 = 0.001;

/// Default spacing between time plot samples, in seconds
pub const DEFAULT_PLOT_INTERVAL: f64 = 1.0;

/// Default number of groups shown in a time plot before bucketing into "other"
pub const DEFAULT_PLOT_GROUPS: usize = 10;

/// Default presentation filters for flow graph exports
pub const DEFAULT_MIN_NODE_FRACTION: f64 = 0.01;
pub const DEFAULT_MIN_EDGE_FRACTION: f64 = 0.05;

// A profile on disk is a family of files sharing one base path:
// `<base>.htrace` (raw events), `<base>.stacks.json` (stack
// side-table), `<base>.htdigest` (cache).

/// Path of the raw trace file for a profile base path
pub fn trace_path(base: impl AsRef<Path>) -> PathBuf {
    with_suffix(base.as_ref(), ".htrace")
}

/// Path of the stack side-table for a profile base path
pub fn stacks_path(base: impl AsRef<Path>) -> PathBuf {
    with_suffix(base.as_ref(), ".stacks.json")
}

/// Path of the digest cache for a profile base path
pub fn digest_path(base: impl AsRef<Path>) -> PathBuf {
    with_suffix(base.as_ref(), ".htdigest")
}

/// Clamp a caller-supplied spacing to the supported minimum. Zero,
/// negative, and non-finite intervals would otherwise make checkpoint
/// and sample sequences unbounded.
pub fn sane_interval(interval: f64) -> f64 {
    if interval.is_finite() && interval >= MIN_INTERVAL {
        interval
    } else {
        MIN_INTERVAL
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sane_interval_clamps_unusable_spacings() {
        assert_eq!(sane_interval(0.0), MIN_INTERVAL);
        assert_eq!(sane_interval(-5.0), MIN_INTERVAL);
        assert_eq!(sane_interval(f64::NAN), MIN_INTERVAL);
        assert_eq!(sane_interval(f64::INFINITY), MIN_INTERVAL);
        assert_eq!(sane_interval(2.0), 2.0);
    }

    #[test]
    fn test_profile_paths() {
        assert_eq!(trace_path("/tmp/run1"), PathBuf::from("/tmp/run1.htrace"));
        assert_eq!(
            stacks_path("/tmp/run1"),
            PathBuf::from("/tmp/run1.stacks.json")
        );
        assert_eq!(digest_path("run1"), PathBuf::from("run1.htdigest"));
    }
}
