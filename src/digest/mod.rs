//! The digest: a persisted checkpoint cache that lives beside a trace.
//!
//! Traces can run to gigabytes; without checkpoints every point-in-time
//! query replays from the start of the file. The digest stores the full
//! per-stack aggregate at a fixed time granularity, keyed by a
//! fingerprint of the source trace so it invalidates itself whenever the
//! trace changes. It is purely a cache: queries give identical answers
//! with or without it.

use crate::snapshot::ReplayState;
use crate::trace::decoder::{read_f64, read_u32, read_u64, read_varint, write_varint};
use crate::trace::reader::TraceReader;
use crate::trace::stack_table::StackRef;
use crate::utils::config::{DIGEST_FORMAT_VERSION, DIGEST_MAGIC};
use crate::utils::error::{DigestError, FormatError};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

// Serializes digest rebuilds; reads of a valid digest never take this.
static BUILD_LOCK: Mutex<()> = Mutex::new(());

// Counts in a digest file are untrusted until the table parses; never
// pre-allocate more than this on their say-so.
const MAX_PREALLOC: usize = 1024;

/// Identity of the source trace a digest was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    size: u64,
    mtime_sec: u64,
    mtime_nano: u32,
}

impl Fingerprint {
    fn of(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Ok(Self {
            size: meta.len(),
            mtime_sec: mtime.as_secs(),
            mtime_nano: mtime.subsec_nanos(),
        })
    }
}

/// One checkpoint: the complete replay state at `time`.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Seconds since trace start
    pub time: f64,
    /// Scalar total, equal to the sum of `usage` values
    pub total: f64,
    /// Per-stack live bytes at this instant
    pub usage: HashMap<StackRef, f64>,
}

/// An in-memory digest: an ordered checkpoint table at fixed granularity.
#[derive(Debug, Clone)]
pub struct Digest {
    fingerprint: Fingerprint,
    interval: f64,
    checkpoints: Vec<Checkpoint>,
}

impl Digest {
    /// Spacing between checkpoints, in seconds.
    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.len()
    }

    /// The nearest checkpoint at or before `t`, if any.
    pub fn checkpoint_at_or_before(&self, t: f64) -> Option<&Checkpoint> {
        let idx = self.checkpoints.partition_point(|c| c.time <= t);
        idx.checked_sub(1).map(|i| &self.checkpoints[i])
    }

    /// True iff a digest file beside `trace_path` exists, matches the
    /// current trace fingerprint, and has a supported format version.
    /// Only the digest header is read.
    pub fn is_valid(trace_path: &Path) -> bool {
        let digest_path = digest_path_for(trace_path);
        let Ok(file) = File::open(&digest_path) else {
            return false;
        };
        let Ok(expected) = Fingerprint::of(trace_path) else {
            return false;
        };
        match read_header(&mut BufReader::new(file)) {
            Ok((found, _)) => found == expected,
            Err(_) => false,
        }
    }

    /// Load the digest beside `trace_path`. Any problem -- missing file,
    /// stale fingerprint, unknown version, corrupt table -- yields
    /// `None`; the caller rebuilds. Staleness is never a user-visible
    /// error.
    pub fn load(trace_path: &Path) -> Option<Digest> {
        let digest_path = digest_path_for(trace_path);
        let file = File::open(&digest_path).ok()?;
        let expected = Fingerprint::of(trace_path).ok()?;

        match read_digest(&mut BufReader::new(file)) {
            Ok(digest) if digest.fingerprint == expected => {
                debug!(
                    "Loaded digest {} ({} checkpoints at {}s)",
                    digest_path.display(),
                    digest.checkpoints.len(),
                    digest.interval
                );
                Some(digest)
            }
            Ok(_) => {
                debug!("Digest {} is stale; ignoring", digest_path.display());
                None
            }
            Err(err) => {
                warn!(
                    "Digest {} unreadable ({}); ignoring",
                    digest_path.display(),
                    err
                );
                None
            }
        }
    }

    /// Build a digest with one full linear pass over the trace. The
    /// interval is clamped to [`MIN_INTERVAL`](crate::utils::config::MIN_INTERVAL);
    /// anything smaller would append checkpoints without bound.
    pub fn build(reader: &TraceReader, interval: f64) -> Result<Digest, FormatError> {
        let interval = crate::utils::config::sane_interval(interval);
        let fingerprint = Fingerprint::of(reader.path()).map_err(FormatError::Io)?;
        let final_time = reader.final_time();

        let mut checkpoints = Vec::new();
        let mut state = ReplayState::new();
        let mut next_time = 0.0f64;

        for event in reader.events() {
            let event = event?;
            while event.timestamp > next_time {
                checkpoints.push(Checkpoint {
                    time: next_time,
                    total: state.total,
                    usage: state.usage.clone(),
                });
                next_time += interval;
            }
            state.apply(&event);
        }
        while next_time <= final_time {
            checkpoints.push(Checkpoint {
                time: next_time,
                total: state.total,
                usage: state.usage.clone(),
            });
            next_time += interval;
        }

        info!(
            "Built digest: {} checkpoints at {}s granularity",
            checkpoints.len(),
            interval
        );
        Ok(Digest {
            fingerprint,
            interval,
            checkpoints,
        })
    }

    /// Build (unless already valid) and persist the digest for `reader`.
    ///
    /// The write is atomic -- the table is assembled in a temporary file
    /// in the same directory and renamed into place -- so a concurrent
    /// reader never observes a half-written cache. At most one rebuild
    /// runs at a time.
    pub fn materialize(
        reader: &TraceReader,
        interval: f64,
        force: bool,
    ) -> Result<Digest, DigestError> {
        let _guard = BUILD_LOCK.lock().unwrap_or_else(|poisoned| {
            // A panicking builder leaves no shared state behind; the
            // lock itself is still usable.
            poisoned.into_inner()
        });

        if !force {
            if let Some(existing) = Digest::load(reader.path()) {
                debug!("Digest already valid; skipping rebuild");
                return Ok(existing);
            }
        }

        let digest = Digest::build(reader, interval)?;
        digest.write_beside(reader.path())?;
        Ok(digest)
    }

    /// Persist beside the trace, atomically.
    pub fn write_beside(&self, trace_path: &Path) -> Result<(), DigestError> {
        let digest_path = digest_path_for(trace_path);
        let dir = digest_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut w = BufWriter::new(tmp.as_file_mut());
            self.write_to(&mut w)?;
            w.flush()?;
        }
        tmp.persist(&digest_path)?;
        info!("Digest written to {}", digest_path.display());
        Ok(())
    }

    fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_all(&DIGEST_MAGIC)?;
        w.write_all(&DIGEST_FORMAT_VERSION.to_le_bytes())?;
        w.write_all(&self.fingerprint.size.to_le_bytes())?;
        w.write_all(&self.fingerprint.mtime_sec.to_le_bytes())?;
        w.write_all(&self.fingerprint.mtime_nano.to_le_bytes())?;
        w.write_all(&self.interval.to_bits().to_le_bytes())?;
        w.write_all(&(self.checkpoints.len() as u32).to_le_bytes())?;

        let mut varint_buf = Vec::new();
        for checkpoint in &self.checkpoints {
            w.write_all(&checkpoint.time.to_bits().to_le_bytes())?;
            w.write_all(&checkpoint.total.to_bits().to_le_bytes())?;
            w.write_all(&(checkpoint.usage.len() as u32).to_le_bytes())?;
            // Sorted for deterministic output.
            let mut entries: Vec<_> = checkpoint.usage.iter().collect();
            entries.sort_by_key(|(stack, _)| **stack);
            for (stack, bytes) in entries {
                varint_buf.clear();
                write_varint(&mut varint_buf, u64::from(stack.0));
                w.write_all(&varint_buf)?;
                w.write_all(&bytes.to_bits().to_le_bytes())?;
            }
        }
        Ok(())
    }
}

// `<base>.htrace` -> `<base>.htdigest`, matching `utils::config`.
fn digest_path_for(trace_path: &Path) -> std::path::PathBuf {
    trace_path.with_extension("htdigest")
}

fn read_header(r: &mut impl Read) -> Result<(Fingerprint, f64), FormatError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .map_err(|_| FormatError::TruncatedHeader("digest magic"))?;
    if magic != DIGEST_MAGIC {
        return Err(FormatError::BadMagic {
            expected: DIGEST_MAGIC,
            found: magic,
        });
    }
    let version = read_u32(r).map_err(|_| FormatError::TruncatedHeader("digest version"))?;
    if version != DIGEST_FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    let fingerprint = Fingerprint {
        size: read_u64(r).map_err(|_| FormatError::TruncatedHeader("fingerprint"))?,
        mtime_sec: read_u64(r).map_err(|_| FormatError::TruncatedHeader("fingerprint"))?,
        mtime_nano: read_u32(r).map_err(|_| FormatError::TruncatedHeader("fingerprint"))?,
    };
    let interval = read_f64(r).map_err(|_| FormatError::TruncatedHeader("digest interval"))?;
    Ok((fingerprint, interval))
}

fn read_digest(r: &mut impl Read) -> Result<Digest, FormatError> {
    let (fingerprint, interval) = read_header(r)?;
    let count = read_u32(r).map_err(|_| FormatError::TruncatedHeader("checkpoint count"))? as usize;

    let mut checkpoints = Vec::with_capacity(count.min(MAX_PREALLOC));
    for _ in 0..count {
        let time = read_f64(r).map_err(|_| FormatError::TruncatedHeader("checkpoint"))?;
        let total = read_f64(r).map_err(|_| FormatError::TruncatedHeader("checkpoint"))?;
        let entries = read_u32(r).map_err(|_| FormatError::TruncatedHeader("checkpoint"))? as usize;
        let mut usage = HashMap::with_capacity(entries.min(MAX_PREALLOC));
        for _ in 0..entries {
            let stack = read_stack_ref(r)?;
            let bytes = read_f64(r).map_err(|_| FormatError::TruncatedHeader("checkpoint"))?;
            usage.insert(stack, bytes);
        }
        checkpoints.push(Checkpoint { time, total, usage });
    }
    Ok(Digest {
        fingerprint,
        interval,
        checkpoints,
    })
}

fn read_stack_ref(r: &mut impl Read) -> Result<StackRef, FormatError> {
    // Stack refs are varint-coded; pull bytes one at a time.
    let mut buf = Vec::with_capacity(2);
    loop {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)
            .map_err(|_| FormatError::TruncatedHeader("checkpoint entry"))?;
        buf.push(byte[0]);
        if byte[0] & 0x80 == 0 {
            break;
        }
    }
    let mut pos = 0;
    match read_varint(&buf, &mut pos) {
        Ok(Some(value)) if value <= u64::from(u32::MAX) => Ok(StackRef(value as u32)),
        _ => Err(FormatError::InvalidHeader(
            "bad stack reference in digest".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_lookup() {
        let digest = Digest {
            fingerprint: Fingerprint {
                size: 0,
                mtime_sec: 0,
                mtime_nano: 0,
            },
            interval: 1.0,
            checkpoints: (0..4)
                .map(|i| Checkpoint {
                    time: i as f64,
                    total: 0.0,
                    usage: HashMap::new(),
                })
                .collect(),
        };
        assert_eq!(digest.checkpoint_at_or_before(2.5).unwrap().time, 2.0);
        assert_eq!(digest.checkpoint_at_or_before(3.0).unwrap().time, 3.0);
        assert_eq!(digest.checkpoint_at_or_before(0.0).unwrap().time, 0.0);
        assert_eq!(digest.checkpoint_at_or_before(99.0).unwrap().time, 3.0);
    }

    #[test]
    fn test_absurd_checkpoint_count_is_an_error_not_an_abort() {
        let digest = Digest {
            fingerprint: Fingerprint {
                size: 1,
                mtime_sec: 2,
                mtime_nano: 3,
            },
            interval: 1.0,
            checkpoints: vec![],
        };
        let mut buf = Vec::new();
        digest.write_to(&mut buf).unwrap();

        // Overwrite the checkpoint count (the last header field) with a
        // number the table cannot possibly back.
        let count_at = buf.len() - 4;
        buf[count_at..].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = read_digest(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, FormatError::TruncatedHeader(_)));
    }

    #[test]
    fn test_header_roundtrip_and_stale_detection() {
        let digest = Digest {
            fingerprint: Fingerprint {
                size: 123,
                mtime_sec: 456,
                mtime_nano: 789,
            },
            interval: 0.5,
            checkpoints: vec![Checkpoint {
                time: 0.0,
                total: 10.0,
                usage: HashMap::from([(StackRef(1), 10.0)]),
            }],
        };
        let mut buf = Vec::new();
        digest.write_to(&mut buf).unwrap();

        let loaded = read_digest(&mut buf.as_slice()).unwrap();
        assert_eq!(loaded.fingerprint, digest.fingerprint);
        assert_eq!(loaded.interval, 0.5);
        assert_eq!(loaded.checkpoints, digest.checkpoints);
    }
}
