//! Shared profile fixtures for the integration tests.

#![allow(dead_code)]

use heaptrace_studio::trace::{StackRef, StackTable, TraceWriter};
use heaptrace_studio::utils::config;
use heaptrace_studio::Reader;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct Fixture {
    // Held so the profile files outlive the test body.
    pub dir: TempDir,
    pub base: PathBuf,
    pub alloc: StackRef,
    pub cache: StackRef,
    pub io: StackRef,
}

impl Fixture {
    pub fn open(&self) -> Reader {
        Reader::open(&self.base).unwrap()
    }

    pub fn trace_path(&self) -> PathBuf {
        config::trace_path(&self.base)
    }
}

/// A small two-chunk profile with a known event sequence:
///
/// chunk 0:  t=0.0   alloc +1000
///           t=0.25  cache  +500
///           t=0.5   io     +200
///           t=1.0   alloc -1000
/// chunk 1:  t=2.0   cache  +500
///
/// Totals: 1000 at t=0, 1700 at t=0.5, 700 at t=1.5, 1200 at t=2.0.
pub fn simple_profile() -> Fixture {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("demo");

    let mut stacks = StackTable::new();
    let alloc = stacks.add_stack_lines(&[("main.py", 1), ("alloc.py", 2)]);
    let cache = stacks.add_stack_lines(&[("main.py", 1), ("cache.py", 3)]);
    let io = stacks.add_stack_lines(&[("io.py", 9)]);

    let mut writer = TraceWriter::new(1_700_000_000.0, 1.0, 1.0);
    writer.begin_chunk(0.0);
    writer.add_event(0.0, alloc, 1000);
    writer.add_event(0.25, cache, 500);
    writer.add_event(0.5, io, 200);
    writer.add_event(1.0, alloc, -1000);
    writer.begin_chunk(1.5);
    writer.add_event(2.0, cache, 500);
    writer.write_to(config::trace_path(&base)).unwrap();
    stacks.save(config::stacks_path(&base)).unwrap();

    Fixture {
        dir,
        base,
        alloc,
        cache,
        io,
    }
}

/// A profile whose second chunk uses different sampling parameters:
/// chunk 0 at rate 1 / scale 1, chunk 1 at rate 0.5 / scale 2, so a
/// 100-byte event in chunk 1 counts as 400 estimated bytes.
pub fn scaled_profile() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("scaled");

    let mut stacks = StackTable::new();
    let a = stacks.add_stack_lines(&[("a.py", 1)]);
    let b = stacks.add_stack_lines(&[("b.py", 2)]);

    let mut writer = TraceWriter::new(1_700_000_000.0, 1.0, 1.0);
    writer.begin_chunk(0.0);
    writer.add_event(0.0, a, 100);
    writer.set_rates(0.5, 2.0);
    writer.begin_chunk(1.0);
    writer.add_event(1.0, b, 100);
    writer.write_to(config::trace_path(&base)).unwrap();
    stacks.save(config::stacks_path(&base)).unwrap();

    (dir, base)
}

/// Chop `bytes` off the end of a file, simulating a producer that was
/// stopped mid-write.
pub fn truncate_file(path: &Path, bytes: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    let len = file.metadata().unwrap().len();
    file.set_len(len - bytes).unwrap();
}
