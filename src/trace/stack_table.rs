//! The stack side-table: an external, read-only mapping from the stack
//! references found in events to call stacks of (filename, line) frames.
//!
//! Frames are interned into integer identifiers with structural equality,
//! so the analysis layers never compare strings in their hot paths.

use crate::utils::error::{FormatError, OutputError};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Interned identity of one (source file, line number) stack level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameId(pub u32);

impl FrameId {
    /// Synthetic root frame used by graph views; never interned.
    pub const ROOT: FrameId = FrameId(u32::MAX);

    /// Synthetic bucket for below-threshold nodes in filtered graphs.
    pub const OTHER: FrameId = FrameId(u32::MAX - 1);
}

/// Reference from an event to a stack in the side-table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StackRef(pub u32);

impl StackRef {
    /// Reserved reference meaning "no stack was recorded".
    pub const UNKNOWN: StackRef = StackRef(0);
}

/// One stack level: a source file and line number. Equality is
/// structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
    pub filename: String,
    pub lineno: u32,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.lineno)
    }
}

/// Interned frames plus the ordered stacks that reference them.
///
/// Stack reference `i` (1-based; 0 is reserved) maps to the `i-1`th
/// entry of the side-table file. Stacks are ordered outermost caller
/// first; a frame may repeat within one stack under recursion.
#[derive(Debug, Default, Clone)]
pub struct StackTable {
    frames: Vec<Frame>,
    index: HashMap<Frame, FrameId>,
    stacks: Vec<Vec<FrameId>>,
}

impl StackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a side-table from its JSON file: an array of stacks, each an
    /// array of `[filename, lineno]` pairs, outermost frame first.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FormatError> {
        let file = File::open(path.as_ref())?;
        let raw: Vec<Vec<(String, u32)>> = serde_json::from_reader(BufReader::new(file))?;

        let mut table = Self::new();
        for stack in raw {
            let frames = stack
                .into_iter()
                .map(|(filename, lineno)| table.intern(&filename, lineno))
                .collect();
            table.stacks.push(frames);
        }
        debug!(
            "Loaded stack side-table: {} stacks over {} distinct frames",
            table.stacks.len(),
            table.frames.len()
        );
        Ok(table)
    }

    /// Write the side-table in the format `load` expects.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), OutputError> {
        let raw: Vec<Vec<(&str, u32)>> = self
            .stacks
            .iter()
            .map(|stack| {
                stack
                    .iter()
                    .map(|id| {
                        let frame = &self.frames[id.0 as usize];
                        (frame.filename.as_str(), frame.lineno)
                    })
                    .collect()
            })
            .collect();
        let file = File::create(path.as_ref())?;
        serde_json::to_writer(BufWriter::new(file), &raw)?;
        Ok(())
    }

    /// Intern a (filename, line) pair, returning its stable identifier.
    pub fn intern(&mut self, filename: &str, lineno: u32) -> FrameId {
        let frame = Frame {
            filename: filename.to_string(),
            lineno,
        };
        if let Some(&id) = self.index.get(&frame) {
            return id;
        }
        let id = FrameId(self.frames.len() as u32);
        self.frames.push(frame.clone());
        self.index.insert(frame, id);
        id
    }

    /// Register a stack of already-interned frames; returns its reference.
    pub fn add_stack(&mut self, frames: Vec<FrameId>) -> StackRef {
        self.stacks.push(frames);
        StackRef(self.stacks.len() as u32)
    }

    /// Convenience for fixtures: intern and register in one call.
    pub fn add_stack_lines(&mut self, lines: &[(&str, u32)]) -> StackRef {
        let frames = lines
            .iter()
            .map(|(filename, lineno)| self.intern(filename, *lineno))
            .collect();
        self.add_stack(frames)
    }

    /// Resolve a stack reference. `None` for the reserved unknown
    /// reference or one past the end of the table.
    pub fn stack(&self, stack: StackRef) -> Option<&[FrameId]> {
        if stack == StackRef::UNKNOWN {
            return None;
        }
        self.stacks
            .get(stack.0 as usize - 1)
            .map(|frames| frames.as_slice())
    }

    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(id.0 as usize)
    }

    /// Human-readable label for a frame, including the synthetic ones.
    pub fn label(&self, id: FrameId) -> String {
        match id {
            FrameId::ROOT => "root".to_string(),
            FrameId::OTHER => "other".to_string(),
            _ => self
                .frame(id)
                .map(|f| f.to_string())
                .unwrap_or_else(|| format!("frame#{}", id.0)),
        }
    }

    pub fn stack_count(&self) -> usize {
        self.stacks.len()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_interning_is_structural() {
        let mut table = StackTable::new();
        let a = table.intern("app.py", 10);
        let b = table.intern("app.py", 10);
        let c = table.intern("app.py", 11);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.frame_count(), 2);
    }

    #[test]
    fn test_stack_refs_are_one_based() {
        let mut table = StackTable::new();
        let r = table.add_stack_lines(&[("main.py", 1), ("util.py", 40)]);
        assert_eq!(r, StackRef(1));
        assert_eq!(table.stack(StackRef::UNKNOWN), None);
        assert_eq!(table.stack(StackRef(99)), None);
        assert_eq!(table.stack(r).unwrap().len(), 2);
    }

    #[test]
    fn test_recursive_stack_keeps_repeats() {
        let mut table = StackTable::new();
        let r = table.add_stack_lines(&[("a.py", 1), ("a.py", 1), ("b.py", 2)]);
        let stack = table.stack(r).unwrap();
        assert_eq!(stack.len(), 3);
        assert_eq!(stack[0], stack[1]);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let mut table = StackTable::new();
        table.add_stack_lines(&[("main.py", 1), ("worker.py", 77)]);
        table.add_stack_lines(&[("main.py", 1)]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.stacks.json");
        table.save(&path).unwrap();
        let loaded = StackTable::load(&path).unwrap();

        assert_eq!(loaded.stack_count(), 2);
        assert_eq!(loaded.label(loaded.stack(StackRef(1)).unwrap()[1]), "worker.py:77");
    }
}
