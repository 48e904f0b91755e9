//! Lazy, restartable access to a trace file's event sequence.
//!
//! The reader holds only the parsed header; event payloads are decoded
//! chunk by chunk on demand, so callers that stop consuming early never
//! pay for the rest of the file. A warm mode trades memory for decode
//! cost when many queries will hit the same trace.

use crate::trace::decoder::{ChunkDecoder, Event};
use crate::trace::metadata::TraceMetadata;
use crate::utils::error::FormatError;
use log::{debug, warn};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Result of decoding a single chunk.
#[derive(Debug, Clone)]
pub struct DecodedChunk {
    pub events: Vec<Event>,
    /// True if the chunk's payload ended mid-record; expected for the
    /// trailing chunk of a trace that is still being appended to.
    pub truncated: bool,
    /// Timestamp of the last complete record, seconds since trace start.
    pub boundary_time: f64,
}

/// Outcome of a full linear pass over every chunk.
#[derive(Debug, Clone, Copy)]
pub struct TraceScan {
    pub event_count: u64,
    pub truncated: bool,
    /// Last complete record's timestamp; the decodable end of the trace.
    pub boundary_time: f64,
}

/// Read-only view over one trace file.
pub struct TraceReader {
    path: PathBuf,
    metadata: TraceMetadata,
    // Fully decoded event sequence, built once by `warm` and immutable
    // afterwards, so it can be shared across concurrent queries.
    warm: OnceLock<Vec<Event>>,
}

impl TraceReader {
    /// Open a trace file and parse its header. Event payloads are not
    /// touched.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FormatError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let metadata = TraceMetadata::read_from(&mut BufReader::new(file))?;
        debug!(
            "Opened trace {}: {} chunks, {} events, span [0, {}]",
            path.display(),
            metadata.chunks.len(),
            metadata.event_count(),
            metadata.final_time()
        );
        Ok(Self {
            path,
            metadata,
            warm: OnceLock::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &TraceMetadata {
        &self.metadata
    }

    /// Wall-clock anchor of the trace, seconds since the epoch.
    pub fn initial_time(&self) -> f64 {
        self.metadata.initial_time
    }

    /// Timestamp of the last recorded event, seconds since trace start.
    pub fn final_time(&self) -> f64 {
        self.metadata.final_time()
    }

    pub fn sampling_rate(&self) -> f64 {
        self.metadata.sampling_rate
    }

    pub fn scale_factor(&self) -> f64 {
        self.metadata.scale_factor
    }

    /// Decode one chunk by index. Chunks are independent, so any subset
    /// may be decoded in any order.
    pub fn decode_chunk(&self, index: usize) -> Result<DecodedChunk, FormatError> {
        let info = self.metadata.chunks.get(index).ok_or_else(|| {
            FormatError::InvalidHeader(format!("chunk index {} out of range", index))
        })?;

        let mut file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        // A trailing chunk may extend past the current end of the file if
        // the producer is mid-write; clamp and let the decoder stop at
        // the last complete record.
        let available = file_len.saturating_sub(info.offset).min(info.byte_len);
        file.seek(SeekFrom::Start(info.offset))?;
        let mut payload = vec![0u8; available as usize];
        file.read_exact(&mut payload)?;

        let mut decoder = ChunkDecoder::new(info, index, &payload);
        let mut events = Vec::with_capacity(info.event_count as usize);
        for event in decoder.by_ref() {
            events.push(event?);
        }
        if decoder.is_truncated() {
            debug!(
                "Chunk {} truncated after {} of {} events (boundary t={})",
                index,
                decoder.decoded_count(),
                info.event_count,
                decoder.boundary_time()
            );
        }
        Ok(DecodedChunk {
            truncated: decoder.is_truncated(),
            boundary_time: decoder.boundary_time(),
            events,
        })
    }

    /// Decode every chunk once, reporting the decodable boundary of the
    /// trace. A truncated trailing record is not an error.
    pub fn scan(&self) -> Result<TraceScan, FormatError> {
        let mut scan = TraceScan {
            event_count: 0,
            truncated: false,
            boundary_time: 0.0,
        };
        for index in 0..self.metadata.chunks.len() {
            let chunk = self.decode_chunk(index)?;
            scan.event_count += chunk.events.len() as u64;
            scan.boundary_time = chunk.boundary_time;
            if chunk.truncated {
                scan.truncated = true;
                // Nothing after a truncated chunk is decodable.
                break;
            }
        }
        Ok(scan)
    }

    /// Eagerly decode the whole trace into memory, so later iteration is
    /// free. Idempotent; the cache is built fully before it is shared.
    pub fn warm(&self) -> Result<(), FormatError> {
        if self.warm.get().is_some() {
            return Ok(());
        }
        let mut events = Vec::with_capacity(self.metadata.event_count() as usize);
        for index in 0..self.metadata.chunks.len() {
            let chunk = self.decode_chunk(index)?;
            events.extend(chunk.events);
            if chunk.truncated {
                break;
            }
        }
        debug!("Warm cache built: {} events", events.len());
        // A racing second warm() built the same thing; either copy works.
        let _ = self.warm.set(events);
        Ok(())
    }

    pub fn is_warm(&self) -> bool {
        self.warm.get().is_some()
    }

    /// The trace's full event sequence, in timestamp order. Lazy per
    /// chunk (or free after `warm`), restartable, and fine to abandon
    /// early.
    pub fn events(&self) -> Events<'_> {
        self.events_after(f64::NEG_INFINITY)
    }

    /// Events with timestamps strictly after `from`, in order. Chunks
    /// that end at or before `from` are skipped without decoding; this
    /// is what makes checkpoint-plus-suffix replay cheap.
    pub fn events_after(&self, from: f64) -> Events<'_> {
        match self.warm.get() {
            Some(cache) => {
                let start = cache.partition_point(|e| e.timestamp <= from);
                Events {
                    inner: EventsInner::Warm(cache[start..].iter()),
                }
            }
            None => {
                let first_chunk = self.metadata.chunks.partition_point(|c| c.end_time <= from);
                Events {
                    inner: EventsInner::Lazy {
                        reader: self,
                        next_chunk: first_chunk,
                        current: Vec::new().into_iter(),
                        done: false,
                        skip_until: from,
                    },
                }
            }
        }
    }
}

/// Iterator over a trace's events. See [`TraceReader::events`].
pub struct Events<'a> {
    inner: EventsInner<'a>,
}

enum EventsInner<'a> {
    Warm(std::slice::Iter<'a, Event>),
    Lazy {
        reader: &'a TraceReader,
        next_chunk: usize,
        current: std::vec::IntoIter<Event>,
        done: bool,
        skip_until: f64,
    },
}

impl Iterator for Events<'_> {
    type Item = Result<Event, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            EventsInner::Warm(iter) => iter.next().map(|e| Ok(*e)),
            EventsInner::Lazy {
                reader,
                next_chunk,
                current,
                done,
                skip_until,
            } => loop {
                if let Some(event) = current.next() {
                    if event.timestamp <= *skip_until {
                        continue;
                    }
                    return Some(Ok(event));
                }
                if *done || *next_chunk >= reader.metadata.chunks.len() {
                    return None;
                }
                match reader.decode_chunk(*next_chunk) {
                    Ok(chunk) => {
                        *next_chunk += 1;
                        if chunk.truncated {
                            if *next_chunk < reader.metadata.chunks.len() {
                                warn!(
                                    "Chunk {} truncated; ignoring {} later chunk(s)",
                                    *next_chunk - 1,
                                    reader.metadata.chunks.len() - *next_chunk
                                );
                            }
                            *done = true;
                        }
                        *current = chunk.events.into_iter();
                    }
                    Err(err) => {
                        *done = true;
                        return Some(Err(err));
                    }
                }
            },
        }
    }
}
