//! Reference encoder for the raw trace format.
//!
//! The trace producer is an external sampling hook; this writer is the
//! producer's half of the wire contract, kept here so the format has a
//! single source of truth. The `record` CLI demo and the test suite use
//! it to build traces.

use crate::trace::decoder::{write_varint, zigzag_encode};
use crate::trace::metadata::ChunkInfo;
use crate::trace::stack_table::StackRef;
use crate::utils::config::{MICROS_PER_SEC, TRACE_FORMAT_VERSION, TRACE_MAGIC};
use crate::utils::error::OutputError;
use log::debug;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

// Header: magic + version + three f64 defaults + chunk count.
const HEADER_FIXED_LEN: u64 = 4 + 4 + 8 + 8 + 8 + 4;
// Per chunk table entry: offset, byte_len, event_count, start/end time,
// sampling rate, scale factor.
const CHUNK_ENTRY_LEN: u64 = 8 + 8 + 4 + 8 + 8 + 8 + 8;

struct OpenChunk {
    payload: Vec<u8>,
    event_count: u32,
    start_time: f64,
    last_time: f64,
    sampling_rate: f64,
    scale_factor: f64,
}

/// Incremental trace builder. Events must be appended in timestamp order;
/// chunk boundaries and sampling-parameter changes are the caller's call.
pub struct TraceWriter {
    initial_time: f64,
    sampling_rate: f64,
    scale_factor: f64,
    chunks: Vec<(ChunkInfo, Vec<u8>)>,
    open: Option<OpenChunk>,
}

impl TraceWriter {
    pub fn new(initial_time: f64, sampling_rate: f64, scale_factor: f64) -> Self {
        Self {
            initial_time,
            sampling_rate,
            scale_factor,
            chunks: Vec::new(),
            open: None,
        }
    }

    /// Change sampling parameters; takes effect from the next chunk.
    pub fn set_rates(&mut self, sampling_rate: f64, scale_factor: f64) {
        self.sampling_rate = sampling_rate;
        self.scale_factor = scale_factor;
    }

    /// Append one event at `timestamp` seconds since trace start.
    /// Positive `size` is an allocation, negative a free. Opens a chunk
    /// implicitly if none is open.
    pub fn add_event(&mut self, timestamp: f64, stack: StackRef, size: i64) {
        if self.open.is_none() {
            self.begin_chunk(timestamp);
        }
        let chunk = self.open.as_mut().unwrap();

        let delta_micros = ((timestamp - chunk.last_time) * MICROS_PER_SEC).round() as u64;
        write_varint(&mut chunk.payload, delta_micros);
        write_varint(&mut chunk.payload, zigzag_encode(size));
        write_varint(&mut chunk.payload, u64::from(stack.0));

        // Re-derive the timestamp from the encoded delta so the header's
        // end_time matches what a decoder will reconstruct.
        chunk.last_time += delta_micros as f64 / MICROS_PER_SEC;
        chunk.event_count += 1;
    }

    /// Start a new chunk whose delta encoding is based at `start_time`.
    pub fn begin_chunk(&mut self, start_time: f64) {
        self.finish_chunk();
        self.open = Some(OpenChunk {
            payload: Vec::new(),
            event_count: 0,
            start_time,
            last_time: start_time,
            sampling_rate: self.sampling_rate,
            scale_factor: self.scale_factor,
        });
    }

    /// Seal the open chunk, if any.
    pub fn finish_chunk(&mut self) {
        let Some(chunk) = self.open.take() else {
            return;
        };
        if chunk.event_count == 0 {
            return;
        }
        let mut payload = Vec::with_capacity(chunk.payload.len() + 4);
        payload.extend_from_slice(&chunk.event_count.to_le_bytes());
        payload.extend_from_slice(&chunk.payload);
        let info = ChunkInfo {
            offset: 0, // assigned at write time, once the header size is known
            byte_len: payload.len() as u64,
            event_count: chunk.event_count,
            start_time: chunk.start_time,
            end_time: chunk.last_time,
            sampling_rate: chunk.sampling_rate,
            scale_factor: chunk.scale_factor,
        };
        self.chunks.push((info, payload));
    }

    /// Seal the trace and write it to `path`.
    pub fn write_to(mut self, path: impl AsRef<Path>) -> Result<(), OutputError> {
        self.finish_chunk();

        let header_len = HEADER_FIXED_LEN + CHUNK_ENTRY_LEN * self.chunks.len() as u64;
        let mut offset = header_len;
        for (info, _) in &mut self.chunks {
            info.offset = offset;
            offset += info.byte_len;
        }

        let file = File::create(path.as_ref())?;
        let mut w = BufWriter::new(file);

        w.write_all(&TRACE_MAGIC)?;
        w.write_all(&TRACE_FORMAT_VERSION.to_le_bytes())?;
        w.write_all(&self.initial_time.to_bits().to_le_bytes())?;
        w.write_all(&self.sampling_rate.to_bits().to_le_bytes())?;
        w.write_all(&self.scale_factor.to_bits().to_le_bytes())?;
        w.write_all(&(self.chunks.len() as u32).to_le_bytes())?;
        for (info, _) in &self.chunks {
            w.write_all(&info.offset.to_le_bytes())?;
            w.write_all(&info.byte_len.to_le_bytes())?;
            w.write_all(&info.event_count.to_le_bytes())?;
            w.write_all(&info.start_time.to_bits().to_le_bytes())?;
            w.write_all(&info.end_time.to_bits().to_le_bytes())?;
            w.write_all(&info.sampling_rate.to_bits().to_le_bytes())?;
            w.write_all(&info.scale_factor.to_bits().to_le_bytes())?;
        }
        for (_, payload) in &self.chunks {
            w.write_all(payload)?;
        }
        w.flush()?;

        debug!(
            "Wrote trace {} ({} chunks, {} bytes)",
            path.as_ref().display(),
            self.chunks.len(),
            offset
        );
        Ok(())
    }
}
