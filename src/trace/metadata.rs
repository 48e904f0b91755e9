//! Trace header parsing: magic/version, timing, sampling parameters
//! and the chunk table.

use crate::trace::decoder::{read_f64, read_u32, read_u64};
use crate::utils::config::{TRACE_FORMAT_VERSION, TRACE_MAGIC};
use crate::utils::error::FormatError;
use std::io::Read;

/// Descriptor for one contiguous, independently decodable run of events.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkInfo {
    /// Byte offset of the chunk payload within the trace file
    pub offset: u64,

    /// Payload length in bytes, including the event count prefix
    pub byte_len: u64,

    /// Number of events the producer recorded in this chunk
    pub event_count: u32,

    /// Base timestamp for the chunk's delta encoding, seconds since
    /// trace start
    pub start_time: f64,

    /// Timestamp of the chunk's last event, seconds since trace start
    pub end_time: f64,

    /// Probability that an allocation was recorded while this chunk was
    /// being written; may differ between chunks if the producer adapted
    pub sampling_rate: f64,

    /// Multiplier from sampled to estimated true bytes for this chunk
    pub scale_factor: f64,
}

impl ChunkInfo {
    /// Combined multiplier applied to each event's sampled byte delta.
    ///
    /// The recorded scale factor estimates true bytes from sampled
    /// bytes; dividing by the sampling rate additionally undoes the
    /// recording probability.
    pub fn effective_scale(&self) -> f64 {
        self.scale_factor / self.sampling_rate
    }
}

/// Parsed trace file header.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceMetadata {
    /// Wall-clock anchor of the trace, seconds since the epoch. Event
    /// timestamps are relative to this; it exists so analysis output can
    /// be correlated with logs.
    pub initial_time: f64,

    /// Default recording probability, in (0, 1]
    pub sampling_rate: f64,

    /// Default sampled-to-true-bytes multiplier, >= 1
    pub scale_factor: f64,

    /// Chunk table, in file and time order
    pub chunks: Vec<ChunkInfo>,
}

impl TraceMetadata {
    /// Decode a header from the start of a trace file.
    pub fn read_from(r: &mut impl Read) -> Result<Self, FormatError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)
            .map_err(|_| FormatError::TruncatedHeader("magic number"))?;
        if magic != TRACE_MAGIC {
            return Err(FormatError::BadMagic {
                expected: TRACE_MAGIC,
                found: magic,
            });
        }

        let version = read_u32(r).map_err(|_| FormatError::TruncatedHeader("format version"))?;
        if version != TRACE_FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let initial_time = read_f64(r).map_err(|_| FormatError::TruncatedHeader("initial time"))?;
        let sampling_rate =
            read_f64(r).map_err(|_| FormatError::TruncatedHeader("sampling rate"))?;
        let scale_factor = read_f64(r).map_err(|_| FormatError::TruncatedHeader("scale factor"))?;

        let chunk_count =
            read_u32(r).map_err(|_| FormatError::TruncatedHeader("chunk count"))? as usize;
        // The count is untrusted until the table parses; cap the
        // pre-allocation so a corrupt header cannot abort the process.
        let mut chunks = Vec::with_capacity(chunk_count.min(1024));
        for _ in 0..chunk_count {
            let chunk = (|| -> std::io::Result<ChunkInfo> {
                Ok(ChunkInfo {
                    offset: read_u64(r)?,
                    byte_len: read_u64(r)?,
                    event_count: read_u32(r)?,
                    start_time: read_f64(r)?,
                    end_time: read_f64(r)?,
                    sampling_rate: read_f64(r)?,
                    scale_factor: read_f64(r)?,
                })
            })()
            .map_err(|_| FormatError::TruncatedHeader("chunk table"))?;
            chunks.push(chunk);
        }

        let metadata = Self {
            initial_time,
            sampling_rate,
            scale_factor,
            chunks,
        };
        metadata.validate()?;
        Ok(metadata)
    }

    /// Timestamp of the last recorded event, seconds since trace start.
    /// Answerable from the header alone.
    pub fn final_time(&self) -> f64 {
        self.chunks.last().map(|c| c.end_time).unwrap_or(0.0)
    }

    /// Total events across all chunks, per the chunk table.
    pub fn event_count(&self) -> u64 {
        self.chunks.iter().map(|c| u64::from(c.event_count)).sum()
    }

    fn validate(&self) -> Result<(), FormatError> {
        if !(self.sampling_rate > 0.0 && self.sampling_rate <= 1.0) {
            return Err(FormatError::InvalidHeader(format!(
                "sampling rate {} not in (0, 1]",
                self.sampling_rate
            )));
        }
        if self.scale_factor < 1.0 {
            return Err(FormatError::InvalidHeader(format!(
                "scale factor {} below 1",
                self.scale_factor
            )));
        }
        for (i, chunk) in self.chunks.iter().enumerate() {
            if !(chunk.sampling_rate > 0.0 && chunk.sampling_rate <= 1.0) {
                return Err(FormatError::InvalidHeader(format!(
                    "chunk {} sampling rate {} not in (0, 1]",
                    i, chunk.sampling_rate
                )));
            }
            if chunk.end_time < chunk.start_time {
                return Err(FormatError::InvalidHeader(format!(
                    "chunk {} ends at {} before it starts at {}",
                    i, chunk.end_time, chunk.start_time
                )));
            }
            if i > 0 && chunk.start_time < self.chunks[i - 1].end_time {
                return Err(FormatError::InvalidHeader(format!(
                    "chunk {} starts at {} before the previous chunk ends",
                    i, chunk.start_time
                )));
            }
        }
        Ok(())
    }
}
