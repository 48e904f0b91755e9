//! Binary event record decoding.
//!
//! Event records are delta-encoded: each record stores the time elapsed
//! since the previous record in its chunk, so decoding is strictly
//! sequential within a chunk. Distinct chunks carry their own base
//! timestamp and can be decoded independently.

use crate::trace::metadata::ChunkInfo;
use crate::trace::stack_table::StackRef;
use crate::utils::config::MICROS_PER_SEC;
use crate::utils::error::FormatError;
use std::io::Read;

/// A single decoded allocation or free event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    /// Seconds since trace start. Strictly non-decreasing within a trace.
    pub timestamp: f64,

    /// Reference into the stack side-table at which this memory was
    /// allocated. `StackRef::UNKNOWN` means the producer recorded no trace.
    pub stack: StackRef,

    /// Sampled byte delta: positive for an allocation, negative for a free.
    pub size: i64,

    /// Multiplier estimating true bytes from sampled bytes, as recorded
    /// for this event's chunk. Already includes the sampling-rate
    /// adjustment.
    pub scale: f64,
}

impl Event {
    /// Estimated true byte delta, after undoing sampling.
    pub fn estimated_bytes(&self) -> f64 {
        self.size as f64 * self.scale
    }
}

// Varint limit for a u64: 10 septets.
const MAX_VARINT_LEN: usize = 10;

/// Read an LEB128 varint from `buf` at `*pos`, advancing the cursor.
///
/// Returns `Ok(None)` if the buffer ends mid-varint (a truncation, not a
/// corruption) and an error only for an overlong encoding.
pub(crate) fn read_varint(buf: &[u8], pos: &mut usize) -> Result<Option<u64>, String> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    let mut read = 0usize;
    loop {
        let Some(&byte) = buf.get(*pos + read) else {
            return Ok(None);
        };
        read += 1;
        if read > MAX_VARINT_LEN {
            return Err("overlong varint".to_string());
        }
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            *pos += read;
            return Ok(Some(result));
        }
        shift += 7;
    }
}

/// Append an LEB128 varint to `out`.
pub(crate) fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Zigzag encoding maps signed deltas onto small unsigned varints.
pub(crate) fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub(crate) fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

// Fixed-width little-endian primitives for headers.

pub(crate) fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn read_f64(r: &mut impl Read) -> std::io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_bits(u64::from_le_bytes(buf)))
}

/// Streaming decoder for one chunk's record payload.
///
/// The payload starts with a `u32` event count followed by the records.
/// Iteration yields events in order and stops cleanly when either the
/// stated count is reached or the payload ends mid-record; the latter is
/// the expected shape of a trace that is still being appended to, and is
/// reported through [`ChunkDecoder::is_truncated`] rather than as an error.
pub struct ChunkDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    chunk_index: usize,
    scale: f64,
    last_time: f64,
    stated_count: u32,
    decoded: u32,
    truncated: bool,
    failed: bool,
}

impl<'a> ChunkDecoder<'a> {
    /// Create a decoder over `payload`, the byte range named by `info`.
    ///
    /// `payload` may be shorter than the chunk table claims if the file
    /// was cut short; decoding still recovers every complete record.
    pub fn new(info: &ChunkInfo, chunk_index: usize, payload: &'a [u8]) -> Self {
        let mut pos = 0usize;
        let (stated_count, truncated) = if payload.len() >= 4 {
            pos = 4;
            let count = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            (count, false)
        } else {
            // Not even a count prefix yet; an empty, truncated chunk.
            (0, true)
        };
        Self {
            data: payload,
            pos,
            chunk_index,
            scale: info.effective_scale(),
            last_time: info.start_time,
            stated_count,
            decoded: 0,
            truncated,
            failed: false,
        }
    }

    /// Number of complete events decoded so far.
    pub fn decoded_count(&self) -> u32 {
        self.decoded
    }

    /// True once iteration stopped at an incomplete trailing record.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Timestamp of the last fully decoded record; the chunk's base time
    /// if nothing has been decoded. This is the clean end-of-stream
    /// boundary for a partially written chunk.
    pub fn boundary_time(&self) -> f64 {
        self.last_time
    }

    fn next_record(&mut self) -> Result<Option<Event>, FormatError> {
        if self.failed || self.truncated || self.decoded >= self.stated_count {
            return Ok(None);
        }

        // A record is three varints; if any of them runs off the end of
        // the payload we roll back and report a clean truncation.
        let start = self.pos;
        let mut pos = start;

        let fields = (|| -> Result<Option<(u64, u64, u64)>, String> {
            let Some(delta_micros) = read_varint(self.data, &mut pos)? else {
                return Ok(None);
            };
            let Some(raw_size) = read_varint(self.data, &mut pos)? else {
                return Ok(None);
            };
            let Some(stack) = read_varint(self.data, &mut pos)? else {
                return Ok(None);
            };
            Ok(Some((delta_micros, raw_size, stack)))
        })();

        match fields {
            Err(reason) => {
                self.failed = true;
                Err(FormatError::CorruptRecord {
                    chunk: self.chunk_index,
                    reason,
                })
            }
            Ok(None) => {
                self.truncated = true;
                self.pos = start;
                Ok(None)
            }
            Ok(Some((delta_micros, raw_size, stack))) => {
                if stack > u64::from(u32::MAX) {
                    self.failed = true;
                    return Err(FormatError::CorruptRecord {
                        chunk: self.chunk_index,
                        reason: format!("stack reference {} out of range", stack),
                    });
                }
                self.pos = pos;
                self.decoded += 1;
                self.last_time += delta_micros as f64 / MICROS_PER_SEC;
                Ok(Some(Event {
                    timestamp: self.last_time,
                    stack: StackRef(stack as u32),
                    size: zigzag_decode(raw_size),
                    scale: self.scale,
                }))
            }
        }
    }
}

impl Iterator for ChunkDecoder<'_> {
    type Item = Result<Event, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, u64::from(u32::MAX), u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_varint(&buf, &mut pos).unwrap(), Some(value));
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_varint_truncated() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 1 << 40);
        buf.truncate(buf.len() - 1);
        let mut pos = 0;
        assert_eq!(read_varint(&buf, &mut pos).unwrap(), None);
        assert_eq!(pos, 0);
    }

    #[test]
    fn test_varint_overlong() {
        let buf = [0x80u8; 11];
        let mut pos = 0;
        assert!(read_varint(&buf, &mut pos).is_err());
    }

    #[test]
    fn test_zigzag() {
        for value in [0i64, 1, -1, 1000, -1000, i64::MAX, i64::MIN] {
            assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
        // Small magnitudes stay small on the wire.
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
    }
}
