//! Raw trace access: header metadata, the binary event decoder, the
//! lazy chunked reader, the stack side-table, and the reference encoder.

pub mod decoder;
pub mod metadata;
pub mod reader;
pub mod stack_table;
pub mod writer;

// Re-export main types
pub use decoder::{ChunkDecoder, Event};
pub use metadata::{ChunkInfo, TraceMetadata};
pub use reader::{DecodedChunk, Events, TraceReader, TraceScan};
pub use stack_table::{Frame, FrameId, StackRef, StackTable};
pub use writer::TraceWriter;
