//! Audio subsystem
//!
//! PCM types, the chunk decoder service, and the output graph with its
//! gain and analysis tap.

pub mod analyzer;
pub mod decoder;
pub mod graph;
pub mod types;

pub use analyzer::{Gain, TapSource};
pub use decoder::{ChunkDecoder, DecoderService, SymphoniaChunkDecoder, SymphoniaSource};
pub use graph::{
    BufferHandle, ElementReport, OnEnded, OutputGraph, PlaybackElement, RodioGraph, ScheduleError,
};
pub use types::{AudioAnalysis, FormatMetadata, PcmBlock, ReadSeek, SharedAnalysis};
