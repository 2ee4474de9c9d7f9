//! WebM/Matroska container support
//!
//! - `block`: SimpleBlock/Block header handling
//! - `reader`: streaming segment scan tolerant of streamed captures
//! - `writer`: seekable output with SeekHead/Cues indexing

pub mod block;
pub mod reader;
pub mod writer;

pub use block::Lacing;
pub use reader::{Block, RawTags, SegmentInfo, TrackInfo, WebmReader};
pub use writer::WebmWriter;
