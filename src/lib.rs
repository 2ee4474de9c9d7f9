//! clipforge - media container engine for screen capture workflows.
//!
//! Three jobs, one crate:
//!
//! - **Repair**: turn streamed, unseekable WebM captures into seekable
//!   files without touching the encoded payload ([`repair::fixup_webm`]).
//! - **Record**: encode raw frames or remux WebM chunks into MP4/FLV
//!   ([`recorder::Recorder`], [`recorder::record_screen`]).
//! - **Combine**: concatenate compatible WebM files with continuous
//!   timestamps ([`combine::combine`]).
//!
//! Metadata travels with every output as a tag block, optionally sealed
//! with a password ([`tags`]). Call [`logging::set_log_level`] once at
//! startup to route diagnostics through `tracing`.

pub mod combine;
pub mod ebml;
pub mod error;
pub mod logging;
pub mod mux;
pub mod options;
pub mod probe;
pub mod recorder;
pub mod repair;
pub mod tags;
pub mod webm;

pub use combine::{combine, combine_async, CombineReport};
pub use error::{EngineError, EngineResult, ErrorResponse};
pub use logging::{set_log_level, LogLevel};
pub use options::{EncodingOptions, OutputFormat};
pub use probe::{probe, ContainerFormat, MediaInfo};
pub use recorder::{
    record_screen, record_screen_with_source, IngestStatus, Recorder, RejectReason,
    ScreenRecording, ScreenReport,
};
pub use repair::{
    fixup_webm, fixup_webm_async, get_meta_tags, get_meta_tags_async, RepairOptions,
};
pub use tags::TagSet;
