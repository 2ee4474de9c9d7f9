//! Output multiplexers
//!
//! The capture session writes encoded video through a [`ContainerSink`];
//! `mp4` and `flv` implement it. Both containers carry the engine's tag
//! block at finalization (an MP4 `free` box, an FLV script-tag entry).

pub mod atoms;
pub mod flv;
pub mod mp4;

use crate::error::EngineResult;
use crate::tags::TagSet;

/// Codecs the session can carry without re-encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Av1,
    Vp9,
}

impl VideoCodec {
    /// ISOBMFF sample entry / enhanced-FLV fourcc.
    pub fn fourcc(&self) -> &'static [u8; 4] {
        match self {
            VideoCodec::Av1 => b"av01",
            VideoCodec::Vp9 => b"vp09",
        }
    }

    /// Matroska codec id string.
    pub fn webm_codec_id(&self) -> &'static str {
        match self {
            VideoCodec::Av1 => "V_AV1",
            VideoCodec::Vp9 => "V_VP9",
        }
    }

    pub fn from_webm_codec_id(id: &str) -> Option<VideoCodec> {
        match id {
            "V_AV1" => Some(VideoCodec::Av1),
            "V_VP9" => Some(VideoCodec::Vp9),
            _ => None,
        }
    }
}

/// Static description of the single video track a session writes.
#[derive(Debug, Clone)]
pub struct VideoTrackSpec {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Codec configuration record (av1C contents for AV1; empty for VP9,
    /// where the vpcC is synthesized from the track geometry).
    pub codec_config: Vec<u8>,
}

/// One encoded video sample in presentation order.
#[derive(Debug, Clone)]
pub struct VideoSample<'a> {
    pub data: &'a [u8],
    pub pts_ms: i64,
    pub duration_ms: u32,
    pub keyframe: bool,
}

/// Tag payload handed to the sink at finalization.
#[derive(Debug, Clone, Default)]
pub struct MuxTags {
    pub plain: TagSet,
    pub envelope: Option<Vec<u8>>,
}

/// A single-video-track container writer.
///
/// Call order: `start` once (with the codec configuration in hand), then
/// `write_sample` in strict presentation order, then `finish` once.
pub trait ContainerSink: Send {
    fn start(&mut self, spec: &VideoTrackSpec) -> EngineResult<()>;
    fn write_sample(&mut self, sample: &VideoSample<'_>) -> EngineResult<()>;
    fn finish(&mut self, tags: &MuxTags) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_ids_line_up() {
        assert_eq!(VideoCodec::Av1.fourcc(), b"av01");
        assert_eq!(VideoCodec::Vp9.webm_codec_id(), "V_VP9");
        assert_eq!(
            VideoCodec::from_webm_codec_id("V_AV1"),
            Some(VideoCodec::Av1)
        );
        assert_eq!(VideoCodec::from_webm_codec_id("V_VP8"), None);
    }
}
