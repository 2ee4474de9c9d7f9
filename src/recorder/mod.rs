//! Capture and encode session.
//!
//! A [`Recorder`] owns one output container and accepts frames through
//! two mutually exclusive paths: raw RGBA images encoded to AV1
//! ([`Recorder::add_image`]) or pre-encoded WebM chunks remuxed sample
//! by sample ([`Recorder::add_webm`]). Ingestion entry points report
//! rejection through [`IngestStatus`] instead of raising; construction
//! and nothing else validates eagerly.
//!
//! Presentation times come from an internal frame counter at `1/fps`.
//! Wall-clock time never enters the timeline, so a stalled caller
//! produces a shorter file, not a gappy one.

pub mod codec;
pub mod screen;

pub use screen::{
    record_screen, record_screen_with_source, ScreenRecording, ScreenReport, ScreenSource,
    TestPatternSource,
};

use parking_lot::Mutex;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::mux::flv::FlvWriter;
use crate::mux::mp4::{Mp4Config, Mp4Writer};
use crate::mux::{ContainerSink, MuxTags, VideoCodec, VideoSample, VideoTrackSpec};
use crate::options::{EncodingOptions, OutputFormat};
use crate::tags;
use crate::webm::block::parse_block_header;
use crate::webm::{Lacing, WebmReader};
use codec::VideoEncoder;

/// Why an ingestion call did not accept its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The session is closed.
    SessionClosed,
    /// Frame dimensions differ from the configured geometry.
    GeometryMismatch,
    /// Buffer length does not match width * height * 4.
    SizeMismatch,
    /// The encoder refused or failed on the frame.
    EncoderFailure,
    /// Writing to the output failed.
    IoFailure,
    /// The chunk does not parse as a WebM stream with a video track.
    MalformedChunk,
    /// The chunk's codec cannot be carried without re-encoding.
    UnsupportedCodec,
    /// The session is locked to the other ingestion path or codec.
    CodecMismatch,
    /// Laced blocks are not remuxable sample-by-sample.
    LacedChunk,
}

/// Result of an ingestion call. Converts to `bool` for callers that
/// only care about the accepted/rejected contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestStatus {
    accepted: bool,
    reason: Option<RejectReason>,
}

impl IngestStatus {
    fn ok() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    fn rejected(reason: RejectReason) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    pub fn reason(&self) -> Option<RejectReason> {
        self.reason
    }
}

impl From<IngestStatus> for bool {
    fn from(status: IngestStatus) -> bool {
        status.accepted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Recording,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IngestPath {
    Encode,
    Remux,
}

struct Inner {
    state: State,
    options: EncodingOptions,
    target: PathBuf,
    temp: Option<NamedTempFile>,
    sink: Option<Box<dyn ContainerSink>>,
    encoder: Option<VideoEncoder>,
    path: Option<IngestPath>,
    codec: Option<VideoCodec>,
    /// Source frames accepted on the encode path.
    frame_index: u64,
    /// Next free presentation time on the session timeline.
    timeline_end_ms: i64,
    frames_dropped: u64,
    last_error: Option<String>,
}

impl Inner {
    fn pts_ms(&self, index: u64) -> i64 {
        (index * 1000 / self.options.fps as u64) as i64
    }

    fn frame_duration_ms(&self, index: u64) -> u32 {
        (self.pts_ms(index + 1) - self.pts_ms(index)) as u32
    }

    fn fail(&mut self, reason: RejectReason, err: &EngineError) -> IngestStatus {
        warn!(error = %err, "ingestion failed");
        self.last_error = Some(err.to_string());
        IngestStatus::rejected(reason)
    }

    fn start_sink(&mut self, spec: &VideoTrackSpec) -> EngineResult<()> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| EngineError::state("output already released"))?;
        sink.start(spec)?;
        self.state = State::Recording;
        Ok(())
    }

    fn write_encoded(&mut self, frames: Vec<codec::EncodedFrame>) -> EngineResult<()> {
        for frame in frames {
            let pts_ms = self.pts_ms(frame.frame_index);
            let duration_ms = self.frame_duration_ms(frame.frame_index);
            let sample = VideoSample {
                data: &frame.data,
                pts_ms,
                duration_ms,
                keyframe: frame.keyframe,
            };
            self.sink
                .as_mut()
                .ok_or_else(|| EngineError::state("output already released"))?
                .write_sample(&sample)?;
        }
        Ok(())
    }

    /// Tags embedded at finalization. `creation_time` is stamped unless
    /// the caller supplied one; a password seals the whole block.
    fn final_tags(&self) -> EngineResult<MuxTags> {
        let mut plain = self.options.metadata_tags();
        if plain.get("creation_time").is_none() {
            plain.insert("creation_time", &chrono::Utc::now().to_rfc3339());
        }
        match self.options.password.as_deref() {
            Some(password) => Ok(MuxTags {
                envelope: Some(tags::encode(&plain, Some(password))?),
                plain: tags::TagSet::new(),
            }),
            None => Ok(MuxTags {
                plain,
                envelope: None,
            }),
        }
    }

    fn finalize(&mut self) -> EngineResult<()> {
        if self.path == Some(IngestPath::Encode) {
            if let Some(encoder) = self.encoder.as_mut() {
                let tail = encoder.flush()?;
                self.write_encoded(tail)?;
            }
        }
        if self.state == State::Created {
            // Nothing was ingested; still leave a valid, empty container.
            let spec = self.encode_spec()?;
            self.start_sink(&spec)?;
        }
        let tags = self.final_tags()?;
        let mut sink = self
            .sink
            .take()
            .ok_or_else(|| EngineError::state("output already released"))?;
        sink.finish(&tags)?;
        drop(sink);

        let temp = self
            .temp
            .take()
            .ok_or_else(|| EngineError::state("output already released"))?;
        let file = temp
            .persist(&self.target)
            .map_err(|e| EngineError::Io(e.error))?;
        file.sync_all()?;
        Ok(())
    }

    fn encode_spec(&self) -> EngineResult<VideoTrackSpec> {
        let encoder = self
            .encoder
            .as_ref()
            .ok_or_else(|| EngineError::state("encoder not initialized"))?;
        Ok(VideoTrackSpec {
            codec: VideoCodec::Av1,
            width: self.options.width,
            height: self.options.height,
            fps: self.options.fps,
            codec_config: encoder.config_record(),
        })
    }
}

pub struct Recorder {
    inner: Mutex<Inner>,
}

impl Recorder {
    /// Opens a session writing to `target`. Options are validated and the
    /// output directory is probed here; nothing past construction raises
    /// for expected conditions.
    pub fn new(target: impl AsRef<Path>, mut options: EncodingOptions) -> EngineResult<Recorder> {
        options.validate()?;
        let target = target.as_ref();
        if target.to_string_lossy().contains("://") {
            return Err(EngineError::options(format!(
                "unsupported target '{}': network push is not available, use a file path",
                target.display()
            )));
        }

        let parent = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let temp = NamedTempFile::new_in(parent)?;
        let file = temp.reopen()?;

        let sink: Box<dyn ContainerSink> = match options.format {
            OutputFormat::Mp4 => Box::new(Mp4Writer::new(
                file,
                Mp4Config {
                    fragmented: options.mov_flags().fragmented(),
                    frag_duration_ms: options.frag_duration.unwrap_or(1000),
                    ..Mp4Config::default()
                },
            )),
            OutputFormat::Flv => Box::new(FlvWriter::new(file)),
        };
        let encoder = VideoEncoder::new(&options)?;

        info!(path = %target.display(), format = ?options.format, "session opened");
        Ok(Recorder {
            inner: Mutex::new(Inner {
                state: State::Created,
                options,
                target: target.to_path_buf(),
                temp: Some(temp),
                sink: Some(sink),
                encoder: Some(encoder),
                path: None,
                codec: None,
                frame_index: 0,
                timeline_end_ms: 0,
                frames_dropped: 0,
                last_error: None,
            }),
        })
    }

    /// Encodes one raw RGBA frame into the session.
    pub fn add_image(&self, rgba: &[u8], width: u32, height: u32) -> IngestStatus {
        let mut inner = self.inner.lock();
        if inner.state == State::Closed {
            return IngestStatus::rejected(RejectReason::SessionClosed);
        }
        if inner.path == Some(IngestPath::Remux) {
            return IngestStatus::rejected(RejectReason::CodecMismatch);
        }
        if width != inner.options.width || height != inner.options.height {
            return IngestStatus::rejected(RejectReason::GeometryMismatch);
        }
        if rgba.len() != width as usize * height as usize * 4 {
            return IngestStatus::rejected(RejectReason::SizeMismatch);
        }

        if inner.path.is_none() {
            let spec = match inner.encode_spec() {
                Ok(spec) => spec,
                Err(e) => return inner.fail(RejectReason::EncoderFailure, &e),
            };
            if let Err(e) = inner.start_sink(&spec) {
                return inner.fail(RejectReason::IoFailure, &e);
            }
            inner.path = Some(IngestPath::Encode);
            inner.codec = Some(VideoCodec::Av1);
        }

        let encoded = match inner.encoder.as_mut() {
            Some(encoder) => encoder.encode_rgba(rgba),
            None => return IngestStatus::rejected(RejectReason::SessionClosed),
        };
        let frames = match encoded {
            Ok(frames) => frames,
            Err(e) => {
                inner.frames_dropped += 1;
                return inner.fail(RejectReason::EncoderFailure, &e);
            }
        };
        if let Err(e) = inner.write_encoded(frames) {
            return inner.fail(RejectReason::IoFailure, &e);
        }
        inner.frame_index += 1;
        inner.timeline_end_ms = inner.pts_ms(inner.frame_index);
        IngestStatus::ok()
    }

    /// Remuxes the video samples of a complete WebM byte stream onto the
    /// session timeline, without re-encoding. The chunk is validated in
    /// full before any of it reaches the output.
    pub fn add_webm(&self, data: &[u8]) -> IngestStatus {
        let mut inner = self.inner.lock();
        if inner.state == State::Closed {
            return IngestStatus::rejected(RejectReason::SessionClosed);
        }
        if inner.path == Some(IngestPath::Encode) {
            return IngestStatus::rejected(RejectReason::CodecMismatch);
        }

        let mut reader = match WebmReader::new(Cursor::new(data)) {
            Ok(reader) => reader,
            Err(_) => return IngestStatus::rejected(RejectReason::MalformedChunk),
        };
        let Some(video) = reader.video_track().cloned() else {
            return IngestStatus::rejected(RejectReason::MalformedChunk);
        };
        let Some(codec) = VideoCodec::from_webm_codec_id(&video.codec_id) else {
            debug!(codec = %video.codec_id, "chunk codec not remuxable");
            return IngestStatus::rejected(RejectReason::UnsupportedCodec);
        };
        if inner.codec.is_some() && inner.codec != Some(codec) {
            return IngestStatus::rejected(RejectReason::CodecMismatch);
        }

        let mut blocks = Vec::new();
        loop {
            match reader.next_block() {
                Ok(Some(block)) if block.track == video.number => {
                    if block.lacing != Lacing::None {
                        return IngestStatus::rejected(RejectReason::LacedChunk);
                    }
                    blocks.push(block);
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => return IngestStatus::rejected(RejectReason::MalformedChunk),
            }
        }
        if blocks.is_empty() {
            return IngestStatus::rejected(RejectReason::MalformedChunk);
        }

        if inner.path.is_none() {
            let spec = VideoTrackSpec {
                codec,
                width: video.width.unwrap_or(inner.options.width),
                height: video.height.unwrap_or(inner.options.height),
                fps: inner.options.fps,
                codec_config: video.codec_private.clone().unwrap_or_default(),
            };
            if let Err(e) = inner.start_sink(&spec) {
                return inner.fail(RejectReason::IoFailure, &e);
            }
            inner.path = Some(IngestPath::Remux);
            inner.codec = Some(codec);
        }

        let fallback_ms = (1000 / inner.options.fps).max(1);
        let base_ms = blocks[0].timestamp_ms;
        let offset_ms = inner.timeline_end_ms;
        let mut chunk_end_ms = offset_ms;
        for (i, block) in blocks.iter().enumerate() {
            let header = match parse_block_header(&block.body) {
                Ok(header) => header,
                Err(_) => return IngestStatus::rejected(RejectReason::MalformedChunk),
            };
            let duration_ms = match blocks.get(i + 1) {
                Some(next) => (next.timestamp_ms - block.timestamp_ms).max(1) as u32,
                None => video
                    .default_duration_ns
                    .map(|ns| (ns / 1_000_000).max(1) as u32)
                    .unwrap_or(fallback_ms),
            };
            let pts_ms = offset_ms + (block.timestamp_ms - base_ms);
            let sample = VideoSample {
                data: &block.body[header.payload_offset..],
                pts_ms,
                duration_ms,
                keyframe: block.keyframe,
            };
            let written = inner
                .sink
                .as_mut()
                .ok_or_else(|| EngineError::state("output already released"))
                .and_then(|sink| sink.write_sample(&sample));
            if let Err(e) = written {
                return inner.fail(RejectReason::IoFailure, &e);
            }
            chunk_end_ms = pts_ms + duration_ms as i64;
        }
        inner.timeline_end_ms = chunk_end_ms;
        IngestStatus::ok()
    }

    /// Finalizes the output. Never fails outward; a finalization problem
    /// lands in [`Recorder::last_error`]. Safe to call more than once.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state == State::Closed {
            return;
        }
        if let Err(e) = inner.finalize() {
            warn!(error = %e, "finalization failed");
            inner.last_error = Some(e.to_string());
            // Drop the temp file so no partial output survives.
            inner.temp = None;
            inner.sink = None;
        } else {
            info!(path = %inner.target.display(), duration_ms = inner.timeline_end_ms, "session closed");
        }
        inner.encoder = None;
        inner.state = State::Closed;
    }

    /// Frames the encoder rejected or that failed mid-pipeline.
    pub fn frames_dropped(&self) -> u64 {
        self.inner.lock().frames_dropped
    }

    /// Most recent internal failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().state == State::Closed
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe;
    use crate::webm::writer::{build_video_tracks_payload, WebmWriter};

    fn small_options() -> EncodingOptions {
        EncodingOptions {
            fps: 10,
            width: 64,
            height: 48,
            quality: Some(50),
            ..EncodingOptions::default()
        }
    }

    fn rgba_frame(shade: u8) -> Vec<u8> {
        [shade, shade, shade, 255].repeat(64 * 48)
    }

    fn vp9_chunk(timestamps: &[i64]) -> Vec<u8> {
        let mut writer = WebmWriter::new(Cursor::new(Vec::new()), "webm").unwrap();
        writer.write_info(None).unwrap();
        let tracks = build_video_tracks_payload("V_VP9", 64, 48, None, Some(100_000_000));
        writer.write_tracks_raw(&tracks).unwrap();
        for (i, ts) in timestamps.iter().enumerate() {
            let body = crate::webm::block::build_simple_block(1, 0, i == 0, &[0xAB; 24]).unwrap();
            writer.add_block(1, *ts, i == 0, &body).unwrap();
        }
        writer.finalize().unwrap();
        writer.into_inner().into_inner()
    }

    #[test]
    fn invalid_options_raise_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = small_options();
        options.quality = Some(0);
        let result = Recorder::new(dir.path().join("out.mp4"), options);
        assert!(matches!(result, Err(EngineError::Options(_))));
    }

    #[test]
    fn network_target_is_rejected() {
        let result = Recorder::new("rtmp://live.example/app/key", small_options());
        assert!(matches!(result, Err(EngineError::Options(_))));
    }

    #[test]
    fn missing_output_directory_raises_io() {
        let dir = tempfile::tempdir().unwrap();
        let result = Recorder::new(dir.path().join("no/such/dir/out.mp4"), small_options());
        assert!(matches!(result, Err(EngineError::Io(_))));
    }

    #[test]
    fn encode_session_produces_seekable_mp4() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("session.mp4");
        let recorder = Recorder::new(&target, small_options()).unwrap();
        for i in 0..5u8 {
            let status = recorder.add_image(&rgba_frame(i * 40), 64, 48);
            assert!(bool::from(status), "frame {i} rejected: {status:?}");
        }
        recorder.close();
        assert!(recorder.last_error().is_none());

        let info = probe::probe(&target).unwrap();
        assert_eq!(info.format, probe::ContainerFormat::Mp4);
        assert_eq!(info.duration_ms, Some(500));
        assert_eq!(info.tracks[0].codec, "av01");

        let tags = crate::repair::get_meta_tags(&target, None).unwrap();
        assert!(tags.get("creation_time").is_some());
    }

    #[test]
    fn geometry_and_size_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(dir.path().join("out.mp4"), small_options()).unwrap();
        let status = recorder.add_image(&rgba_frame(0), 32, 48);
        assert_eq!(status.reason(), Some(RejectReason::GeometryMismatch));
        let status = recorder.add_image(&[0u8; 16], 64, 48);
        assert_eq!(status.reason(), Some(RejectReason::SizeMismatch));
        assert_eq!(recorder.frames_dropped(), 0);
    }

    #[test]
    fn close_is_idempotent_and_gates_ingestion() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(dir.path().join("out.mp4"), small_options()).unwrap();
        recorder.add_image(&rgba_frame(10), 64, 48);
        recorder.close();
        recorder.close();
        let status = recorder.add_image(&rgba_frame(20), 64, 48);
        assert_eq!(status.reason(), Some(RejectReason::SessionClosed));
        assert!(recorder.is_closed());
    }

    #[test]
    fn remux_rebases_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("remux.mp4");
        let recorder = Recorder::new(&target, small_options()).unwrap();
        assert!(bool::from(recorder.add_webm(&vp9_chunk(&[0, 100, 200]))));
        assert!(bool::from(recorder.add_webm(&vp9_chunk(&[0, 100]))));
        recorder.close();
        assert!(recorder.last_error().is_none());

        let info = probe::probe(&target).unwrap();
        assert_eq!(info.tracks[0].codec, "vp09");
        // 3 samples + 2 samples, each chunk ending on its default duration.
        assert_eq!(info.duration_ms, Some(500));
    }

    #[test]
    fn paths_are_mutually_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(dir.path().join("out.mp4"), small_options()).unwrap();
        assert!(bool::from(recorder.add_webm(&vp9_chunk(&[0]))));
        let status = recorder.add_image(&rgba_frame(0), 64, 48);
        assert_eq!(status.reason(), Some(RejectReason::CodecMismatch));
    }

    #[test]
    fn garbage_chunk_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(dir.path().join("out.mp4"), small_options()).unwrap();
        let status = recorder.add_webm(b"definitely not webm");
        assert_eq!(status.reason(), Some(RejectReason::MalformedChunk));
    }

    #[test]
    fn encrypted_session_tags_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sealed.mp4");
        let mut options = small_options();
        options.title = Some("capture".into());
        options.password = Some("hunter2".into());
        let recorder = Recorder::new(&target, options).unwrap();
        recorder.add_image(&rgba_frame(128), 64, 48);
        recorder.close();

        let tags = crate::repair::get_meta_tags(&target, Some("hunter2")).unwrap();
        assert_eq!(tags.get("title"), Some("capture"));
        assert!(matches!(
            crate::repair::get_meta_tags(&target, Some("wrong")),
            Err(EngineError::Auth(_))
        ));
        assert!(matches!(
            crate::repair::get_meta_tags(&target, None),
            Err(EngineError::Auth(_))
        ));
    }

    #[test]
    fn flv_session_via_remux() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("session.flv");
        let mut options = small_options();
        options.format = OutputFormat::Flv;
        let recorder = Recorder::new(&target, options).unwrap();
        assert!(bool::from(recorder.add_webm(&vp9_chunk(&[0, 100]))));
        recorder.close();
        assert!(recorder.last_error().is_none());

        let info = probe::probe(&target).unwrap();
        assert_eq!(info.format, probe::ContainerFormat::Flv);
        assert_eq!(info.tracks[0].codec, "vp09");
    }
}
