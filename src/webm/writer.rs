//! Seekable WebM writer.
//!
//! Produces the repaired/combined output shape: EBML header, a sized
//! Segment holding SeekHead, Info (with Duration), Tracks, optional Tags,
//! clusters, and a trailing Cues index. The Segment size and SeekHead are
//! reserved up front and patched at finalization, so block payloads stream
//! straight through without buffering the whole file.
//!
//! Block bodies are carried verbatim from the source; only the relative
//! timecode and the keyframe flag are rewritten on emit, so bodies that
//! came out of BlockGroups keep their keyframe status as SimpleBlocks.

use std::io::{Seek, SeekFrom, Write};

use crate::ebml::{self, elements as el};
use crate::error::{EngineError, EngineResult};
use crate::tags::TagSet;
use crate::webm::block;
use crate::webm::reader::DEFAULT_TIMECODE_SCALE;

/// Relative block timecodes are i16 ticks; stay well inside the range.
const MAX_CLUSTER_SPAN_MS: i64 = 30_000;

/// Reserved byte length for the SeekHead region (patched at finalize,
/// remainder padded with Void).
const SEEK_HEAD_RESERVED: u64 = 112;

const WRITING_APP: &str = concat!("clipforge/", env!("CARGO_PKG_VERSION"));

struct PendingCluster {
    timecode_ms: i64,
    payload: Vec<u8>,
    /// Position of the cluster element relative to segment data start.
    relative_pos: u64,
    has_cue: bool,
}

struct CuePoint {
    time_ms: i64,
    track: u64,
    cluster_pos: u64,
}

pub struct WebmWriter<W: Write + Seek> {
    out: W,
    segment_size_pos: u64,
    segment_data_start: u64,
    seek_head_pos: u64,
    info_pos: Option<u64>,
    duration_pos: Option<u64>,
    tracks_pos: Option<u64>,
    tags_pos: Option<u64>,
    cues_pos: Option<u64>,
    cluster: Option<PendingCluster>,
    cues: Vec<CuePoint>,
    finalized: bool,
}

impl<W: Write + Seek> WebmWriter<W> {
    /// Writes the EBML header and opens the Segment.
    pub fn new(mut out: W, doc_type: &str) -> EngineResult<Self> {
        let mut header = Vec::new();
        header.extend(ebml::uint_element(el::EBML_VERSION, 1));
        header.extend(ebml::uint_element(el::EBML_READ_VERSION, 1));
        header.extend(ebml::uint_element(el::EBML_MAX_ID_LENGTH, 4));
        header.extend(ebml::uint_element(el::EBML_MAX_SIZE_LENGTH, 8));
        header.extend(ebml::string_element(el::DOC_TYPE, doc_type));
        header.extend(ebml::uint_element(el::DOC_TYPE_VERSION, 4));
        header.extend(ebml::uint_element(el::DOC_TYPE_READ_VERSION, 2));
        out.write_all(&ebml::element(el::EBML_HEADER, &header))?;

        ebml::write_id(&mut out, el::SEGMENT)?;
        let segment_size_pos = out.stream_position()?;
        // 8-byte size placeholder, patched at finalize.
        out.write_all(&[0x01, 0, 0, 0, 0, 0, 0, 0])?;
        let segment_data_start = out.stream_position()?;

        let seek_head_pos = segment_data_start;
        write_void(&mut out, SEEK_HEAD_RESERVED)?;

        Ok(Self {
            out,
            segment_size_pos,
            segment_data_start,
            seek_head_pos,
            info_pos: None,
            duration_pos: None,
            tracks_pos: None,
            tags_pos: None,
            cues_pos: None,
            cluster: None,
            cues: Vec::new(),
            finalized: false,
        })
    }

    fn relative_pos(&mut self) -> EngineResult<u64> {
        Ok(self.out.stream_position()? - self.segment_data_start)
    }

    /// Writes the Info element. Call before any blocks.
    pub fn write_info(&mut self, duration_ms: Option<f64>) -> EngineResult<()> {
        self.info_pos = Some(self.relative_pos()?);
        let mut info = Vec::new();
        info.extend(ebml::uint_element(el::TIMECODE_SCALE, DEFAULT_TIMECODE_SCALE));
        info.extend(ebml::string_element(el::MUXING_APP, WRITING_APP));
        info.extend(ebml::string_element(el::WRITING_APP, WRITING_APP));
        if let Some(d) = duration_ms {
            info.extend(ebml::float_element(el::DURATION, d));
        }
        self.out.write_all(&ebml::element(el::INFO, &info))?;
        Ok(())
    }

    /// Writes the Info element with a zeroed Duration, for outputs whose
    /// span is not known until the last block lands. Patch it with
    /// [`Self::patch_duration`] before finalizing.
    pub fn write_info_deferred(&mut self) -> EngineResult<()> {
        self.info_pos = Some(self.relative_pos()?);
        let mut info = Vec::new();
        info.extend(ebml::uint_element(el::TIMECODE_SCALE, DEFAULT_TIMECODE_SCALE));
        info.extend(ebml::string_element(el::MUXING_APP, WRITING_APP));
        info.extend(ebml::string_element(el::WRITING_APP, WRITING_APP));
        info.extend(ebml::float_element(el::DURATION, 0.0));
        self.out.write_all(&ebml::element(el::INFO, &info))?;
        // The Duration payload is the trailing 8 bytes of the element.
        self.duration_pos = Some(self.out.stream_position()? - 8);
        Ok(())
    }

    /// Overwrites the Duration reserved by [`Self::write_info_deferred`].
    pub fn patch_duration(&mut self, duration_ms: f64) -> EngineResult<()> {
        let pos = self
            .duration_pos
            .ok_or_else(|| EngineError::state("no duration placeholder to patch"))?;
        let end = self.out.stream_position()?;
        self.out.seek(SeekFrom::Start(pos))?;
        self.out.write_all(&duration_ms.to_be_bytes())?;
        self.out.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    /// Writes a Tracks element from a source-provided payload, carried
    /// verbatim so codec private data survives untouched.
    pub fn write_tracks_raw(&mut self, payload: &[u8]) -> EngineResult<()> {
        self.tracks_pos = Some(self.relative_pos()?);
        self.out.write_all(&ebml::element(el::TRACKS, payload))?;
        Ok(())
    }

    /// Writes the Tags element from a prebuilt payload (see
    /// [`build_tags_payload`]).
    pub fn write_tags(&mut self, payload: &[u8]) -> EngineResult<()> {
        self.tags_pos = Some(self.relative_pos()?);
        self.out.write_all(&ebml::element(el::TAGS, payload))?;
        Ok(())
    }

    /// Appends one block. `body` is a complete block body whose relative
    /// timecode is rewritten against the target cluster. Clusters are cut
    /// on keyframes and whenever the relative timecode would leave the
    /// i16 range.
    pub fn add_block(
        &mut self,
        track: u64,
        timestamp_ms: i64,
        keyframe: bool,
        body: &[u8],
    ) -> EngineResult<()> {
        let needs_new = match &self.cluster {
            None => true,
            Some(c) => {
                let rel = timestamp_ms - c.timecode_ms;
                !(0..MAX_CLUSTER_SPAN_MS).contains(&rel)
                    || (keyframe && rel > 0)
            }
        };
        if needs_new {
            self.flush_cluster()?;
            let relative_pos = self.relative_pos()?;
            self.cluster = Some(PendingCluster {
                timecode_ms: timestamp_ms,
                payload: ebml::uint_element(el::TIMECODE, timestamp_ms.max(0) as u64),
                relative_pos,
                has_cue: false,
            });
        }

        let cluster = self.cluster.as_mut().expect("cluster opened above");
        let rel = (timestamp_ms - cluster.timecode_ms) as i16;
        let header = block::parse_block_header(body)?;
        let patched = header.with_timecode(body, rel, keyframe);
        cluster
            .payload
            .extend(ebml::element(el::SIMPLE_BLOCK, &patched));

        if keyframe && !cluster.has_cue {
            cluster.has_cue = true;
            self.cues.push(CuePoint {
                time_ms: timestamp_ms,
                track,
                cluster_pos: cluster.relative_pos,
            });
        }
        Ok(())
    }

    fn flush_cluster(&mut self) -> EngineResult<()> {
        if let Some(cluster) = self.cluster.take() {
            self.out
                .write_all(&ebml::element(el::CLUSTER, &cluster.payload))?;
        }
        Ok(())
    }

    /// Writes the Cues index, patches the Segment size, and fills in the
    /// SeekHead. Must be called exactly once.
    pub fn finalize(&mut self) -> EngineResult<()> {
        if self.finalized {
            return Err(EngineError::state("writer already finalized"));
        }
        self.flush_cluster()?;

        self.cues_pos = Some(self.relative_pos()?);
        let mut cues = Vec::new();
        for cue in &self.cues {
            let mut positions = ebml::uint_element(el::CUE_TRACK, cue.track);
            positions.extend(ebml::uint_element(el::CUE_CLUSTER_POSITION, cue.cluster_pos));
            let mut point = ebml::uint_element(el::CUE_TIME, cue.time_ms.max(0) as u64);
            point.extend(ebml::element(el::CUE_TRACK_POSITIONS, &positions));
            cues.extend(ebml::element(el::CUE_POINT, &point));
        }
        self.out.write_all(&ebml::element(el::CUES, &cues))?;

        let end = self.out.stream_position()?;
        let segment_size = end - self.segment_data_start;
        self.out.seek(SeekFrom::Start(self.segment_size_pos))?;
        // Fixed 8-byte size VINT: marker 0x01, then 56 bits of size.
        let mut size_bytes = segment_size.to_be_bytes();
        size_bytes[0] = 0x01;
        if segment_size >= 1 << 56 {
            return Err(EngineError::format("segment size exceeds VINT range"));
        }
        self.out.write_all(&size_bytes)?;

        self.write_seek_head()?;
        self.out.seek(SeekFrom::Start(end))?;
        self.out.flush()?;
        self.finalized = true;
        Ok(())
    }

    fn write_seek_head(&mut self) -> EngineResult<()> {
        let entries = [
            (el::INFO, self.info_pos),
            (el::TRACKS, self.tracks_pos),
            (el::TAGS, self.tags_pos),
            (el::CUES, self.cues_pos),
        ];
        let mut payload = Vec::new();
        for (id, pos) in entries {
            let Some(pos) = pos else { continue };
            let mut seek = ebml::binary_element(el::SEEK_ID, &id.to_be_bytes());
            seek.extend(ebml::binary_element(el::SEEK_POSITION, &pos.to_be_bytes()));
            payload.extend(ebml::element(el::SEEK, &seek));
        }
        let head = ebml::element(el::SEEK_HEAD, &payload);
        let used = head.len() as u64;
        if used + 2 > SEEK_HEAD_RESERVED {
            return Err(EngineError::format("seek head exceeds reserved space"));
        }
        self.out.seek(SeekFrom::Start(self.seek_head_pos))?;
        self.out.write_all(&head)?;
        write_void(&mut self.out, SEEK_HEAD_RESERVED - used)?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Writes a Void element occupying exactly `total` bytes.
fn write_void<W: Write>(out: &mut W, total: u64) -> EngineResult<()> {
    if total < 2 {
        return Err(EngineError::format("void region too small"));
    }
    // 1-byte ID + 1-byte size covers regions up to 128 bytes.
    let payload = total - 2;
    if payload > 126 {
        return Err(EngineError::format("void region too large"));
    }
    out.write_all(&[0xEC, 0x80 | payload as u8])?;
    out.write_all(&vec![0u8; payload as usize])?;
    Ok(())
}

/// Builds a Tags element payload from plaintext tags and an optional
/// sealed envelope. Plain tags become standard SimpleTags; the envelope
/// travels as one binary SimpleTag named `MTAG`.
pub fn build_tags_payload(tags: &TagSet, envelope: Option<&[u8]>) -> Vec<u8> {
    let mut tag_children = ebml::element(el::TARGETS, &[]);
    for (name, value) in tags.iter() {
        let mut simple = ebml::string_element(el::TAG_NAME, name);
        simple.extend(ebml::string_element(el::TAG_STRING, value));
        tag_children.extend(ebml::element(el::SIMPLE_TAG, &simple));
    }
    if let Some(env) = envelope {
        let mut simple = ebml::string_element(el::TAG_NAME, "MTAG");
        simple.extend(ebml::binary_element(el::TAG_BINARY, env));
        tag_children.extend(ebml::element(el::SIMPLE_TAG, &simple));
    }
    ebml::element(el::TAG, &tag_children)
}

/// Builds a Tracks payload for a single video track.
pub fn build_video_tracks_payload(
    codec_id: &str,
    width: u32,
    height: u32,
    codec_private: Option<&[u8]>,
    default_duration_ns: Option<u64>,
) -> Vec<u8> {
    let mut video = ebml::uint_element(el::PIXEL_WIDTH, width as u64);
    video.extend(ebml::uint_element(el::PIXEL_HEIGHT, height as u64));

    let mut entry = ebml::uint_element(el::TRACK_NUMBER, 1);
    entry.extend(ebml::uint_element(el::TRACK_UID, 1));
    entry.extend(ebml::uint_element(el::TRACK_TYPE, el::TRACK_TYPE_VIDEO));
    if let Some(d) = default_duration_ns {
        entry.extend(ebml::uint_element(el::DEFAULT_DURATION, d));
    }
    entry.extend(ebml::string_element(el::CODEC_ID, codec_id));
    if let Some(private) = codec_private {
        entry.extend(ebml::binary_element(el::CODEC_PRIVATE, private));
    }
    entry.extend(ebml::element(el::VIDEO, &video));
    ebml::element(el::TRACK_ENTRY, &entry)
}
