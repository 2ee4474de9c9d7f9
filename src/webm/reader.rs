//! Streaming WebM/Matroska reader.
//!
//! Parses the structural tree lazily: the constructor consumes the EBML
//! header and every Segment child up to the first Cluster (Info, Tracks,
//! Tags, ...), then [`WebmReader::next_block`] walks clusters one block at
//! a time. Streamed captures routinely use unknown-size Segment/Cluster
//! elements and may truncate mid-element; truncation at a block boundary
//! ends iteration instead of failing, matching how the repair engine must
//! treat live-captured input.

use std::io::{ErrorKind, Read, Seek, SeekFrom};

use crate::ebml::{self, elements as el};
use crate::error::{EngineError, EngineResult};
use crate::tags::{self, TagSet};
use crate::webm::block::{self, Lacing};

/// Nanoseconds per timecode tick; 1_000_000 means millisecond timecodes.
pub const DEFAULT_TIMECODE_SCALE: u64 = 1_000_000;

#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub timecode_scale: u64,
    /// Duration in timecode ticks, when the header declares one.
    pub duration: Option<f64>,
    pub muxing_app: String,
    pub writing_app: String,
}

impl Default for SegmentInfo {
    fn default() -> Self {
        Self {
            timecode_scale: DEFAULT_TIMECODE_SCALE,
            duration: None,
            muxing_app: String::new(),
            writing_app: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrackInfo {
    pub number: u64,
    pub track_type: u64,
    pub codec_id: String,
    pub codec_private: Option<Vec<u8>>,
    pub default_duration_ns: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub sampling_frequency: Option<f64>,
    pub channels: Option<u32>,
}

impl TrackInfo {
    pub fn is_video(&self) -> bool {
        self.track_type == el::TRACK_TYPE_VIDEO
    }

    pub fn is_audio(&self) -> bool {
        self.track_type == el::TRACK_TYPE_AUDIO
    }
}

/// Tag data found in the container: ordinary SimpleTags plus, when
/// present, the sealed envelope blob.
#[derive(Debug, Clone, Default)]
pub struct RawTags {
    pub plain: TagSet,
    pub envelope: Option<Vec<u8>>,
}

/// One block pulled from a cluster. `body` is the complete block body
/// (track VINT through payload) so writers can carry it verbatim.
#[derive(Debug, Clone)]
pub struct Block {
    pub track: u64,
    /// Absolute presentation time in milliseconds.
    pub timestamp_ms: i64,
    pub keyframe: bool,
    pub lacing: Lacing,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct WebmReader<R: Read + Seek> {
    reader: R,
    pub doc_type: String,
    pub info: SegmentInfo,
    pub tracks: Vec<TrackInfo>,
    /// The Tracks element payload verbatim, for payload-preserving rewrites.
    pub tracks_raw: Vec<u8>,
    pub tags: Option<RawTags>,
    cluster_timecode: i64,
    cluster_end: Option<u64>,
    in_cluster: bool,
    done: bool,
}

impl<R: Read + Seek> WebmReader<R> {
    /// Opens a WebM stream and parses everything up to the first Cluster.
    pub fn new(mut reader: R) -> EngineResult<Self> {
        let header = ebml::read_element(&mut reader)?;
        if header.id != el::EBML_HEADER {
            return Err(EngineError::format("not an EBML stream"));
        }
        let doc_type = parse_doc_type(&mut reader, &header)?;
        if doc_type != "webm" && doc_type != "matroska" {
            return Err(EngineError::format(format!(
                "unsupported doctype '{doc_type}'"
            )));
        }

        let segment = ebml::read_element(&mut reader)?;
        if segment.id != el::SEGMENT {
            return Err(EngineError::format("missing Segment element"));
        }

        let mut this = Self {
            reader,
            doc_type,
            info: SegmentInfo::default(),
            tracks: Vec::new(),
            tracks_raw: Vec::new(),
            tags: None,
            cluster_timecode: 0,
            cluster_end: None,
            in_cluster: false,
            done: false,
        };
        this.scan_head()?;
        Ok(this)
    }

    /// Consumes Segment children until the first Cluster (or EOF).
    fn scan_head(&mut self) -> EngineResult<()> {
        loop {
            let elem = match ebml::read_element(&mut self.reader) {
                Ok(e) => e,
                Err(e) if is_eof(&e) => {
                    self.done = true;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            match elem.id {
                el::INFO => {
                    let payload = ebml::read_binary(&mut self.reader, elem.size)?;
                    self.info = parse_info(&payload)?;
                }
                el::TRACKS => {
                    let payload = ebml::read_binary(&mut self.reader, elem.size)?;
                    self.tracks = parse_tracks(&payload)?;
                    self.tracks_raw = payload;
                }
                el::TAGS => {
                    let payload = ebml::read_binary(&mut self.reader, elem.size)?;
                    self.tags = Some(parse_tags(&payload)?);
                }
                el::CLUSTER => {
                    self.enter_cluster(&elem);
                    return Ok(());
                }
                _ => {
                    if elem.has_unknown_size() {
                        return Err(EngineError::format(format!(
                            "unknown-size element 0x{:X} outside a cluster",
                            elem.id
                        )));
                    }
                    ebml::skip_element(&mut self.reader, elem.size)?;
                }
            }
        }
    }

    fn enter_cluster(&mut self, elem: &ebml::EbmlElement) {
        self.in_cluster = true;
        self.cluster_timecode = 0;
        self.cluster_end = elem.end_offset();
    }

    /// Pulls the next block, entering clusters and passing over trailing
    /// index elements as needed. `None` means clean end of stream; a
    /// truncated final element also ends iteration (streamed captures cut
    /// off wherever the writer died).
    pub fn next_block(&mut self) -> EngineResult<Option<Block>> {
        if self.done {
            return Ok(None);
        }
        loop {
            if self.in_cluster {
                if let Some(end) = self.cluster_end {
                    if self.reader.stream_position()? >= end {
                        self.in_cluster = false;
                        continue;
                    }
                }
            }

            let elem = match ebml::read_element(&mut self.reader) {
                Ok(e) => e,
                Err(e) if is_eof(&e) => {
                    self.done = true;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            match elem.id {
                el::CLUSTER => {
                    self.enter_cluster(&elem);
                }
                el::TIMECODE if self.in_cluster => {
                    self.cluster_timecode =
                        ebml::read_uint(&mut self.reader, elem.size)? as i64;
                }
                el::SIMPLE_BLOCK if self.in_cluster => {
                    let body = match self.read_payload(elem.size)? {
                        Some(b) => b,
                        None => return Ok(None),
                    };
                    let header = block::parse_block_header(&body)?;
                    return Ok(Some(self.make_block(header, body)));
                }
                el::BLOCK_GROUP if self.in_cluster => {
                    let payload = match self.read_payload(elem.size)? {
                        Some(b) => b,
                        None => return Ok(None),
                    };
                    if let Some(blk) = self.parse_block_group(&payload)? {
                        return Ok(Some(blk));
                    }
                }
                el::TAGS => {
                    self.in_cluster = false;
                    let payload = ebml::read_binary(&mut self.reader, elem.size)?;
                    if self.tags.is_none() {
                        self.tags = Some(parse_tags(&payload)?);
                    }
                }
                _ => {
                    if elem.has_unknown_size() {
                        // A second unknown-size element can only be garbage.
                        tracing::warn!(
                            id = format!("0x{:X}", elem.id),
                            "stopping at unknown-size element"
                        );
                        self.done = true;
                        return Ok(None);
                    }
                    if elem.id != el::VOID
                        && elem.id != el::CRC32
                        && elem.id != el::CUES
                        && elem.id != el::SEEK_HEAD
                        && !self.in_cluster
                    {
                        tracing::debug!(id = format!("0x{:X}", elem.id), "skipping element");
                    }
                    if self.skip_or_stop(elem.size)? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Reads a payload, treating truncation at end of stream as a clean
    /// stop rather than an error.
    fn read_payload(&mut self, size: u64) -> EngineResult<Option<Vec<u8>>> {
        if size == u64::MAX {
            return Err(EngineError::format("block with unknown size"));
        }
        match ebml::read_binary(&mut self.reader, size) {
            Ok(b) => Ok(Some(b)),
            Err(e) if is_eof(&e) => {
                tracing::warn!("input truncated mid-block; stopping");
                self.done = true;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn skip_or_stop(&mut self, size: u64) -> EngineResult<bool> {
        match ebml::skip_element(&mut self.reader, size) {
            Ok(()) => Ok(false),
            Err(e) if is_eof(&e) => {
                self.done = true;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    fn make_block(&self, header: block::BlockHeader, body: Vec<u8>) -> Block {
        let ticks = self.cluster_timecode + header.timecode_offset as i64;
        Block {
            track: header.track_number,
            timestamp_ms: ticks_to_ms(ticks, self.info.timecode_scale),
            keyframe: header.keyframe,
            lacing: header.lacing,
            body,
        }
    }

    /// A BlockGroup wraps a Block whose keyframe status is the absence of
    /// any ReferenceBlock sibling.
    fn parse_block_group(&self, payload: &[u8]) -> EngineResult<Option<Block>> {
        let mut cursor = std::io::Cursor::new(payload);
        let mut body: Option<Vec<u8>> = None;
        let mut has_reference = false;
        while (cursor.position() as usize) < payload.len() {
            let elem = ebml::read_element(&mut cursor)?;
            match elem.id {
                el::BLOCK => body = Some(ebml::read_binary(&mut cursor, elem.size)?),
                el::REFERENCE_BLOCK => {
                    has_reference = true;
                    ebml::skip_element(&mut cursor, elem.size)?;
                }
                _ => ebml::skip_element(&mut cursor, elem.size)?,
            }
        }
        let Some(body) = body else {
            return Ok(None);
        };
        let mut header = block::parse_block_header(&body)?;
        header.keyframe = !has_reference;
        Ok(Some(self.make_block(header, body)))
    }

    pub fn video_track(&self) -> Option<&TrackInfo> {
        self.tracks.iter().find(|t| t.is_video())
    }

    pub fn track(&self, number: u64) -> Option<&TrackInfo> {
        self.tracks.iter().find(|t| t.number == number)
    }

    /// Declared duration in milliseconds, when the Info element has one.
    pub fn declared_duration_ms(&self) -> Option<i64> {
        self.info
            .duration
            .map(|d| ticks_to_ms(d.round() as i64, self.info.timecode_scale))
    }

    /// Rewinds to the start of the stream, for a second pass.
    pub fn into_inner(mut self) -> EngineResult<R> {
        self.reader.seek(SeekFrom::Start(0))?;
        Ok(self.reader)
    }
}

fn is_eof(e: &EngineError) -> bool {
    matches!(e, EngineError::Io(io) if io.kind() == ErrorKind::UnexpectedEof)
}

fn ticks_to_ms(ticks: i64, timecode_scale: u64) -> i64 {
    if timecode_scale == DEFAULT_TIMECODE_SCALE {
        ticks
    } else {
        (ticks as i128 * timecode_scale as i128 / 1_000_000) as i64
    }
}

fn parse_doc_type<R: Read + Seek>(
    reader: &mut R,
    header: &ebml::EbmlElement,
) -> EngineResult<String> {
    let payload = ebml::read_binary(reader, header.size)?;
    let mut cursor = std::io::Cursor::new(&payload);
    let mut doc_type = String::from("matroska");
    while (cursor.position() as usize) < payload.len() {
        let elem = ebml::read_element(&mut cursor)?;
        if elem.id == el::DOC_TYPE {
            doc_type = ebml::read_string(&mut cursor, elem.size)?;
        } else {
            ebml::skip_element(&mut cursor, elem.size)?;
        }
    }
    Ok(doc_type)
}

fn parse_info(payload: &[u8]) -> EngineResult<SegmentInfo> {
    let mut cursor = std::io::Cursor::new(payload);
    let mut info = SegmentInfo::default();
    while (cursor.position() as usize) < payload.len() {
        let elem = ebml::read_element(&mut cursor)?;
        match elem.id {
            el::TIMECODE_SCALE => info.timecode_scale = ebml::read_uint(&mut cursor, elem.size)?,
            el::DURATION => info.duration = Some(ebml::read_float(&mut cursor, elem.size)?),
            el::MUXING_APP => info.muxing_app = ebml::read_string(&mut cursor, elem.size)?,
            el::WRITING_APP => info.writing_app = ebml::read_string(&mut cursor, elem.size)?,
            _ => ebml::skip_element(&mut cursor, elem.size)?,
        }
    }
    if info.timecode_scale == 0 {
        return Err(EngineError::format("zero timecode scale"));
    }
    Ok(info)
}

fn parse_tracks(payload: &[u8]) -> EngineResult<Vec<TrackInfo>> {
    let mut cursor = std::io::Cursor::new(payload);
    let mut tracks = Vec::new();
    while (cursor.position() as usize) < payload.len() {
        let elem = ebml::read_element(&mut cursor)?;
        if elem.id == el::TRACK_ENTRY {
            let entry = ebml::read_binary(&mut cursor, elem.size)?;
            tracks.push(parse_track_entry(&entry)?);
        } else {
            ebml::skip_element(&mut cursor, elem.size)?;
        }
    }
    Ok(tracks)
}

fn parse_track_entry(payload: &[u8]) -> EngineResult<TrackInfo> {
    let mut cursor = std::io::Cursor::new(payload);
    let mut track = TrackInfo::default();
    while (cursor.position() as usize) < payload.len() {
        let elem = ebml::read_element(&mut cursor)?;
        match elem.id {
            el::TRACK_NUMBER => track.number = ebml::read_uint(&mut cursor, elem.size)?,
            el::TRACK_TYPE => track.track_type = ebml::read_uint(&mut cursor, elem.size)?,
            el::CODEC_ID => track.codec_id = ebml::read_string(&mut cursor, elem.size)?,
            el::CODEC_PRIVATE => {
                track.codec_private = Some(ebml::read_binary(&mut cursor, elem.size)?)
            }
            el::DEFAULT_DURATION => {
                track.default_duration_ns = Some(ebml::read_uint(&mut cursor, elem.size)?)
            }
            el::VIDEO => {
                let video = ebml::read_binary(&mut cursor, elem.size)?;
                let mut vc = std::io::Cursor::new(&video);
                while (vc.position() as usize) < video.len() {
                    let ve = ebml::read_element(&mut vc)?;
                    match ve.id {
                        el::PIXEL_WIDTH => {
                            track.width = Some(ebml::read_uint(&mut vc, ve.size)? as u32)
                        }
                        el::PIXEL_HEIGHT => {
                            track.height = Some(ebml::read_uint(&mut vc, ve.size)? as u32)
                        }
                        _ => ebml::skip_element(&mut vc, ve.size)?,
                    }
                }
            }
            el::AUDIO => {
                let audio = ebml::read_binary(&mut cursor, elem.size)?;
                let mut ac = std::io::Cursor::new(&audio);
                while (ac.position() as usize) < audio.len() {
                    let ae = ebml::read_element(&mut ac)?;
                    match ae.id {
                        el::SAMPLING_FREQUENCY => {
                            track.sampling_frequency = Some(ebml::read_float(&mut ac, ae.size)?)
                        }
                        el::CHANNELS => {
                            track.channels = Some(ebml::read_uint(&mut ac, ae.size)? as u32)
                        }
                        _ => ebml::skip_element(&mut ac, ae.size)?,
                    }
                }
            }
            _ => ebml::skip_element(&mut cursor, elem.size)?,
        }
    }
    Ok(track)
}

/// Parses a Tags element payload into plain SimpleTags plus the sealed
/// envelope, when one is present under the reserved `MTAG` name.
pub fn parse_tags(payload: &[u8]) -> EngineResult<RawTags> {
    let mut cursor = std::io::Cursor::new(payload);
    let mut raw = RawTags::default();
    while (cursor.position() as usize) < payload.len() {
        let elem = ebml::read_element(&mut cursor)?;
        if elem.id != el::TAG {
            ebml::skip_element(&mut cursor, elem.size)?;
            continue;
        }
        let tag = ebml::read_binary(&mut cursor, elem.size)?;
        let mut tc = std::io::Cursor::new(&tag);
        while (tc.position() as usize) < tag.len() {
            let te = ebml::read_element(&mut tc)?;
            if te.id != el::SIMPLE_TAG {
                ebml::skip_element(&mut tc, te.size)?;
                continue;
            }
            let simple = ebml::read_binary(&mut tc, te.size)?;
            let mut name = String::new();
            let mut value: Option<String> = None;
            let mut binary: Option<Vec<u8>> = None;
            let mut sc = std::io::Cursor::new(&simple);
            while (sc.position() as usize) < simple.len() {
                let se = ebml::read_element(&mut sc)?;
                match se.id {
                    el::TAG_NAME => name = ebml::read_string(&mut sc, se.size)?,
                    el::TAG_STRING => value = Some(ebml::read_string(&mut sc, se.size)?),
                    el::TAG_BINARY => binary = Some(ebml::read_binary(&mut sc, se.size)?),
                    _ => ebml::skip_element(&mut sc, se.size)?,
                }
            }
            if name == "MTAG" {
                if let Some(b) = binary {
                    raw.envelope = Some(b);
                } else if let Some(v) = value {
                    raw.envelope = Some(v.into_bytes());
                }
            } else if !name.is_empty() {
                if let Some(v) = value {
                    raw.plain.insert(name, v);
                }
            }
        }
    }
    Ok(raw)
}

/// Resolves raw tag data into a tag set, decoding the envelope when
/// present. Plain SimpleTags and envelope contents are merged, envelope
/// entries winning.
pub fn resolve_tags(raw: &RawTags, password: Option<&str>) -> EngineResult<TagSet> {
    match &raw.envelope {
        None => Ok(raw.plain.clone()),
        Some(env) => {
            let mut decoded = tags::decode(env, password)?;
            decoded.merge_missing(&raw.plain);
            Ok(decoded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebml::{element, float_element, string_element, uint_element};
    use std::io::Cursor;

    fn ebml_header() -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend(uint_element(el::EBML_VERSION, 1));
        payload.extend(string_element(el::DOC_TYPE, "webm"));
        element(el::EBML_HEADER, &payload)
    }

    fn video_tracks() -> Vec<u8> {
        let mut video = Vec::new();
        video.extend(uint_element(el::PIXEL_WIDTH, 320));
        video.extend(uint_element(el::PIXEL_HEIGHT, 240));
        let mut entry = Vec::new();
        entry.extend(uint_element(el::TRACK_NUMBER, 1));
        entry.extend(uint_element(el::TRACK_TYPE, el::TRACK_TYPE_VIDEO));
        entry.extend(string_element(el::CODEC_ID, "V_VP9"));
        entry.extend(element(el::VIDEO, &video));
        element(el::TRACKS, &element(el::TRACK_ENTRY, &entry))
    }

    fn simple_block(track: u8, rel: i16, keyframe: bool, payload: &[u8]) -> Vec<u8> {
        let mut body = vec![0x80 | track];
        body.extend_from_slice(&rel.to_be_bytes());
        body.push(if keyframe { 0x80 } else { 0x00 });
        body.extend_from_slice(payload);
        element(el::SIMPLE_BLOCK, &body)
    }

    /// A streamed-style file: unknown-size Segment and Cluster.
    fn streamed_webm() -> Vec<u8> {
        let mut out = ebml_header();
        // Segment with unknown size (8-byte all-ones VINT)
        out.extend_from_slice(&[0x18, 0x53, 0x80, 0x67]);
        out.extend_from_slice(&[0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);

        let mut info = Vec::new();
        info.extend(uint_element(el::TIMECODE_SCALE, 1_000_000));
        out.extend(element(el::INFO, &info));
        out.extend(video_tracks());

        // Unknown-size cluster
        out.extend_from_slice(&[0x1F, 0x43, 0xB6, 0x75, 0xFF]);
        out.extend(uint_element(el::TIMECODE, 0));
        out.extend(simple_block(1, 0, true, &[0x11]));
        out.extend(simple_block(1, 40, false, &[0x22]));
        out.extend(simple_block(1, 80, false, &[0x33]));
        out
    }

    #[test]
    fn reads_streamed_file() {
        let mut reader = WebmReader::new(Cursor::new(streamed_webm())).unwrap();
        assert_eq!(reader.doc_type, "webm");
        assert_eq!(reader.tracks.len(), 1);
        let track = reader.video_track().unwrap();
        assert_eq!(track.codec_id, "V_VP9");
        assert_eq!((track.width, track.height), (Some(320), Some(240)));
        assert!(reader.declared_duration_ms().is_none());

        let mut stamps = Vec::new();
        while let Some(blk) = reader.next_block().unwrap() {
            stamps.push((blk.timestamp_ms, blk.keyframe));
        }
        assert_eq!(stamps, vec![(0, true), (40, false), (80, false)]);
    }

    #[test]
    fn tolerates_truncated_tail() {
        let mut data = streamed_webm();
        // Cut into the middle of the final block.
        data.truncate(data.len() - 1);
        let mut reader = WebmReader::new(Cursor::new(data)).unwrap();
        let mut count = 0;
        while let Some(_blk) = reader.next_block().unwrap() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn rejects_non_ebml_input() {
        let err = WebmReader::new(Cursor::new(b"RIFFxxxx".to_vec())).unwrap_err();
        assert!(matches!(err, EngineError::Format(_)));
    }

    #[test]
    fn block_group_keyframe_from_reference() {
        let mut out = ebml_header();
        out.extend_from_slice(&[0x18, 0x53, 0x80, 0x67]);
        out.extend_from_slice(&[0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        out.extend(video_tracks());
        out.extend_from_slice(&[0x1F, 0x43, 0xB6, 0x75, 0xFF]);
        out.extend(uint_element(el::TIMECODE, 100));

        // Keyframe: group without ReferenceBlock
        let mut body = vec![0x81, 0x00, 0x00, 0x00];
        body.push(0xAB);
        let mut group = element(el::BLOCK, &body);
        out.extend(element(el::BLOCK_GROUP, &group));

        // Interframe: group with ReferenceBlock
        group = element(el::BLOCK, &body);
        group.extend(uint_element(el::REFERENCE_BLOCK, 0));
        out.extend(element(el::BLOCK_GROUP, &group));

        let mut reader = WebmReader::new(Cursor::new(out)).unwrap();
        let first = reader.next_block().unwrap().unwrap();
        assert!(first.keyframe);
        assert_eq!(first.timestamp_ms, 100);
        let second = reader.next_block().unwrap().unwrap();
        assert!(!second.keyframe);
    }

    #[test]
    fn finds_trailing_tags() {
        let mut out = ebml_header();
        let mut segment = Vec::new();
        let mut info = Vec::new();
        info.extend(uint_element(el::TIMECODE_SCALE, 1_000_000));
        info.extend(float_element(el::DURATION, 80.0));
        segment.extend(element(el::INFO, &info));
        segment.extend(video_tracks());

        let mut cluster = uint_element(el::TIMECODE, 0);
        cluster.extend(simple_block(1, 0, true, &[0x01]));
        segment.extend(element(el::CLUSTER, &cluster));

        let mut simple = string_element(el::TAG_NAME, "comment");
        simple.extend(string_element(el::TAG_STRING, "ata"));
        let tag = element(el::SIMPLE_TAG, &simple);
        segment.extend(element(el::TAGS, &element(el::TAG, &tag)));

        out.extend(element(el::SEGMENT, &segment));

        let mut reader = WebmReader::new(Cursor::new(out)).unwrap();
        assert_eq!(reader.declared_duration_ms(), Some(80));
        while reader.next_block().unwrap().is_some() {}
        let raw = reader.tags.expect("tags parsed");
        assert_eq!(raw.plain.get("comment"), Some("ata"));
        assert!(raw.envelope.is_none());
    }

    #[test]
    fn resolve_tags_decodes_envelope() {
        let mut set = TagSet::new();
        set.insert("title", "t");
        let env = tags::encode(&set, Some("pw")).unwrap();
        let raw = RawTags {
            plain: TagSet::new(),
            envelope: Some(env),
        };
        assert_eq!(resolve_tags(&raw, Some("pw")).unwrap(), set);
        assert!(matches!(
            resolve_tags(&raw, None),
            Err(EngineError::Auth(_))
        ));
    }
}
