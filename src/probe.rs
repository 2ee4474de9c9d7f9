//! Container inspection.
//!
//! Detects the container by magic bytes and walks just enough structure
//! to report format, duration, and track geometry. `combine` uses this as
//! its compatibility gate; it is also the dispatcher behind
//! `get_meta_tags`, routing each container's tag carrier to the tag
//! codec.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{EngineError, EngineResult};
use crate::mux::flv::amf;
use crate::tags::{self, TagSet};
use crate::webm::WebmReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Webm,
    Mp4,
    Flv,
}

impl ContainerFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerFormat::Webm => "webm",
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Flv => "flv",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeTrack {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub is_video: bool,
}

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub format: ContainerFormat,
    pub duration_ms: Option<u64>,
    pub tracks: Vec<ProbeTrack>,
}

/// Detects the container from leading magic bytes.
pub fn detect_format(data: &[u8]) -> Option<ContainerFormat> {
    if data.len() >= 4 && data[0..4] == [0x1A, 0x45, 0xDF, 0xA3] {
        return Some(ContainerFormat::Webm);
    }
    if data.len() >= 8 && &data[4..8] == b"ftyp" {
        return Some(ContainerFormat::Mp4);
    }
    if data.len() >= 3 && &data[0..3] == b"FLV" {
        return Some(ContainerFormat::Flv);
    }
    None
}

pub fn probe(path: &Path) -> EngineResult<MediaInfo> {
    let data = std::fs::read(path)?;
    probe_bytes(&data)
}

pub fn probe_bytes(data: &[u8]) -> EngineResult<MediaInfo> {
    match detect_format(data) {
        Some(ContainerFormat::Webm) => probe_webm(data),
        Some(ContainerFormat::Mp4) => probe_mp4(data),
        Some(ContainerFormat::Flv) => probe_flv(data),
        None => Err(EngineError::format("unrecognized container")),
    }
}

/// Extracts the tag block from any supported container.
pub fn read_tags_from_bytes(data: &[u8], password: Option<&str>) -> EngineResult<TagSet> {
    match detect_format(data) {
        Some(ContainerFormat::Webm) => crate::repair::read_webm_tags(data, password),
        Some(ContainerFormat::Mp4) => read_mp4_tags(data, password),
        Some(ContainerFormat::Flv) => read_flv_tags(data, password),
        None => Err(EngineError::format("unrecognized container")),
    }
}

// ── WebM ─────────────────────────────────────────────────────────────

fn probe_webm(data: &[u8]) -> EngineResult<MediaInfo> {
    let reader = WebmReader::new(Cursor::new(data))?;
    let tracks = reader
        .tracks
        .iter()
        .map(|t| ProbeTrack {
            codec: t.codec_id.clone(),
            width: t.width.unwrap_or(0) as u32,
            height: t.height.unwrap_or(0) as u32,
            is_video: t.is_video(),
        })
        .collect();
    Ok(MediaInfo {
        format: ContainerFormat::Webm,
        duration_ms: reader.declared_duration_ms().map(|d| d.max(0) as u64),
        tracks,
    })
}

// ── MP4 ──────────────────────────────────────────────────────────────

struct BoxHeader {
    box_type: [u8; 4],
    data_start: u64,
    data_end: u64,
}

/// Reads one box header at the cursor, bounded by `limit`.
fn read_box<R: Read + Seek>(input: &mut R, limit: u64) -> EngineResult<Option<BoxHeader>> {
    let pos = input.stream_position()?;
    if pos + 8 > limit {
        return Ok(None);
    }
    let size32 = input.read_u32::<BigEndian>()?;
    let mut box_type = [0u8; 4];
    input.read_exact(&mut box_type)?;
    let (data_start, size) = match size32 {
        0 => (pos + 8, limit - pos),
        1 => {
            let large = input.read_u64::<BigEndian>()?;
            (pos + 16, large)
        }
        n => (pos + 8, n as u64),
    };
    if size < data_start - pos || pos + size > limit {
        return Err(EngineError::format("mp4 box overruns its parent"));
    }
    Ok(Some(BoxHeader {
        box_type,
        data_start,
        data_end: pos + size,
    }))
}

fn probe_mp4(data: &[u8]) -> EngineResult<MediaInfo> {
    let mut cur = Cursor::new(data);
    let limit = data.len() as u64;
    let mut duration_ms: Option<u64> = None;
    let mut fragment_ms: u64 = 0;
    let mut tracks = Vec::new();

    while let Some(header) = read_box(&mut cur, limit)? {
        match &header.box_type {
            b"moov" => {
                parse_moov(&mut cur, &header, &mut duration_ms, &mut tracks)?;
            }
            b"moof" => {
                fragment_ms += sum_fragment_duration(&mut cur, &header)?;
            }
            _ => {}
        }
        cur.seek(SeekFrom::Start(header.data_end))?;
    }

    // A fragmented moov declares duration 0; the fragments carry it.
    if duration_ms.unwrap_or(0) == 0 && fragment_ms > 0 {
        duration_ms = Some(fragment_ms);
    }
    Ok(MediaInfo {
        format: ContainerFormat::Mp4,
        duration_ms,
        tracks,
    })
}

fn parse_moov(
    cur: &mut Cursor<&[u8]>,
    moov: &BoxHeader,
    duration_ms: &mut Option<u64>,
    tracks: &mut Vec<ProbeTrack>,
) -> EngineResult<()> {
    cur.seek(SeekFrom::Start(moov.data_start))?;
    while let Some(child) = read_box(cur, moov.data_end)? {
        match &child.box_type {
            b"mvhd" => {
                let version = cur.read_u8()?;
                cur.seek(SeekFrom::Current(3))?; // flags
                let (timescale, duration) = if version == 1 {
                    cur.seek(SeekFrom::Current(16))?;
                    let ts = cur.read_u32::<BigEndian>()?;
                    (ts, cur.read_u64::<BigEndian>()?)
                } else {
                    cur.seek(SeekFrom::Current(8))?;
                    let ts = cur.read_u32::<BigEndian>()?;
                    (ts, cur.read_u32::<BigEndian>()? as u64)
                };
                if timescale > 0 && duration > 0 {
                    *duration_ms = Some(duration * 1000 / timescale as u64);
                }
            }
            b"trak" => {
                if let Some(track) = parse_trak(cur, &child)? {
                    tracks.push(track);
                }
            }
            _ => {}
        }
        cur.seek(SeekFrom::Start(child.data_end))?;
    }
    Ok(())
}

fn parse_trak(cur: &mut Cursor<&[u8]>, trak: &BoxHeader) -> EngineResult<Option<ProbeTrack>> {
    let mut handler = [0u8; 4];
    let mut entry: Option<([u8; 4], u32, u32)> = None;

    fn walk(
        cur: &mut Cursor<&[u8]>,
        parent: &BoxHeader,
        handler: &mut [u8; 4],
        entry: &mut Option<([u8; 4], u32, u32)>,
    ) -> EngineResult<()> {
        cur.seek(SeekFrom::Start(parent.data_start))?;
        while let Some(child) = read_box(cur, parent.data_end)? {
            match &child.box_type {
                b"mdia" | b"minf" | b"stbl" => {
                    walk(cur, &child, handler, entry)?;
                }
                b"hdlr" => {
                    cur.seek(SeekFrom::Current(8))?; // version/flags + pre_defined
                    cur.read_exact(handler)?;
                }
                b"stsd" => {
                    cur.seek(SeekFrom::Current(4))?; // version/flags
                    let count = cur.read_u32::<BigEndian>()?;
                    if count > 0 {
                        if let Some(sample) = read_box(cur, child.data_end)? {
                            // width/height sit 24 bytes into the visual entry
                            cur.seek(SeekFrom::Start(sample.data_start + 24))?;
                            let width = cur.read_u16::<BigEndian>()? as u32;
                            let height = cur.read_u16::<BigEndian>()? as u32;
                            *entry = Some((sample.box_type, width, height));
                        }
                    }
                }
                _ => {}
            }
            cur.seek(SeekFrom::Start(child.data_end))?;
        }
        Ok(())
    }

    walk(cur, trak, &mut handler, &mut entry)?;
    Ok(entry.map(|(fourcc, width, height)| ProbeTrack {
        codec: String::from_utf8_lossy(&fourcc).into_owned(),
        width,
        height,
        is_video: &handler == b"vide",
    }))
}

/// Sums per-sample durations from every trun in a fragment. The writer
/// always emits explicit durations, so tfhd defaults are not consulted.
fn sum_fragment_duration(cur: &mut Cursor<&[u8]>, moof: &BoxHeader) -> EngineResult<u64> {
    let mut total = 0u64;
    cur.seek(SeekFrom::Start(moof.data_start))?;
    while let Some(traf) = read_box(cur, moof.data_end)? {
        if &traf.box_type == b"traf" {
            cur.seek(SeekFrom::Start(traf.data_start))?;
            while let Some(child) = read_box(cur, traf.data_end)? {
                if &child.box_type == b"trun" {
                    cur.seek(SeekFrom::Current(1))?; // version
                    let flags = cur.read_u24::<BigEndian>()?;
                    let count = cur.read_u32::<BigEndian>()?;
                    if flags & 0x000001 != 0 {
                        cur.seek(SeekFrom::Current(4))?; // data offset
                    }
                    if flags & 0x000004 != 0 {
                        cur.seek(SeekFrom::Current(4))?; // first sample flags
                    }
                    if flags & 0x000100 != 0 {
                        let mut per_sample = 4i64;
                        for f in [0x000200u32, 0x000400] {
                            if flags & f != 0 {
                                per_sample += 4;
                            }
                        }
                        if flags & 0x000800 != 0 {
                            per_sample += 4;
                        }
                        for _ in 0..count {
                            total += cur.read_u32::<BigEndian>()? as u64;
                            cur.seek(SeekFrom::Current(per_sample - 4))?;
                        }
                    }
                }
                cur.seek(SeekFrom::Start(child.data_end))?;
            }
        }
        cur.seek(SeekFrom::Start(traf.data_end))?;
    }
    Ok(total)
}

/// Tag envelope lives in a top-level `free` box starting with the magic.
fn read_mp4_tags(data: &[u8], password: Option<&str>) -> EngineResult<TagSet> {
    let mut cur = Cursor::new(data);
    let limit = data.len() as u64;
    while let Some(header) = read_box(&mut cur, limit)? {
        if &header.box_type == b"free" {
            let start = header.data_start as usize;
            let end = header.data_end as usize;
            if tags::is_envelope(&data[start..end]) {
                return tags::decode(&data[start..end], password);
            }
        }
        cur.seek(SeekFrom::Start(header.data_end))?;
    }
    Ok(TagSet::new())
}

// ── FLV ──────────────────────────────────────────────────────────────

struct FlvTag {
    tag_type: u8,
    timestamp_ms: u32,
    data_start: usize,
    data_end: usize,
}

fn flv_tags(data: &[u8]) -> EngineResult<Vec<FlvTag>> {
    if data.len() < 9 {
        return Err(EngineError::format("flv header truncated"));
    }
    let header_len = u32::from_be_bytes(
        data[5..9]
            .try_into()
            .map_err(|_| EngineError::format("flv header truncated"))?,
    ) as usize;
    let mut pos = header_len + 4; // skip the leading back-pointer
    let mut out = Vec::new();
    while pos + 11 <= data.len() {
        let tag_type = data[pos];
        let size = u32::from_be_bytes([0, data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        let timestamp_ms = u32::from_be_bytes([
            data[pos + 7],
            data[pos + 4],
            data[pos + 5],
            data[pos + 6],
        ]);
        let data_start = pos + 11;
        let data_end = data_start + size;
        if data_end + 4 > data.len() {
            break; // truncated tail
        }
        out.push(FlvTag {
            tag_type,
            timestamp_ms,
            data_start,
            data_end,
        });
        pos = data_end + 4;
    }
    Ok(out)
}

fn probe_flv(data: &[u8]) -> EngineResult<MediaInfo> {
    let mut duration_ms: Option<u64> = None;
    let mut last_video_ms: Option<u64> = None;
    let mut track: Option<ProbeTrack> = None;

    for tag in flv_tags(data)? {
        let body = &data[tag.data_start..tag.data_end];
        match tag.tag_type {
            18 => {
                if let Some(props) = script_properties(body) {
                    let mut width = 0u32;
                    let mut height = 0u32;
                    for (name, value) in &props {
                        match name.as_str() {
                            "duration" => {
                                if let Some(secs) = value.as_f64() {
                                    if secs > 0.0 {
                                        duration_ms = Some((secs * 1000.0).round() as u64);
                                    }
                                }
                            }
                            "width" => width = value.as_f64().unwrap_or(0.0) as u32,
                            "height" => height = value.as_f64().unwrap_or(0.0) as u32,
                            _ => {}
                        }
                    }
                    if width > 0 && track.is_none() {
                        track = Some(ProbeTrack {
                            codec: String::new(),
                            width,
                            height,
                            is_video: true,
                        });
                    }
                }
            }
            9 => {
                if body.len() >= 5 && body[0] & 0x80 != 0 {
                    let fourcc = String::from_utf8_lossy(&body[1..5]).into_owned();
                    match &mut track {
                        Some(t) if t.codec.is_empty() => t.codec = fourcc,
                        None => {
                            track = Some(ProbeTrack {
                                codec: fourcc,
                                width: 0,
                                height: 0,
                                is_video: true,
                            })
                        }
                        _ => {}
                    }
                }
                last_video_ms = Some(tag.timestamp_ms as u64);
            }
            _ => {}
        }
    }

    Ok(MediaInfo {
        format: ContainerFormat::Flv,
        duration_ms: duration_ms.or(last_video_ms),
        tracks: track.into_iter().collect(),
    })
}

fn script_properties(body: &[u8]) -> Option<Vec<(String, amf::Value)>> {
    let mut cur = Cursor::new(body);
    let name = amf::read_value(&mut cur).ok()?;
    if name.as_str() != Some("onMetaData") {
        return None;
    }
    match amf::read_value(&mut cur).ok()? {
        amf::Value::Properties(props) => Some(props),
        _ => None,
    }
}

fn read_flv_tags(data: &[u8], password: Option<&str>) -> EngineResult<TagSet> {
    for tag in flv_tags(data)? {
        if tag.tag_type != 18 {
            continue;
        }
        let Some(props) = script_properties(&data[tag.data_start..tag.data_end]) else {
            continue;
        };
        for (name, value) in props {
            if name == "mtag" {
                if let Some(hex) = value.as_str() {
                    let envelope = hex_decode(hex)?;
                    return tags::decode(&envelope, password);
                }
            }
        }
    }
    Ok(TagSet::new())
}

fn hex_decode(hex: &str) -> EngineResult<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(EngineError::format("odd-length hex tag payload"));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| EngineError::format("invalid hex tag payload"))
        })
        .collect()
}
