//! FLV writer (enhanced-FLV video packets).
//!
//! Classic FLV only reserves codec ids for the legacy codecs, so AV1 and
//! VP9 ride in enhanced-FLV video tags: the high bit of the first video
//! data byte marks an extended header, followed by a packet type nibble
//! and a fourcc. A `SequenceStart` packet carries the codec configuration
//! record, every frame after it is `CodedFrames`.
//!
//! The `onMetaData` script tag is written up front with a duration
//! placeholder that is patched during `finish`; tag metadata goes into a
//! trailing script tag (last-wins merge, the convention metadata
//! injectors follow).

use byteorder::{BigEndian, WriteBytesExt};
use std::io::{Seek, SeekFrom, Write};

use crate::error::{EngineError, EngineResult};
use crate::mux::{ContainerSink, MuxTags, VideoCodec, VideoSample, VideoTrackSpec};
use crate::tags;

const TAG_TYPE_VIDEO: u8 = 9;
const TAG_TYPE_SCRIPT: u8 = 18;
const TAG_HEADER_LEN: u32 = 11;

const FRAME_KEY: u8 = 1;
const FRAME_INTER: u8 = 2;
const PACKET_SEQUENCE_START: u8 = 0;
const PACKET_CODED_FRAMES: u8 = 1;
const EX_HEADER: u8 = 0x80;

/// AMF0 value encoding and decoding, the subset script tags use.
pub mod amf {
    use super::*;
    use byteorder::ReadBytesExt;
    use std::io::Read;

    const MARKER_NUMBER: u8 = 0x00;
    const MARKER_BOOLEAN: u8 = 0x01;
    const MARKER_STRING: u8 = 0x02;
    const MARKER_OBJECT: u8 = 0x03;
    const MARKER_NULL: u8 = 0x05;
    const MARKER_ECMA_ARRAY: u8 = 0x08;
    const MARKER_OBJECT_END: u8 = 0x09;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Value {
        Number(f64),
        Boolean(bool),
        String(String),
        /// Both objects and ECMA arrays decode to a property list.
        Properties(Vec<(String, Value)>),
        Null,
    }

    impl Value {
        pub fn as_f64(&self) -> Option<f64> {
            match self {
                Value::Number(n) => Some(*n),
                _ => None,
            }
        }

        pub fn as_str(&self) -> Option<&str> {
            match self {
                Value::String(s) => Some(s),
                _ => None,
            }
        }
    }

    pub fn write_name<W: Write>(out: &mut W, name: &str) -> EngineResult<()> {
        if name.len() > u16::MAX as usize {
            return Err(EngineError::format("amf property name too long"));
        }
        out.write_u16::<BigEndian>(name.len() as u16)?;
        out.write_all(name.as_bytes())?;
        Ok(())
    }

    pub fn write_string<W: Write>(out: &mut W, value: &str) -> EngineResult<()> {
        if value.len() > u16::MAX as usize {
            return Err(EngineError::format("amf string too long"));
        }
        out.write_u8(MARKER_STRING)?;
        write_name(out, value)
    }

    pub fn write_number<W: Write>(out: &mut W, value: f64) -> EngineResult<()> {
        out.write_u8(MARKER_NUMBER)?;
        out.write_f64::<BigEndian>(value)?;
        Ok(())
    }

    pub fn write_ecma_array_header<W: Write>(out: &mut W, count: u32) -> EngineResult<()> {
        out.write_u8(MARKER_ECMA_ARRAY)?;
        out.write_u32::<BigEndian>(count)?;
        Ok(())
    }

    pub fn write_object_end<W: Write>(out: &mut W) -> EngineResult<()> {
        out.write_u16::<BigEndian>(0)?;
        out.write_u8(MARKER_OBJECT_END)?;
        Ok(())
    }

    fn read_name<R: Read>(input: &mut R) -> EngineResult<String> {
        let len = input.read_u16::<BigEndian>()? as usize;
        let mut buf = vec![0u8; len];
        input.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|_| EngineError::format("amf string is not utf-8"))
    }

    fn read_properties<R: Read>(input: &mut R) -> EngineResult<Vec<(String, Value)>> {
        let mut props = Vec::new();
        loop {
            let name = read_name(input)?;
            let marker = {
                let mut b = [0u8; 1];
                input.read_exact(&mut b)?;
                b[0]
            };
            if name.is_empty() && marker == MARKER_OBJECT_END {
                return Ok(props);
            }
            props.push((name, read_value_after_marker(input, marker)?));
        }
    }

    fn read_value_after_marker<R: Read>(input: &mut R, marker: u8) -> EngineResult<Value> {
        match marker {
            MARKER_NUMBER => Ok(Value::Number(input.read_f64::<BigEndian>()?)),
            MARKER_BOOLEAN => Ok(Value::Boolean(input.read_u8()? != 0)),
            MARKER_STRING => Ok(Value::String(read_name(input)?)),
            MARKER_OBJECT => Ok(Value::Properties(read_properties(input)?)),
            MARKER_NULL => Ok(Value::Null),
            MARKER_ECMA_ARRAY => {
                // The count is advisory; the end marker is authoritative.
                input.read_u32::<BigEndian>()?;
                Ok(Value::Properties(read_properties(input)?))
            }
            other => Err(EngineError::format(format!(
                "unsupported amf marker 0x{other:02X}"
            ))),
        }
    }

    pub fn read_value<R: Read>(input: &mut R) -> EngineResult<Value> {
        let mut b = [0u8; 1];
        input.read_exact(&mut b)?;
        read_value_after_marker(input, b[0])
    }
}

fn fourcc_number(codec: VideoCodec) -> f64 {
    u32::from_be_bytes(*codec.fourcc()) as f64
}

/// VP codec configuration record for the sequence-start packet. MP4
/// carries the same fields inside a vpcC box.
fn vp9_config_record() -> Vec<u8> {
    vec![
        0,                 // profile
        10,                // level 1.0
        (8 << 4) | (1 << 1), // bit depth 8, chroma 4:2:0 colocated
        1,                 // primaries BT.709
        1,                 // transfer
        1,                 // matrix
        0,
        0, // no init data
    ]
}

fn hex_encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

pub struct FlvWriter<W: Write + Seek + Send> {
    out: W,
    spec: Option<VideoTrackSpec>,
    duration_pos: u64,
    last_ts_ms: i64,
    finished: bool,
}

impl<W: Write + Seek + Send> FlvWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            spec: None,
            duration_pos: 0,
            last_ts_ms: 0,
            finished: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// FLV tag: type, 24-bit size, split 24+8 bit timestamp, stream id 0,
    /// payload, then the back-pointer prev-tag-size.
    fn write_tag(&mut self, tag_type: u8, timestamp_ms: i64, data: &[u8]) -> EngineResult<()> {
        if data.len() > 0x00FF_FFFF {
            return Err(EngineError::format("flv tag payload exceeds 24-bit size"));
        }
        let ts = timestamp_ms.clamp(0, u32::MAX as i64) as u32;
        self.out.write_u8(tag_type)?;
        self.out.write_u24::<BigEndian>(data.len() as u32)?;
        self.out.write_u24::<BigEndian>(ts & 0x00FF_FFFF)?;
        self.out.write_u8((ts >> 24) as u8)?;
        self.out.write_u24::<BigEndian>(0)?; // stream id
        self.out.write_all(data)?;
        self.out
            .write_u32::<BigEndian>(TAG_HEADER_LEN + data.len() as u32)?;
        Ok(())
    }

    fn write_video_tag(
        &mut self,
        timestamp_ms: i64,
        keyframe: bool,
        packet_type: u8,
        codec: VideoCodec,
        payload: &[u8],
    ) -> EngineResult<()> {
        let frame_type = if keyframe { FRAME_KEY } else { FRAME_INTER };
        let mut data = Vec::with_capacity(payload.len() + 5);
        data.push(EX_HEADER | (frame_type << 4) | packet_type);
        data.extend_from_slice(codec.fourcc());
        data.extend_from_slice(payload);
        self.write_tag(TAG_TYPE_VIDEO, timestamp_ms, &data)
    }

    /// Initial onMetaData: geometry, frame rate, codec, and a duration
    /// placeholder whose file offset is kept for patching.
    fn write_metadata_tag(&mut self, spec: &VideoTrackSpec) -> EngineResult<()> {
        let mut payload = Vec::new();
        amf::write_string(&mut payload, "onMetaData")?;
        amf::write_ecma_array_header(&mut payload, 5)?;

        amf::write_name(&mut payload, "duration")?;
        // Offset of the 8-byte double, one past the number marker.
        let duration_offset = payload.len() as u64 + 1;
        amf::write_number(&mut payload, 0.0)?;

        amf::write_name(&mut payload, "width")?;
        amf::write_number(&mut payload, spec.width as f64)?;
        amf::write_name(&mut payload, "height")?;
        amf::write_number(&mut payload, spec.height as f64)?;
        amf::write_name(&mut payload, "framerate")?;
        amf::write_number(&mut payload, spec.fps as f64)?;
        amf::write_name(&mut payload, "videocodecid")?;
        amf::write_number(&mut payload, fourcc_number(spec.codec))?;
        amf::write_object_end(&mut payload)?;

        let data_start = self.out.stream_position()? + TAG_HEADER_LEN as u64;
        self.duration_pos = data_start + duration_offset;
        self.write_tag(TAG_TYPE_SCRIPT, 0, &payload)
    }

    /// Trailing metadata with the tag block. Entries go out as strings,
    /// the envelope hex-encoded under "mtag".
    fn write_tags_tag(&mut self, tags: &MuxTags) -> EngineResult<()> {
        if tags.plain.is_empty() && tags.envelope.is_none() {
            return Ok(());
        }
        let envelope = match &tags.envelope {
            Some(env) => env.clone(),
            None => tags::encode(&tags.plain, None)?,
        };
        let mut payload = Vec::new();
        amf::write_string(&mut payload, "onMetaData")?;
        amf::write_ecma_array_header(&mut payload, 1)?;
        amf::write_name(&mut payload, "mtag")?;
        amf::write_string(&mut payload, &hex_encode(&envelope))?;
        amf::write_object_end(&mut payload)?;
        self.write_tag(TAG_TYPE_SCRIPT, self.last_ts_ms, &payload)
    }
}

impl<W: Write + Seek + Send> ContainerSink for FlvWriter<W> {
    fn start(&mut self, spec: &VideoTrackSpec) -> EngineResult<()> {
        if self.spec.is_some() {
            return Err(EngineError::state("flv writer already started"));
        }
        // Signature, version 1, video-only flags, 9-byte header, then the
        // zero back-pointer before the first tag.
        self.out.write_all(b"FLV")?;
        self.out.write_u8(1)?;
        self.out.write_u8(0x01)?;
        self.out.write_u32::<BigEndian>(9)?;
        self.out.write_u32::<BigEndian>(0)?;

        self.write_metadata_tag(spec)?;
        let config = match spec.codec {
            VideoCodec::Av1 => spec.codec_config.clone(),
            VideoCodec::Vp9 => vp9_config_record(),
        };
        self.write_video_tag(0, true, PACKET_SEQUENCE_START, spec.codec, &config)?;
        self.spec = Some(spec.clone());
        Ok(())
    }

    fn write_sample(&mut self, sample: &VideoSample<'_>) -> EngineResult<()> {
        let codec = self
            .spec
            .as_ref()
            .ok_or_else(|| EngineError::state("flv writer not started"))?
            .codec;
        self.write_video_tag(
            sample.pts_ms,
            sample.keyframe,
            PACKET_CODED_FRAMES,
            codec,
            sample.data,
        )?;
        self.last_ts_ms = sample.pts_ms + sample.duration_ms as i64;
        Ok(())
    }

    fn finish(&mut self, tags: &MuxTags) -> EngineResult<()> {
        if self.finished {
            return Err(EngineError::state("flv writer already finished"));
        }
        if self.spec.is_none() {
            return Err(EngineError::state("flv writer not started"));
        }
        self.write_tags_tag(tags)?;

        let end = self.out.stream_position()?;
        self.out.seek(SeekFrom::Start(self.duration_pos))?;
        self.out
            .write_f64::<BigEndian>(self.last_ts_ms as f64 / 1000.0)?;
        self.out.seek(SeekFrom::Start(end))?;
        self.out.flush()?;
        self.finished = true;
        Ok(())
    }
}
