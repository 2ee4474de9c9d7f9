//! EBML (Extensible Binary Meta Language) primitives.
//!
//! Read and write support for the variable-size integers and typed element
//! values underlying Matroska/WebM. All integers are big-endian.
//!
//! EBML uses a leading-1 encoding for variable-size integers:
//! - 1 byte:  `1xxx xxxx`                (7 data bits)
//! - 2 bytes: `01xx xxxx xxxx xxxx`      (14 data bits)
//! - 3 bytes: `001x xxxx ...`            (21 data bits)
//! - up to 8 bytes for data sizes
//!
//! The repair engine reads streamed files whose Segment and Cluster sizes
//! use the all-ones "unknown size" sentinel; [`read_vint_size`] surfaces
//! that as `u64::MAX` and the writer only ever emits known sizes.

pub mod elements;

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{EngineError, EngineResult};

/// An EBML element header: ID, data size, and position info.
#[derive(Clone, Debug)]
pub struct EbmlElement {
    /// The element ID (1-4 bytes, encoded as u32 with marker bits kept).
    pub id: u32,
    /// The data size in bytes (`u64::MAX` when unknown).
    pub size: u64,
    /// How many bytes the header (ID + size) consumed.
    pub header_size: u64,
    /// Byte position in the stream where this element header starts.
    pub position: u64,
}

impl EbmlElement {
    /// Byte offset where the element's payload begins.
    pub fn data_offset(&self) -> u64 {
        self.position + self.header_size
    }

    /// Byte offset just past the end of this element, or `None` for
    /// unknown-size elements.
    pub fn end_offset(&self) -> Option<u64> {
        if self.size == u64::MAX {
            None
        } else {
            Some(self.position + self.header_size + self.size)
        }
    }

    pub fn has_unknown_size(&self) -> bool {
        self.size == u64::MAX
    }
}

fn read_one_byte<R: Read>(reader: &mut R) -> EngineResult<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

/// Determines the width in bytes of a VINT from its first byte.
/// IDs are limited to 4 bytes; data sizes may use up to 8.
fn vint_width(first: u8, max: u8) -> EngineResult<u8> {
    for width in 1..=max {
        if first & (0x80 >> (width - 1)) != 0 {
            return Ok(width);
        }
    }
    Err(EngineError::format(format!(
        "invalid VINT leading byte 0x{first:02X}"
    )))
}

/// Reads a variable-size element ID.
///
/// Unlike data sizes, the ID keeps the leading-1 marker bit, so the raw
/// bytes form the ID directly.
pub fn read_vint_id<R: Read>(reader: &mut R) -> EngineResult<u32> {
    let first = read_one_byte(reader)?;
    let width = vint_width(first, 4)?;

    let mut id = first as u32;
    for _ in 1..width {
        id = (id << 8) | read_one_byte(reader)? as u32;
    }
    Ok(id)
}

/// Reads a variable-size data size, stripping the marker bit.
/// Returns `u64::MAX` for the all-ones "unknown size" sentinel.
pub fn read_vint_size<R: Read>(reader: &mut R) -> EngineResult<u64> {
    let first = read_one_byte(reader)?;
    let width = vint_width(first, 8)?;

    let mask = if width == 8 { 0 } else { 0xFF >> width };
    let mut value = (first & mask) as u64;
    for _ in 1..width {
        value = (value << 8) | read_one_byte(reader)? as u64;
    }

    // All data bits set means "size unknown".
    let max_for_width = if width == 8 {
        u64::MAX >> 8
    } else {
        (1u64 << (7 * width)) - 1
    };
    if value == max_for_width {
        return Ok(u64::MAX);
    }
    Ok(value)
}

/// Reads a complete element header (ID + data size) at the current
/// stream position.
pub fn read_element<R: Read + Seek>(reader: &mut R) -> EngineResult<EbmlElement> {
    let position = reader.stream_position()?;
    let id = read_vint_id(reader)?;
    let size = read_vint_size(reader)?;
    let header_size = reader.stream_position()? - position;
    Ok(EbmlElement {
        id,
        size,
        header_size,
        position,
    })
}

/// Reads an unsigned integer element value (1-8 bytes).
pub fn read_uint<R: Read>(reader: &mut R, size: u64) -> EngineResult<u64> {
    if size == 0 || size > 8 {
        return Err(EngineError::format(format!("invalid uint size {size}")));
    }
    let mut val: u64 = 0;
    for _ in 0..size {
        val = (val << 8) | read_one_byte(reader)? as u64;
    }
    Ok(val)
}

/// Reads a signed integer element value (1-8 bytes, two's complement).
pub fn read_sint<R: Read>(reader: &mut R, size: u64) -> EngineResult<i64> {
    if size == 0 || size > 8 {
        return Err(EngineError::format(format!("invalid sint size {size}")));
    }
    let first = read_one_byte(reader)?;
    let mut val: i64 = first as i8 as i64;
    for _ in 1..size {
        val = (val << 8) | read_one_byte(reader)? as i64;
    }
    Ok(val)
}

/// Reads a float element value (0, 4, or 8 bytes).
pub fn read_float<R: Read>(reader: &mut R, size: u64) -> EngineResult<f64> {
    match size {
        0 => Ok(0.0),
        4 => {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            Ok(f32::from_be_bytes(buf) as f64)
        }
        8 => {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            Ok(f64::from_be_bytes(buf))
        }
        _ => Err(EngineError::format(format!("invalid float size {size}"))),
    }
}

/// Reads a UTF-8 string element value, stripping trailing nulls.
pub fn read_string<R: Read>(reader: &mut R, size: u64) -> EngineResult<String> {
    if size == 0 {
        return Ok(String::new());
    }
    let data = read_binary(reader, size)?;
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8(data[..end].to_vec())
        .map_err(|e| EngineError::format(format!("invalid UTF-8 string: {e}")))
}

/// Reads raw binary data of the given size.
pub fn read_binary<R: Read>(reader: &mut R, size: u64) -> EngineResult<Vec<u8>> {
    if size > u32::MAX as u64 {
        return Err(EngineError::format(format!(
            "implausible element size {size}"
        )));
    }
    let mut buf = vec![0u8; size as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Skips past `size` payload bytes.
pub fn skip_element<R: Read + Seek>(reader: &mut R, size: u64) -> EngineResult<()> {
    if size == u64::MAX {
        return Err(EngineError::format("cannot skip element with unknown size"));
    }
    reader.seek(SeekFrom::Current(size as i64))?;
    Ok(())
}

// ─── Write side ──────────────────────────────────────────────────────

/// Byte width of an element ID (the marker bit position encodes it).
fn id_width(id: u32) -> usize {
    if id > 0xFF_FFFF {
        4
    } else if id > 0xFFFF {
        3
    } else if id > 0xFF {
        2
    } else {
        1
    }
}

/// Writes an element ID verbatim (marker bits are part of the value).
pub fn write_id<W: Write>(out: &mut W, id: u32) -> EngineResult<()> {
    let width = id_width(id);
    out.write_all(&id.to_be_bytes()[4 - width..])?;
    Ok(())
}

/// Minimal VINT width able to carry `size` without hitting the all-ones
/// sentinel for that width.
pub fn size_width(size: u64) -> usize {
    for width in 1..8usize {
        if size < (1u64 << (7 * width)) - 1 {
            return width;
        }
    }
    8
}

/// Writes a data size as a minimal-width VINT.
pub fn write_size<W: Write>(out: &mut W, size: u64) -> EngineResult<()> {
    let width = size_width(size);
    let marker = 1u64 << (7 * width);
    let encoded = marker | size;
    out.write_all(&encoded.to_be_bytes()[8 - width..])?;
    Ok(())
}

/// Total encoded length of an element: ID + size VINT + payload.
pub fn element_len(id: u32, payload_len: u64) -> u64 {
    id_width(id) as u64 + size_width(payload_len) as u64 + payload_len
}

/// Writes a complete element header.
pub fn write_header<W: Write>(out: &mut W, id: u32, payload_len: u64) -> EngineResult<()> {
    write_id(out, id)?;
    write_size(out, payload_len)
}

/// Builds `id` + size + payload as a byte vector. Master elements are
/// assembled bottom-up from their children's bytes.
pub fn element(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    // Writing to a Vec cannot fail.
    write_header(&mut out, id, payload.len() as u64).expect("vec write");
    out.extend_from_slice(payload);
    out
}

/// Minimal big-endian encoding of an unsigned value (at least one byte).
fn uint_bytes(value: u64) -> Vec<u8> {
    let width = (8 - value.leading_zeros() as usize / 8).max(1);
    value.to_be_bytes()[8 - width..].to_vec()
}

pub fn uint_element(id: u32, value: u64) -> Vec<u8> {
    element(id, &uint_bytes(value))
}

/// Floats are always written as 8-byte doubles.
pub fn float_element(id: u32, value: f64) -> Vec<u8> {
    element(id, &value.to_be_bytes())
}

pub fn string_element(id: u32, value: &str) -> Vec<u8> {
    element(id, value.as_bytes())
}

pub fn binary_element(id: u32, value: &[u8]) -> Vec<u8> {
    element(id, value)
}
