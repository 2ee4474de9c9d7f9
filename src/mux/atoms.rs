//! Low-level MP4 atom/box writing primitives.
//!
//! MP4 files are nested boxes: a 4-byte big-endian size (including the
//! header) followed by a 4-byte ASCII type. "Full boxes" add a 1-byte
//! version and 3-byte flags. Builders here write into any `Write + Seek`
//! sink; in-memory assembly uses a `Cursor<Vec<u8>>`.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::{Seek, SeekFrom, Write};

use crate::error::{EngineError, EngineResult};

/// Movie-level and media timescale (millisecond precision).
pub const MOVIE_TIMESCALE: u32 = 1000;

/// Seconds between the MP4 epoch (1904-01-01) and the Unix epoch.
pub const MP4_EPOCH_OFFSET: u64 = 2_082_844_800;

/// Writes a standard box header: 4-byte size + 4-byte type.
pub fn write_box_header<W: Write>(out: &mut W, box_type: &[u8; 4], size: u32) -> EngineResult<()> {
    out.write_u32::<BigEndian>(size)?;
    out.write_all(box_type)?;
    Ok(())
}

/// Writes a "full box" header: size + type + version + 24-bit flags.
pub fn write_full_box_header<W: Write>(
    out: &mut W,
    box_type: &[u8; 4],
    size: u32,
    version: u8,
    flags: u32,
) -> EngineResult<()> {
    out.write_u32::<BigEndian>(size)?;
    out.write_all(box_type)?;
    out.write_u32::<BigEndian>(((version as u32) << 24) | (flags & 0x00FF_FFFF))?;
    Ok(())
}

/// Writes a zero size placeholder + type, returning the position of the
/// size field for [`fill_box_size`].
pub fn begin_box<W: Write + Seek>(out: &mut W, box_type: &[u8; 4]) -> EngineResult<u64> {
    let pos = out.stream_position()?;
    out.write_u32::<BigEndian>(0)?;
    out.write_all(box_type)?;
    Ok(pos)
}

/// Like [`begin_box`] for full boxes.
pub fn begin_full_box<W: Write + Seek>(
    out: &mut W,
    box_type: &[u8; 4],
    version: u8,
    flags: u32,
) -> EngineResult<u64> {
    let pos = begin_box(out, box_type)?;
    out.write_u32::<BigEndian>(((version as u32) << 24) | (flags & 0x00FF_FFFF))?;
    Ok(pos)
}

/// Patches the size at `size_pos` to span up to the current position.
pub fn fill_box_size<W: Write + Seek>(out: &mut W, size_pos: u64) -> EngineResult<()> {
    let current = out.stream_position()?;
    let size = current - size_pos;
    if size > u32::MAX as u64 {
        return Err(EngineError::format(format!(
            "box size {size} exceeds 32-bit limit"
        )));
    }
    out.seek(SeekFrom::Start(size_pos))?;
    out.write_u32::<BigEndian>(size as u32)?;
    out.seek(SeekFrom::Start(current))?;
    Ok(())
}

/// Writes a 64-bit "largesize" box header placeholder (size field set to
/// 1, extended size zeroed). Returns the position of the 8-byte extended
/// size for [`fill_large_box_size`].
pub fn begin_large_box<W: Write + Seek>(out: &mut W, box_type: &[u8; 4]) -> EngineResult<u64> {
    out.write_u32::<BigEndian>(1)?;
    out.write_all(box_type)?;
    let size_pos = out.stream_position()?;
    out.write_u64::<BigEndian>(0)?;
    Ok(size_pos)
}

/// Patches a largesize field. `size_pos` points at the extended size,
/// 8 bytes into the box.
pub fn fill_large_box_size<W: Write + Seek>(out: &mut W, size_pos: u64) -> EngineResult<()> {
    let current = out.stream_position()?;
    let total = current - (size_pos - 8);
    out.seek(SeekFrom::Start(size_pos))?;
    out.write_u64::<BigEndian>(total)?;
    out.seek(SeekFrom::Start(current))?;
    Ok(())
}

/// Writes a fixed-point 16.16 number.
pub fn write_fixed_16_16<W: Write>(out: &mut W, value: f64) -> EngineResult<()> {
    out.write_i32::<BigEndian>((value * 65536.0).round() as i32)?;
    Ok(())
}

/// Writes the identity transformation matrix used by tkhd/mvhd.
pub fn write_unity_matrix<W: Write>(out: &mut W) -> EngineResult<()> {
    for value in [
        0x0001_0000u32,
        0,
        0,
        0,
        0x0001_0000,
        0,
        0,
        0,
        0x4000_0000,
    ] {
        out.write_u32::<BigEndian>(value)?;
    }
    Ok(())
}

pub fn write_zeros<W: Write>(out: &mut W, count: usize) -> EngineResult<()> {
    out.write_all(&vec![0u8; count])?;
    Ok(())
}

/// ISO 639-2/T language packed into 3x5 bits ("und" = undetermined).
pub fn encode_language(lang: &str) -> u16 {
    let bytes = lang.as_bytes();
    if bytes.len() < 3 {
        return encode_language("und");
    }
    let a = (bytes[0] - 0x60) as u16;
    let b = (bytes[1] - 0x60) as u16;
    let c = (bytes[2] - 0x60) as u16;
    (a << 10) | (b << 5) | c
}

/// Current time as MP4 creation time (seconds since 1904).
pub fn mp4_creation_time() -> u64 {
    MP4_EPOCH_OFFSET + chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn box_header_layout() {
        let mut buf = Vec::new();
        write_box_header(&mut buf, b"ftyp", 20).unwrap();
        assert_eq!(&buf[0..4], &[0x00, 0x00, 0x00, 0x14]);
        assert_eq!(&buf[4..8], b"ftyp");
    }

    #[test]
    fn full_box_header_layout() {
        let mut buf = Vec::new();
        write_full_box_header(&mut buf, b"mvhd", 120, 1, 0).unwrap();
        assert_eq!(buf.len(), 12);
        assert_eq!(&buf[8..12], &[0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn begin_and_fill_box() {
        let mut cursor = Cursor::new(Vec::new());
        let pos = begin_box(&mut cursor, b"moov").unwrap();
        cursor.write_all(&[0xAA; 20]).unwrap();
        fill_box_size(&mut cursor, pos).unwrap();
        let buf = cursor.into_inner();
        assert_eq!(buf.len(), 28);
        assert_eq!(&buf[0..4], &[0x00, 0x00, 0x00, 28]);
    }

    #[test]
    fn large_box_size() {
        let mut cursor = Cursor::new(Vec::new());
        let size_pos = begin_large_box(&mut cursor, b"mdat").unwrap();
        cursor.write_all(&[0xBB; 32]).unwrap();
        fill_large_box_size(&mut cursor, size_pos).unwrap();
        let buf = cursor.into_inner();
        // 4 (size=1) + 4 (type) + 8 (largesize) + 32
        assert_eq!(buf.len(), 48);
        let extended = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        assert_eq!(extended, 48);
    }

    #[test]
    fn language_und() {
        assert_eq!(encode_language("und"), 0x55C4);
        assert_eq!(encode_language(""), 0x55C4);
    }

    #[test]
    fn fixed_point() {
        let mut buf = Vec::new();
        write_fixed_16_16(&mut buf, 1.0).unwrap();
        assert_eq!(&buf, &[0x00, 0x01, 0x00, 0x00]);
    }
}
