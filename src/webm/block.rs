//! SimpleBlock/Block header handling.
//!
//! Block body layout:
//!
//! ```text
//! [track_number: vint] [timecode: i16, relative to cluster] [flags: u8] [payload...]
//! ```
//!
//! Flag bits: 0x80 keyframe (SimpleBlock only), 0x08 invisible, bits 1-2
//! lacing (00 none, 01 Xiph, 11 EBML, 10 fixed-size).
//!
//! Repair and combine copy block payloads verbatim; only the header is
//! interpreted (and, for combine, the relative timecode patched). The
//! track-number VINT strips its leading-1 marker like a size VINT.

use crate::error::{EngineError, EngineResult};

/// Lacing mode carried in the flags byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Lacing {
    None,
    Xiph,
    Ebml,
    FixedSize,
}

/// Parsed block header. `payload_offset` points at the first byte after
/// the flags byte (for laced blocks that is the lacing header, which is
/// carried along with the frame bytes verbatim).
#[derive(Clone, Debug)]
pub struct BlockHeader {
    pub track_number: u64,
    pub timecode_offset: i16,
    pub keyframe: bool,
    pub invisible: bool,
    pub lacing: Lacing,
    pub payload_offset: usize,
    /// Offset of the 2-byte relative timecode within the block body.
    timecode_pos: usize,
}

/// Reads a block-header VINT (marker bit stripped). Returns value and
/// consumed length.
pub fn read_block_vint(data: &[u8]) -> EngineResult<(u64, usize)> {
    let first = *data
        .first()
        .ok_or_else(|| EngineError::format("empty block body"))?;

    let width = (1..=4usize)
        .find(|w| first & (0x80 >> (w - 1)) != 0)
        .ok_or_else(|| {
            EngineError::format(format!("invalid block VINT leading byte 0x{first:02X}"))
        })?;
    if data.len() < width {
        return Err(EngineError::format("truncated block VINT"));
    }

    let mask = 0xFF >> width;
    let mut value = (first & mask) as u64;
    for &byte in data.iter().take(width).skip(1) {
        value = (value << 8) | byte as u64;
    }
    Ok((value, width))
}

/// Encodes a track number as a block-header VINT (1 or 2 bytes; track
/// numbers above 14 bits are outside anything this engine produces).
pub fn write_block_vint(value: u64) -> EngineResult<Vec<u8>> {
    if value < 0x7F {
        Ok(vec![0x80 | value as u8])
    } else if value < 0x3FFF {
        Ok(vec![0x40 | (value >> 8) as u8, value as u8])
    } else {
        Err(EngineError::format(format!(
            "track number {value} too large for block VINT"
        )))
    }
}

/// Parses the header of a SimpleBlock (or Block) body.
pub fn parse_block_header(data: &[u8]) -> EngineResult<BlockHeader> {
    let (track_number, vint_len) = read_block_vint(data)?;

    if data.len() < vint_len + 3 {
        return Err(EngineError::format(format!(
            "block body truncated at {} bytes",
            data.len()
        )));
    }
    let timecode_offset = i16::from_be_bytes([data[vint_len], data[vint_len + 1]]);
    let flags = data[vint_len + 2];

    let lacing = match (flags >> 1) & 0x03 {
        0b00 => Lacing::None,
        0b01 => Lacing::Xiph,
        0b11 => Lacing::Ebml,
        _ => Lacing::FixedSize,
    };

    Ok(BlockHeader {
        track_number,
        timecode_offset,
        keyframe: flags & 0x80 != 0,
        invisible: flags & 0x08 != 0,
        lacing,
        payload_offset: vint_len + 3,
        timecode_pos: vint_len,
    })
}

impl BlockHeader {
    /// Returns a copy of `body` with the relative timecode replaced and
    /// the keyframe bit set from `keyframe`, leaving track, lacing, and
    /// payload untouched. Bodies lifted out of BlockGroups carry no
    /// keyframe bit in their flags, so the caller supplies it.
    pub fn with_timecode(&self, body: &[u8], new_offset: i16, keyframe: bool) -> Vec<u8> {
        let mut out = body.to_vec();
        out[self.timecode_pos..self.timecode_pos + 2]
            .copy_from_slice(&new_offset.to_be_bytes());
        let flags_pos = self.timecode_pos + 2;
        if keyframe {
            out[flags_pos] |= 0x80;
        } else {
            out[flags_pos] &= !0x80;
        }
        out
    }
}

/// Builds a non-laced SimpleBlock body.
pub fn build_simple_block(
    track_number: u64,
    timecode_offset: i16,
    keyframe: bool,
    frame: &[u8],
) -> EngineResult<Vec<u8>> {
    let mut body = write_block_vint(track_number)?;
    body.extend_from_slice(&timecode_offset.to_be_bytes());
    body.push(if keyframe { 0x80 } else { 0x00 });
    body.extend_from_slice(frame);
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_body(flags: u8, frame: &[u8]) -> Vec<u8> {
        let mut data = vec![0x81, 0x00, 0x00, flags];
        data.extend_from_slice(frame);
        data
    }

    #[test]
    fn parses_keyframe_block() {
        let body = block_body(0x80, &[0xDE, 0xAD, 0xBE, 0xEF]);
        let header = parse_block_header(&body).unwrap();
        assert_eq!(header.track_number, 1);
        assert_eq!(header.timecode_offset, 0);
        assert!(header.keyframe);
        assert!(!header.invisible);
        assert_eq!(header.lacing, Lacing::None);
        assert_eq!(&body[header.payload_offset..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn parses_interframe_with_offset() {
        let mut body = vec![0x82];
        body.extend_from_slice(&(-5i16).to_be_bytes());
        body.push(0x00);
        body.push(0xAA);
        let header = parse_block_header(&body).unwrap();
        assert_eq!(header.track_number, 2);
        assert_eq!(header.timecode_offset, -5);
        assert!(!header.keyframe);
    }

    #[test]
    fn detects_lacing_modes() {
        for (bits, lacing) in [
            (0b00u8, Lacing::None),
            (0b01, Lacing::Xiph),
            (0b11, Lacing::Ebml),
            (0b10, Lacing::FixedSize),
        ] {
            let body = block_body(bits << 1, &[0x00]);
            assert_eq!(parse_block_header(&body).unwrap().lacing, lacing);
        }
    }

    #[test]
    fn rejects_truncated_bodies() {
        assert!(parse_block_header(&[]).is_err());
        assert!(parse_block_header(&[0x81, 0x00]).is_err());
    }

    #[test]
    fn block_vint_round_trip() {
        for track in [1u64, 2, 100, 126, 127, 128, 5000] {
            let encoded = write_block_vint(track).unwrap();
            let (decoded, len) = read_block_vint(&encoded).unwrap();
            assert_eq!(decoded, track);
            assert_eq!(len, encoded.len());
        }
    }

    #[test]
    fn build_then_parse() {
        let body = build_simple_block(1, 40, true, &[0x01, 0x02, 0x03]).unwrap();
        let header = parse_block_header(&body).unwrap();
        assert_eq!(header.track_number, 1);
        assert_eq!(header.timecode_offset, 40);
        assert!(header.keyframe);
        assert_eq!(&body[header.payload_offset..], &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn timecode_patch_preserves_payload() {
        let body = build_simple_block(1, 40, true, &[0x01, 0x02]).unwrap();
        let header = parse_block_header(&body).unwrap();
        let patched = header.with_timecode(&body, -7, true);
        let reparsed = parse_block_header(&patched).unwrap();
        assert_eq!(reparsed.timecode_offset, -7);
        assert_eq!(&patched[reparsed.payload_offset..], &[0x01, 0x02]);
        assert!(reparsed.keyframe);
    }

    #[test]
    fn keyframe_bit_follows_the_caller() {
        // A BlockGroup body: keyframe known from context, flags byte clear.
        let body = block_body(0x00, &[0x10]);
        let header = parse_block_header(&body).unwrap();
        let promoted = header.with_timecode(&body, 0, true);
        assert!(parse_block_header(&promoted).unwrap().keyframe);
        let demoted = header.with_timecode(&promoted, 0, false);
        assert!(!parse_block_header(&demoted).unwrap().keyframe);
    }
}
