//! MP4 (ISO BMFF) writer.
//!
//! Two layouts, selected by movflags:
//!
//! - **Fragmented** (`frag_keyframe`/`empty_moov`, the session default):
//!   `ftyp` + `moov` (empty sample tables + `mvex`) up front, then a
//!   `moof`/`mdat` pair per fragment. Fragments are cut on keyframes and
//!   by `frag_duration`.
//! - **Faststart** (`+faststart`): samples spool to an anonymous temp
//!   file; `finish` writes `ftyp` + `moov` + `mdat` with the chunk offset
//!   precomputed, so the index precedes the payload without a rewrite
//!   pass over the output.
//!
//! The tag envelope rides in a top-level `free` box after the movie
//! metadata; players skip it, the tag reader finds it by magic.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::{Cursor, Seek, SeekFrom, Write};

use crate::error::{EngineError, EngineResult};
use crate::mux::atoms::{self, MOVIE_TIMESCALE};
use crate::mux::{ContainerSink, MuxTags, VideoCodec, VideoSample, VideoTrackSpec};
use crate::tags;

const TRACK_ID: u32 = 1;

/// Sync/non-sync sample flags for trun entries.
const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;

#[derive(Debug, Clone)]
pub struct Mp4Config {
    pub fragmented: bool,
    /// Fragment length bound in milliseconds (fragmented mode).
    pub frag_duration_ms: u64,
    pub creation_time: u64,
}

impl Default for Mp4Config {
    fn default() -> Self {
        Self {
            fragmented: true,
            frag_duration_ms: 1000,
            creation_time: atoms::mp4_creation_time(),
        }
    }
}

struct PendingSample {
    data: Vec<u8>,
    duration_ms: u32,
    keyframe: bool,
}

struct SampleInfo {
    size: u32,
    duration_ms: u32,
    keyframe: bool,
}

pub struct Mp4Writer<W: Write + Seek + Send> {
    out: W,
    config: Mp4Config,
    spec: Option<VideoTrackSpec>,
    // Fragmented state
    sequence: u32,
    fragment: Vec<PendingSample>,
    fragment_base_ms: i64,
    next_decode_ms: i64,
    // Faststart state
    spool: Option<std::fs::File>,
    samples: Vec<SampleInfo>,
    finished: bool,
}

impl<W: Write + Seek + Send> Mp4Writer<W> {
    pub fn new(out: W, config: Mp4Config) -> Self {
        Self {
            out,
            config,
            spec: None,
            sequence: 0,
            fragment: Vec::new(),
            fragment_base_ms: 0,
            next_decode_ms: 0,
            spool: None,
            samples: Vec::new(),
            finished: false,
        }
    }

    fn spec(&self) -> EngineResult<&VideoTrackSpec> {
        self.spec
            .as_ref()
            .ok_or_else(|| EngineError::state("mp4 writer not started"))
    }

    fn write_ftyp(&mut self) -> EngineResult<()> {
        let pos = atoms::begin_box(&mut self.out, b"ftyp")?;
        self.out.write_all(b"isom")?;
        self.out.write_u32::<BigEndian>(512)?;
        for brand in [b"isom", b"iso2", b"iso6", b"mp41"] {
            self.out.write_all(brand)?;
        }
        atoms::fill_box_size(&mut self.out, pos)
    }

    fn total_duration_ms(&self) -> u64 {
        self.samples
            .iter()
            .map(|s| s.duration_ms as u64)
            .sum::<u64>()
            .max(self.next_decode_ms.max(0) as u64)
    }

    // ── moov assembly ────────────────────────────────────────────────

    /// Builds the complete moov box in memory. `chunk_offset` is the file
    /// offset of the first sample byte (faststart) and is irrelevant for
    /// the fragmented empty-table moov.
    fn build_moov(&self, chunk_offset: u64) -> EngineResult<Vec<u8>> {
        let spec = self.spec()?;
        let duration = if self.config.fragmented {
            0
        } else {
            self.total_duration_ms()
        };
        let mut cur = Cursor::new(Vec::new());

        let moov = atoms::begin_box(&mut cur, b"moov")?;
        self.write_mvhd(&mut cur, duration)?;

        let trak = atoms::begin_box(&mut cur, b"trak")?;
        self.write_tkhd(&mut cur, spec, duration)?;

        let mdia = atoms::begin_box(&mut cur, b"mdia")?;
        self.write_mdhd(&mut cur, duration)?;
        self.write_hdlr(&mut cur)?;

        let minf = atoms::begin_box(&mut cur, b"minf")?;
        self.write_vmhd(&mut cur)?;
        self.write_dinf(&mut cur)?;
        self.write_stbl(&mut cur, spec, chunk_offset)?;
        atoms::fill_box_size(&mut cur, minf)?;

        atoms::fill_box_size(&mut cur, mdia)?;
        atoms::fill_box_size(&mut cur, trak)?;

        if self.config.fragmented {
            let mvex = atoms::begin_box(&mut cur, b"mvex")?;
            let trex = atoms::begin_full_box(&mut cur, b"trex", 0, 0)?;
            cur.write_u32::<BigEndian>(TRACK_ID)?;
            cur.write_u32::<BigEndian>(1)?; // default sample description
            cur.write_u32::<BigEndian>(0)?; // default duration
            cur.write_u32::<BigEndian>(0)?; // default size
            cur.write_u32::<BigEndian>(SAMPLE_FLAGS_NON_SYNC)?;
            atoms::fill_box_size(&mut cur, trex)?;
            atoms::fill_box_size(&mut cur, mvex)?;
        }

        atoms::fill_box_size(&mut cur, moov)?;
        Ok(cur.into_inner())
    }

    fn write_mvhd(&self, cur: &mut Cursor<Vec<u8>>, duration: u64) -> EngineResult<()> {
        let pos = atoms::begin_full_box(cur, b"mvhd", 0, 0)?;
        cur.write_u32::<BigEndian>(self.config.creation_time as u32)?;
        cur.write_u32::<BigEndian>(self.config.creation_time as u32)?;
        cur.write_u32::<BigEndian>(MOVIE_TIMESCALE)?;
        cur.write_u32::<BigEndian>(duration as u32)?;
        cur.write_u32::<BigEndian>(0x0001_0000)?; // rate 1.0
        cur.write_u16::<BigEndian>(0x0100)?; // volume 1.0
        atoms::write_zeros(cur, 10)?;
        atoms::write_unity_matrix(cur)?;
        atoms::write_zeros(cur, 24)?; // pre_defined
        cur.write_u32::<BigEndian>(TRACK_ID + 1)?; // next track id
        atoms::fill_box_size(cur, pos)
    }

    fn write_tkhd(
        &self,
        cur: &mut Cursor<Vec<u8>>,
        spec: &VideoTrackSpec,
        duration: u64,
    ) -> EngineResult<()> {
        // flags: track enabled + in movie
        let pos = atoms::begin_full_box(cur, b"tkhd", 0, 0x000003)?;
        cur.write_u32::<BigEndian>(self.config.creation_time as u32)?;
        cur.write_u32::<BigEndian>(self.config.creation_time as u32)?;
        cur.write_u32::<BigEndian>(TRACK_ID)?;
        cur.write_u32::<BigEndian>(0)?; // reserved
        cur.write_u32::<BigEndian>(duration as u32)?;
        atoms::write_zeros(cur, 8)?;
        cur.write_u16::<BigEndian>(0)?; // layer
        cur.write_u16::<BigEndian>(0)?; // alternate group
        cur.write_u16::<BigEndian>(0)?; // volume (video)
        cur.write_u16::<BigEndian>(0)?; // reserved
        atoms::write_unity_matrix(cur)?;
        atoms::write_fixed_16_16(cur, spec.width as f64)?;
        atoms::write_fixed_16_16(cur, spec.height as f64)?;
        atoms::fill_box_size(cur, pos)
    }

    fn write_mdhd(&self, cur: &mut Cursor<Vec<u8>>, duration: u64) -> EngineResult<()> {
        let pos = atoms::begin_full_box(cur, b"mdhd", 0, 0)?;
        cur.write_u32::<BigEndian>(self.config.creation_time as u32)?;
        cur.write_u32::<BigEndian>(self.config.creation_time as u32)?;
        cur.write_u32::<BigEndian>(MOVIE_TIMESCALE)?;
        cur.write_u32::<BigEndian>(duration as u32)?;
        cur.write_u16::<BigEndian>(atoms::encode_language("und"))?;
        cur.write_u16::<BigEndian>(0)?;
        atoms::fill_box_size(cur, pos)
    }

    fn write_hdlr(&self, cur: &mut Cursor<Vec<u8>>) -> EngineResult<()> {
        let pos = atoms::begin_full_box(cur, b"hdlr", 0, 0)?;
        cur.write_u32::<BigEndian>(0)?; // pre_defined
        cur.write_all(b"vide")?;
        atoms::write_zeros(cur, 12)?;
        cur.write_all(b"VideoHandler\0")?;
        atoms::fill_box_size(cur, pos)
    }

    fn write_vmhd(&self, cur: &mut Cursor<Vec<u8>>) -> EngineResult<()> {
        let pos = atoms::begin_full_box(cur, b"vmhd", 0, 1)?;
        atoms::write_zeros(cur, 8)?; // graphicsmode + opcolor
        atoms::fill_box_size(cur, pos)
    }

    fn write_dinf(&self, cur: &mut Cursor<Vec<u8>>) -> EngineResult<()> {
        let dinf = atoms::begin_box(cur, b"dinf")?;
        let dref = atoms::begin_full_box(cur, b"dref", 0, 0)?;
        cur.write_u32::<BigEndian>(1)?; // entry count
        let url = atoms::begin_full_box(cur, b"url ", 0, 1)?; // self-contained
        atoms::fill_box_size(cur, url)?;
        atoms::fill_box_size(cur, dref)?;
        atoms::fill_box_size(cur, dinf)
    }

    fn write_stbl(
        &self,
        cur: &mut Cursor<Vec<u8>>,
        spec: &VideoTrackSpec,
        chunk_offset: u64,
    ) -> EngineResult<()> {
        let stbl = atoms::begin_box(cur, b"stbl")?;
        self.write_stsd(cur, spec)?;

        if self.config.fragmented {
            for (box_type, trailing_zero) in
                [(b"stts", 1usize), (b"stsc", 1), (b"stsz", 2), (b"stco", 1)]
            {
                let pos = atoms::begin_full_box(cur, box_type, 0, 0)?;
                atoms::write_zeros(cur, trailing_zero * 4)?;
                atoms::fill_box_size(cur, pos)?;
            }
        } else {
            self.write_stts(cur)?;
            self.write_stss(cur)?;

            // One chunk holding every sample.
            let stsc = atoms::begin_full_box(cur, b"stsc", 0, 0)?;
            cur.write_u32::<BigEndian>(1)?;
            cur.write_u32::<BigEndian>(1)?; // first chunk
            cur.write_u32::<BigEndian>(self.samples.len() as u32)?;
            cur.write_u32::<BigEndian>(1)?; // sample description index
            atoms::fill_box_size(cur, stsc)?;

            let stsz = atoms::begin_full_box(cur, b"stsz", 0, 0)?;
            cur.write_u32::<BigEndian>(0)?; // no uniform size
            cur.write_u32::<BigEndian>(self.samples.len() as u32)?;
            for s in &self.samples {
                cur.write_u32::<BigEndian>(s.size)?;
            }
            atoms::fill_box_size(cur, stsz)?;

            if chunk_offset > u32::MAX as u64 {
                return Err(EngineError::format("chunk offset exceeds stco range"));
            }
            let stco = atoms::begin_full_box(cur, b"stco", 0, 0)?;
            cur.write_u32::<BigEndian>(1)?;
            cur.write_u32::<BigEndian>(chunk_offset as u32)?;
            atoms::fill_box_size(cur, stco)?;
        }

        atoms::fill_box_size(cur, stbl)
    }

    fn write_stts(&self, cur: &mut Cursor<Vec<u8>>) -> EngineResult<()> {
        // Run-length encode consecutive equal durations.
        let mut runs: Vec<(u32, u32)> = Vec::new();
        for s in &self.samples {
            match runs.last_mut() {
                Some((count, d)) if *d == s.duration_ms => *count += 1,
                _ => runs.push((1, s.duration_ms)),
            }
        }
        let pos = atoms::begin_full_box(cur, b"stts", 0, 0)?;
        cur.write_u32::<BigEndian>(runs.len() as u32)?;
        for (count, duration) in runs {
            cur.write_u32::<BigEndian>(count)?;
            cur.write_u32::<BigEndian>(duration)?;
        }
        atoms::fill_box_size(cur, pos)
    }

    fn write_stss(&self, cur: &mut Cursor<Vec<u8>>) -> EngineResult<()> {
        if self.samples.iter().all(|s| s.keyframe) {
            return Ok(()); // absent stss means every sample is sync
        }
        let sync: Vec<u32> = self
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.keyframe)
            .map(|(i, _)| i as u32 + 1)
            .collect();
        let pos = atoms::begin_full_box(cur, b"stss", 0, 0)?;
        cur.write_u32::<BigEndian>(sync.len() as u32)?;
        for index in sync {
            cur.write_u32::<BigEndian>(index)?;
        }
        atoms::fill_box_size(cur, pos)
    }

    fn write_stsd(&self, cur: &mut Cursor<Vec<u8>>, spec: &VideoTrackSpec) -> EngineResult<()> {
        let stsd = atoms::begin_full_box(cur, b"stsd", 0, 0)?;
        cur.write_u32::<BigEndian>(1)?; // entry count

        let entry = atoms::begin_box(cur, spec.codec.fourcc())?;
        atoms::write_zeros(cur, 6)?;
        cur.write_u16::<BigEndian>(1)?; // data reference index
        atoms::write_zeros(cur, 16)?; // pre_defined/reserved
        cur.write_u16::<BigEndian>(spec.width as u16)?;
        cur.write_u16::<BigEndian>(spec.height as u16)?;
        cur.write_u32::<BigEndian>(0x0048_0000)?; // 72 dpi
        cur.write_u32::<BigEndian>(0x0048_0000)?;
        cur.write_u32::<BigEndian>(0)?;
        cur.write_u16::<BigEndian>(1)?; // frame count
        atoms::write_zeros(cur, 32)?; // compressor name
        cur.write_u16::<BigEndian>(0x0018)?; // depth
        cur.write_i16::<BigEndian>(-1)?;

        match spec.codec {
            VideoCodec::Av1 => {
                let av1c = atoms::begin_box(cur, b"av1C")?;
                cur.write_all(&spec.codec_config)?;
                atoms::fill_box_size(cur, av1c)?;
            }
            VideoCodec::Vp9 => {
                let vpcc = atoms::begin_full_box(cur, b"vpcC", 1, 0)?;
                cur.write_u8(0)?; // profile
                cur.write_u8(10)?; // level 1.0
                // bit depth 8, chroma 4:2:0 colocated, studio range
                cur.write_u8((8 << 4) | (1 << 1))?;
                cur.write_u8(1)?; // primaries BT.709
                cur.write_u8(1)?; // transfer
                cur.write_u8(1)?; // matrix
                cur.write_u16::<BigEndian>(0)?; // no init data
                atoms::fill_box_size(cur, vpcc)?;
            }
        }

        atoms::fill_box_size(cur, entry)?;
        atoms::fill_box_size(cur, stsd)
    }

    // ── fragmented path ──────────────────────────────────────────────

    fn pending_duration_ms(&self) -> u64 {
        self.fragment.iter().map(|s| s.duration_ms as u64).sum()
    }

    fn flush_fragment(&mut self) -> EngineResult<()> {
        if self.fragment.is_empty() {
            return Ok(());
        }
        self.sequence += 1;

        let mut cur = Cursor::new(Vec::new());
        let moof = atoms::begin_box(&mut cur, b"moof")?;

        let mfhd = atoms::begin_full_box(&mut cur, b"mfhd", 0, 0)?;
        cur.write_u32::<BigEndian>(self.sequence)?;
        atoms::fill_box_size(&mut cur, mfhd)?;

        let traf = atoms::begin_box(&mut cur, b"traf")?;
        // default-base-is-moof
        let tfhd = atoms::begin_full_box(&mut cur, b"tfhd", 0, 0x020000)?;
        cur.write_u32::<BigEndian>(TRACK_ID)?;
        atoms::fill_box_size(&mut cur, tfhd)?;

        let tfdt = atoms::begin_full_box(&mut cur, b"tfdt", 1, 0)?;
        cur.write_u64::<BigEndian>(self.fragment_base_ms.max(0) as u64)?;
        atoms::fill_box_size(&mut cur, tfdt)?;

        // data_offset + per-sample duration/size/flags
        let trun = atoms::begin_full_box(&mut cur, b"trun", 0, 0x000701)?;
        cur.write_u32::<BigEndian>(self.fragment.len() as u32)?;
        let data_offset_pos = cur.stream_position()?;
        cur.write_i32::<BigEndian>(0)?; // patched below
        for s in &self.fragment {
            cur.write_u32::<BigEndian>(s.duration_ms)?;
            cur.write_u32::<BigEndian>(s.data.len() as u32)?;
            cur.write_u32::<BigEndian>(if s.keyframe {
                SAMPLE_FLAGS_SYNC
            } else {
                SAMPLE_FLAGS_NON_SYNC
            })?;
        }
        atoms::fill_box_size(&mut cur, trun)?;
        atoms::fill_box_size(&mut cur, traf)?;
        atoms::fill_box_size(&mut cur, moof)?;

        // First sample byte sits just past the moof and the mdat header.
        let moof_len = cur.get_ref().len() as i32;
        cur.seek(SeekFrom::Start(data_offset_pos))?;
        cur.write_i32::<BigEndian>(moof_len + 8)?;
        self.out.write_all(cur.get_ref())?;

        let mdat = atoms::begin_box(&mut self.out, b"mdat")?;
        for s in &self.fragment {
            self.out.write_all(&s.data)?;
        }
        atoms::fill_box_size(&mut self.out, mdat)?;

        self.fragment_base_ms = self.next_decode_ms;
        self.fragment.clear();
        Ok(())
    }

    fn write_tags_box(&mut self, tags: &MuxTags) -> EngineResult<()> {
        if tags.plain.is_empty() && tags.envelope.is_none() {
            return Ok(());
        }
        let payload = match &tags.envelope {
            Some(env) => env.clone(),
            None => tags::encode(&tags.plain, None)?,
        };
        let pos = atoms::begin_box(&mut self.out, b"free")?;
        self.out.write_all(&payload)?;
        atoms::fill_box_size(&mut self.out, pos)
    }
}

impl<W: Write + Seek + Send> ContainerSink for Mp4Writer<W> {
    fn start(&mut self, spec: &VideoTrackSpec) -> EngineResult<()> {
        if self.spec.is_some() {
            return Err(EngineError::state("mp4 writer already started"));
        }
        self.spec = Some(spec.clone());
        self.write_ftyp()?;
        if self.config.fragmented {
            let moov = self.build_moov(0)?;
            self.out.write_all(&moov)?;
        } else {
            self.spool = Some(tempfile::tempfile()?);
        }
        Ok(())
    }

    fn write_sample(&mut self, sample: &VideoSample<'_>) -> EngineResult<()> {
        self.spec()?;
        if self.config.fragmented {
            let cut = !self.fragment.is_empty()
                && (sample.keyframe
                    || self.pending_duration_ms() >= self.config.frag_duration_ms);
            if cut {
                self.flush_fragment()?;
            }
            if self.fragment.is_empty() {
                self.fragment_base_ms = sample.pts_ms;
            }
            self.fragment.push(PendingSample {
                data: sample.data.to_vec(),
                duration_ms: sample.duration_ms,
                keyframe: sample.keyframe,
            });
        } else {
            let spool = self
                .spool
                .as_mut()
                .ok_or_else(|| EngineError::state("mp4 spool missing"))?;
            spool.write_all(sample.data)?;
            self.samples.push(SampleInfo {
                size: sample.data.len() as u32,
                duration_ms: sample.duration_ms,
                keyframe: sample.keyframe,
            });
        }
        self.next_decode_ms = sample.pts_ms + sample.duration_ms as i64;
        Ok(())
    }

    fn finish(&mut self, tags: &MuxTags) -> EngineResult<()> {
        if self.finished {
            return Err(EngineError::state("mp4 writer already finished"));
        }
        if self.config.fragmented {
            self.flush_fragment()?;
            self.write_tags_box(tags)?;
        } else {
            // The moov size does not depend on the chunk offset value
            // (stco entries are fixed-width), so build once to measure,
            // then rebuild with the real offset.
            let ftyp_end = self.out.stream_position()?;
            let moov_len = self.build_moov(0)?.len() as u64;
            let tags_len = self.tags_box_len(tags)?;
            let chunk_offset = ftyp_end + moov_len + tags_len + 16;
            let moov = self.build_moov(chunk_offset)?;
            self.out.write_all(&moov)?;
            self.write_tags_box(tags)?;

            let mdat_size_pos = atoms::begin_large_box(&mut self.out, b"mdat")?;
            let mut spool = self
                .spool
                .take()
                .ok_or_else(|| EngineError::state("mp4 spool missing"))?;
            spool.seek(SeekFrom::Start(0))?;
            std::io::copy(&mut spool, &mut self.out)?;
            atoms::fill_large_box_size(&mut self.out, mdat_size_pos)?;
        }
        self.out.flush()?;
        self.finished = true;
        Ok(())
    }
}

impl<W: Write + Seek + Send> Mp4Writer<W> {
    fn tags_box_len(&self, tags: &MuxTags) -> EngineResult<u64> {
        if tags.plain.is_empty() && tags.envelope.is_none() {
            return Ok(0);
        }
        let payload_len = match &tags.envelope {
            Some(env) => env.len(),
            None => tags::encode(&tags.plain, None)?.len(),
        };
        Ok(payload_len as u64 + 8)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::TagSet;

    fn spec() -> VideoTrackSpec {
        VideoTrackSpec {
            codec: VideoCodec::Av1,
            width: 320,
            height: 240,
            fps: 25,
            codec_config: vec![0x81, 0x00, 0x0C, 0x00],
        }
    }

    fn sample_tags() -> MuxTags {
        let mut plain = TagSet::new();
        plain.insert("comment", "ata");
        MuxTags {
            plain,
            envelope: None,
        }
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|w| w == needle)
    }

    fn write_fragmented(samples: &[(i64, bool)]) -> Vec<u8> {
        let mut writer = Mp4Writer::new(Cursor::new(Vec::new()), Mp4Config::default());
        writer.start(&spec()).unwrap();
        for (pts, key) in samples {
            writer
                .write_sample(&VideoSample {
                    data: &[0xAA; 16],
                    pts_ms: *pts,
                    duration_ms: 40,
                    keyframe: *key,
                })
                .unwrap();
        }
        writer.finish(&sample_tags()).unwrap();
        writer.into_inner().into_inner()
    }

    #[test]
    fn fragmented_layout() {
        let data = write_fragmented(&[(0, true), (40, false), (80, true), (120, false)]);
        let ftyp = find(&data, b"ftyp").unwrap();
        let moov = find(&data, b"moov").unwrap();
        let moof = find(&data, b"moof").unwrap();
        let mdat = find(&data, b"mdat").unwrap();
        assert!(ftyp < moov && moov < moof && moof < mdat);
        assert!(find(&data, b"mvex").is_some());
        assert!(find(&data, b"av1C").is_some());
        // Two keyframes, two fragments.
        assert_eq!(data.windows(4).filter(|w| w == b"moof").count(), 2);
        // Tag envelope in a trailing free box.
        let free = find(&data, b"free").unwrap();
        assert_eq!(&data[free + 4..free + 8], tags::MAGIC);
    }

    #[test]
    fn faststart_puts_moov_before_mdat() {
        let config = Mp4Config {
            fragmented: false,
            ..Mp4Config::default()
        };
        let mut writer = Mp4Writer::new(Cursor::new(Vec::new()), config);
        writer.start(&spec()).unwrap();
        for (pts, key) in [(0i64, true), (40, false), (80, false)] {
            writer
                .write_sample(&VideoSample {
                    data: &[0xBB; 10],
                    pts_ms: pts,
                    duration_ms: 40,
                    keyframe: key,
                })
                .unwrap();
        }
        writer.finish(&sample_tags()).unwrap();
        let data = writer.into_inner().into_inner();

        let moov = find(&data, b"moov").unwrap();
        let mdat = find(&data, b"mdat").unwrap();
        assert!(moov < mdat);
        assert!(find(&data, b"mvex").is_none());
        assert!(find(&data, b"stss").is_some());

        // stco's single chunk offset points at the first sample byte.
        let stco = find(&data, b"stco").unwrap();
        let offset =
            u32::from_be_bytes(data[stco + 12..stco + 16].try_into().unwrap()) as usize;
        assert_eq!(&data[offset..offset + 10], &[0xBB; 10]);
    }

    #[test]
    fn trun_counts_samples() {
        let data = write_fragmented(&[(0, true), (40, false), (80, false)]);
        let trun = find(&data, b"trun").unwrap();
        let count = u32::from_be_bytes(data[trun + 8..trun + 12].try_into().unwrap());
        assert_eq!(count, 3);
    }

    #[test]
    fn sample_before_start_is_state_error() {
        let mut writer = Mp4Writer::new(Cursor::new(Vec::new()), Mp4Config::default());
        let result = writer.write_sample(&VideoSample {
            data: &[0u8],
            pts_ms: 0,
            duration_ms: 40,
            keyframe: true,
        });
        assert!(matches!(result, Err(EngineError::State(_))));
    }
}
