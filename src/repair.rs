//! Container repair engine
//!
//! Streamed WebM captures come in without a Segment duration, seek index,
//! or sized elements; players can neither seek nor report length. Repair
//! rewrites the header-level structure around the original payload:
//! pass 1 scans blocks to accumulate timing, pass 2 streams every block
//! into a fresh seekable file. Payload bytes are never re-encoded.
//!
//! The integer entry points keep the scripting contract: `0` success,
//! `1` any expected failure (missing input, unrecognized container).
//! Output is committed by temp-file rename, so a failed repair leaves
//! nothing behind.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};
use crate::tags::{self, TagSet};
use crate::webm::reader::{resolve_tags, RawTags, WebmReader};
use crate::webm::writer::{build_tags_payload, WebmWriter};

/// Caller-supplied metadata for a repair run.
///
/// `title`/`comment`/`ata`/`monitor` are shorthand tags; `meta` carries
/// arbitrary extras. With no tags at all the output still gets
/// `comment = "ata"`, preserving the original engine's marker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepairOptions {
    pub title: Option<String>,
    pub comment: Option<String>,
    pub ata: Option<String>,
    pub monitor: Option<String>,
    pub meta: TagSet,
    pub password: Option<String>,
}

impl RepairOptions {
    fn tags(&self) -> TagSet {
        let mut tags = self.meta.clone();
        // A literal "password" key never lands in the output tags.
        tags.remove("password");
        if let Some(v) = &self.title {
            tags.insert("title", v);
        }
        if let Some(v) = &self.comment {
            tags.insert("comment", v);
        }
        if let Some(v) = &self.ata {
            tags.insert("ata", v);
        }
        if let Some(v) = &self.monitor {
            tags.insert("monitor", v);
        }
        tags
    }
}

/// Outcome details from a successful repair.
#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub duration_ms: i64,
    pub blocks: u64,
}

/// Repairs `input` into `output`. Returns `0` on success, `1` on failure.
pub fn fixup_webm(input: &Path, output: &Path, options: &RepairOptions) -> i32 {
    match try_fixup(input, output, options) {
        Ok(report) => {
            tracing::info!(
                input = %input.display(),
                output = %output.display(),
                duration_ms = report.duration_ms,
                blocks = report.blocks,
                "repair complete"
            );
            0
        }
        Err(e) => {
            tracing::warn!(input = %input.display(), error = %e, "repair failed");
            1
        }
    }
}

/// Async form of [`fixup_webm`]; same semantics, run on the blocking
/// worker pool. A dropped future does not cancel the work.
pub async fn fixup_webm_async(input: PathBuf, output: PathBuf, options: RepairOptions) -> i32 {
    tokio::task::spawn_blocking(move || fixup_webm(&input, &output, &options))
        .await
        .unwrap_or(1)
}

/// The fallible core of the repair algorithm.
pub fn try_fixup(input: &Path, output: &Path, options: &RepairOptions) -> EngineResult<RepairReport> {
    // Pass 1: scan timing.
    let file = File::open(input)?;
    let mut reader = WebmReader::new(BufReader::new(file))?;
    if reader.tracks.is_empty() {
        return Err(EngineError::format("input has no Tracks element"));
    }

    let mut per_track: BTreeMap<u64, (i64, i64)> = BTreeMap::new(); // (last_ts, last_delta)
    let mut blocks: u64 = 0;
    while let Some(blk) = reader.next_block()? {
        let entry = per_track.entry(blk.track).or_insert((blk.timestamp_ms, 0));
        if blk.timestamp_ms > entry.0 {
            entry.1 = blk.timestamp_ms - entry.0;
            entry.0 = blk.timestamp_ms;
        }
        blocks += 1;
    }
    if blocks == 0 {
        return Err(EngineError::format("input contains no media blocks"));
    }

    let duration_ms = per_track
        .iter()
        .map(|(track, (last_ts, last_delta))| {
            let frame_ms = reader
                .track(*track)
                .and_then(|t| t.default_duration_ns)
                .map(|ns| (ns / 1_000_000) as i64)
                .filter(|&ms| ms > 0)
                .unwrap_or(*last_delta);
            last_ts + frame_ms.max(0)
        })
        .max()
        .unwrap_or(0);

    let output_tags = merged_tags(options, reader.tags.as_ref())?;

    // Pass 2: rewrite. The temp file lives next to the target so the
    // final rename stays on one filesystem.
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let temp = tempfile::NamedTempFile::new_in(&parent)?;
    let mut writer = WebmWriter::new(temp, &reader.doc_type)?;
    writer.write_info(Some(duration_ms as f64))?;
    writer.write_tracks_raw(&reader.tracks_raw)?;
    writer.write_tags(&output_tags)?;

    let mut reader = WebmReader::new(BufReader::new(File::open(input)?))?;
    while let Some(blk) = reader.next_block()? {
        writer.add_block(blk.track, blk.timestamp_ms, blk.keyframe, &blk.body)?;
    }
    writer.finalize()?;

    let temp = writer.into_inner();
    temp.persist(output)
        .map_err(|e| EngineError::Io(e.error))?;

    Ok(RepairReport {
        duration_ms,
        blocks,
    })
}

/// Merges caller tags over tags already present in the input, then builds
/// the Tags element payload (sealed when a password is configured).
fn merged_tags(options: &RepairOptions, existing: Option<&RawTags>) -> EngineResult<Vec<u8>> {
    let mut merged = options.tags();
    if let Some(raw) = existing {
        merged.merge_missing(&raw.plain);
    }
    if merged.is_empty() {
        merged.insert("comment", "ata");
    }

    match &options.password {
        Some(pw) => {
            let envelope = tags::encode(&merged, Some(pw))?;
            Ok(build_tags_payload(&TagSet::new(), Some(&envelope)))
        }
        None => {
            // An envelope already in the input is carried along untouched;
            // caller tags stay readable beside it.
            let envelope = existing.and_then(|raw| raw.envelope.clone());
            Ok(build_tags_payload(&merged, envelope.as_deref()))
        }
    }
}

/// Reads the tag block of a finished container without repairing it.
pub fn get_meta_tags(path: &Path, password: Option<&str>) -> EngineResult<TagSet> {
    let data = std::fs::read(path)?;
    crate::probe::read_tags_from_bytes(&data, password)
}

/// Async form of [`get_meta_tags`].
pub async fn get_meta_tags_async(path: PathBuf, password: Option<String>) -> EngineResult<TagSet> {
    tokio::task::spawn_blocking(move || get_meta_tags(&path, password.as_deref()))
        .await
        .map_err(|e| EngineError::state(format!("worker failed: {e}")))?
}

/// WebM-side tag extraction used by the dispatching reader in `probe`.
pub(crate) fn read_webm_tags(data: &[u8], password: Option<&str>) -> EngineResult<TagSet> {
    let mut reader = WebmReader::new(std::io::Cursor::new(data))?;
    if reader.tags.is_none() {
        // Tags may trail the clusters; walk to the end of the stream.
        while reader.next_block()?.is_some() {}
    }
    match &reader.tags {
        Some(raw) => resolve_tags(raw, password),
        None => Ok(TagSet::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebml::{self, elements as el};
    use crate::webm::block::build_simple_block;

    /// A streamed-style capture: unknown-size Segment and Cluster, no
    /// duration, no cues.
    fn streamed_fixture() -> Vec<u8> {
        let mut header = Vec::new();
        header.extend(ebml::uint_element(el::EBML_VERSION, 1));
        header.extend(ebml::string_element(el::DOC_TYPE, "webm"));
        let mut out = ebml::element(el::EBML_HEADER, &header);

        out.extend_from_slice(&[0x18, 0x53, 0x80, 0x67]);
        out.extend_from_slice(&[0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);

        let mut info = ebml::uint_element(el::TIMECODE_SCALE, 1_000_000);
        info.extend(ebml::string_element(el::MUXING_APP, "browser"));
        out.extend(ebml::element(el::INFO, &info));

        let tracks = crate::webm::writer::build_video_tracks_payload(
            "V_VP9",
            320,
            240,
            None,
            Some(40_000_000),
        );
        out.extend(ebml::element(el::TRACKS, &tracks));

        out.extend_from_slice(&[0x1F, 0x43, 0xB6, 0x75, 0xFF]);
        out.extend(ebml::uint_element(el::TIMECODE, 0));
        for (ts, key) in [(0i16, true), (40, false), (80, false), (120, false)] {
            let body = build_simple_block(1, ts, key, &[ts as u8, 0xAB]).unwrap();
            out.extend(ebml::element(el::SIMPLE_BLOCK, &body));
        }
        out
    }

    #[test]
    fn repairs_streamed_capture() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.webm");
        let output = dir.path().join("out.webm");
        std::fs::write(&input, streamed_fixture()).unwrap();

        assert_eq!(fixup_webm(&input, &output, &RepairOptions::default()), 0);

        let data = std::fs::read(&output).unwrap();
        let mut reader = WebmReader::new(std::io::Cursor::new(data)).unwrap();
        // 120ms last block + 40ms default duration
        assert_eq!(reader.declared_duration_ms(), Some(160));
        let mut count = 0;
        while let Some(blk) = reader.next_block().unwrap() {
            assert_eq!(blk.timestamp_ms, count * 40);
            count += 1;
        }
        assert_eq!(count, 4);
        // Default marker tag when the caller supplied none.
        let raw = reader.tags.unwrap();
        assert_eq!(raw.plain.get("comment"), Some("ata"));
    }

    #[test]
    fn repair_is_idempotent_on_payload() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.webm");
        let once = dir.path().join("once.webm");
        let twice = dir.path().join("twice.webm");
        std::fs::write(&input, streamed_fixture()).unwrap();

        assert_eq!(fixup_webm(&input, &once, &RepairOptions::default()), 0);
        assert_eq!(fixup_webm(&once, &twice, &RepairOptions::default()), 0);

        let collect = |p: &Path| {
            let data = std::fs::read(p).unwrap();
            let mut reader = WebmReader::new(std::io::Cursor::new(data)).unwrap();
            let duration = reader.declared_duration_ms();
            let mut bodies = Vec::new();
            while let Some(blk) = reader.next_block().unwrap() {
                bodies.push(blk.body);
            }
            (duration, bodies)
        };
        assert_eq!(collect(&once), collect(&twice));
    }

    #[test]
    fn missing_input_returns_one_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("a.webm");
        let code = fixup_webm(
            Path::new("/nonexistent.webm"),
            &output,
            &RepairOptions::default(),
        );
        assert_eq!(code, 1);
        assert!(!output.exists());
        // The temp file must not linger either.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn non_ascii_paths() {
        let dir = tempfile::tempdir().unwrap();
        let subdir = dir.path().join("中文");
        std::fs::create_dir(&subdir).unwrap();
        let input = subdir.join("test.webm");
        let output = subdir.join("a.webm");
        std::fs::write(&input, streamed_fixture()).unwrap();
        assert_eq!(fixup_webm(&input, &output, &RepairOptions::default()), 0);
        assert!(output.exists());
    }

    #[test]
    fn caller_tags_and_encryption() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.webm");
        let output = dir.path().join("out.webm");
        std::fs::write(&input, streamed_fixture()).unwrap();

        let options = RepairOptions {
            title: Some("clip".into()),
            monitor: Some("2".into()),
            password: Some("secret".into()),
            ..RepairOptions::default()
        };
        assert_eq!(fixup_webm(&input, &output, &options), 0);

        let tags = get_meta_tags(&output, Some("secret")).unwrap();
        assert_eq!(tags.get("title"), Some("clip"));
        assert_eq!(tags.get("monitor"), Some("2"));

        assert!(matches!(
            get_meta_tags(&output, Some("wrong")),
            Err(EngineError::Auth(_))
        ));
        assert!(matches!(
            get_meta_tags(&output, None),
            Err(EngineError::Auth(_))
        ));
    }

    #[test]
    fn garbage_input_returns_one() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.webm");
        let output = dir.path().join("out.webm");
        std::fs::write(&input, b"not a webm file at all").unwrap();
        assert_eq!(fixup_webm(&input, &output, &RepairOptions::default()), 1);
        assert!(!output.exists());
    }
}
