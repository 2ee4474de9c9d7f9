//! WebM file combiner.
//!
//! Concatenates two or more repaired WebM files into one continuous
//! stream. Every input is probed up front; any incompatibility fails
//! before a single output byte exists. Timestamps are renumbered so file
//! k starts one frame interval after file k-1 ends.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, error, info};

use crate::error::{EngineError, EngineResult};
use crate::webm::{TrackInfo, WebmReader, WebmWriter};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CombineReport {
    pub inputs: usize,
    pub duration_ms: i64,
    pub blocks: u64,
}

/// Per-track layout used for the compatibility gate.
#[derive(Debug, Clone, PartialEq)]
struct TrackShape {
    track_type: u64,
    codec_id: String,
    width: Option<u32>,
    height: Option<u32>,
    sampling_frequency: Option<f64>,
    channels: Option<u32>,
}

impl TrackShape {
    fn of(track: &TrackInfo) -> Self {
        Self {
            track_type: track.track_type,
            codec_id: track.codec_id.clone(),
            width: track.width,
            height: track.height,
            sampling_frequency: track.sampling_frequency,
            channels: track.channels,
        }
    }
}

fn open_input(path: &Path) -> EngineResult<WebmReader<BufReader<File>>> {
    WebmReader::new(BufReader::new(File::open(path)?))
}

fn shapes(reader: &WebmReader<BufReader<File>>) -> BTreeMap<u64, TrackShape> {
    reader
        .tracks
        .iter()
        .map(|t| (t.number, TrackShape::of(t)))
        .collect()
}

/// Interval appended between the last sample of one input and the first
/// of the next, derived from the video track's declared frame duration.
fn seam_interval_ms(reader: &WebmReader<BufReader<File>>) -> i64 {
    reader
        .video_track()
        .and_then(|t| t.default_duration_ns)
        .map(|ns| (ns / 1_000_000).max(1) as i64)
        .unwrap_or(40)
}

/// Merges `inputs` into `output`. Fewer than two inputs is an options
/// error; mismatched track layouts are a format error raised before any
/// output is written.
pub fn combine(output: &Path, inputs: &[PathBuf]) -> EngineResult<CombineReport> {
    if inputs.len() < 2 {
        return Err(EngineError::options(format!(
            "combine needs at least two inputs, got {}",
            inputs.len()
        )));
    }

    // Gate pass: open everything, compare layouts against the first.
    let first = open_input(&inputs[0])?;
    let reference = shapes(&first);
    let interval_ms = seam_interval_ms(&first);
    let tracks_raw = first.tracks_raw.clone();
    drop(first);
    for path in &inputs[1..] {
        let reader = open_input(path)?;
        let shape = shapes(&reader);
        if shape != reference {
            return Err(EngineError::format(format!(
                "'{}' track layout differs from '{}'",
                path.display(),
                inputs[0].display()
            )));
        }
    }

    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let temp = NamedTempFile::new_in(parent)?;
    let mut writer = WebmWriter::new(temp.reopen()?, "webm")?;

    // Copy pass. Duration is not known until the last input is walked,
    // so Info carries a placeholder patched before finalize.
    writer.write_info_deferred()?;
    writer.write_tracks_raw(&tracks_raw)?;

    let mut offset_ms: i64 = 0;
    let mut blocks: u64 = 0;
    for (index, path) in inputs.iter().enumerate() {
        let mut reader = open_input(path)?;
        let mut last_ms = offset_ms;
        while let Some(block) = reader.next_block()? {
            let ts = offset_ms + block.timestamp_ms;
            writer.add_block(block.track, ts, block.keyframe, &block.body)?;
            last_ms = last_ms.max(ts);
            blocks += 1;
        }
        debug!(input = %path.display(), index, offset_ms, "input appended");
        offset_ms = last_ms + interval_ms;
    }
    if blocks == 0 {
        return Err(EngineError::format("inputs contain no blocks"));
    }
    // Total span: every input contributes its last timestamp plus one
    // frame interval, the same duration a repaired file declares.
    let duration_ms = offset_ms;
    writer.patch_duration(duration_ms as f64)?;
    writer.finalize()?;
    drop(writer);

    temp.persist(output).map_err(|e| EngineError::Io(e.error))?;
    info!(output = %output.display(), inputs = inputs.len(), duration_ms, "combine finished");
    Ok(CombineReport {
        inputs: inputs.len(),
        duration_ms,
        blocks,
    })
}

/// Return-code form for callers on the async boundary: `0` success,
/// `1` failure. Runs on the blocking pool; dropping the future does not
/// cancel the work.
pub async fn combine_async(output: PathBuf, inputs: Vec<PathBuf>) -> i32 {
    tokio::task::spawn_blocking(move || match combine(&output, &inputs) {
        Ok(_) => 0,
        Err(e) => {
            error!(error = %e, "combine failed");
            1
        }
    })
    .await
    .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webm::writer::build_video_tracks_payload;
    use std::io::Cursor;

    fn write_input(path: &Path, codec: &str, timestamps: &[i64]) {
        let file = File::create(path).unwrap();
        let mut writer = WebmWriter::new(file, "webm").unwrap();
        writer.write_info(None).unwrap();
        let tracks = build_video_tracks_payload(codec, 64, 48, None, Some(100_000_000));
        writer.write_tracks_raw(&tracks).unwrap();
        for (i, ts) in timestamps.iter().enumerate() {
            let body = crate::webm::block::build_simple_block(1, 0, i == 0, &[0xEE; 16]).unwrap();
            writer.add_block(1, *ts, i == 0, &body).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn fewer_than_two_inputs_is_options_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = combine(&dir.path().join("out.webm"), &[dir.path().join("a.webm")]);
        assert!(matches!(result, Err(EngineError::Options(_))));
    }

    #[test]
    fn renumbers_timestamps_continuously() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.webm");
        let b = dir.path().join("b.webm");
        write_input(&a, "V_VP9", &[0, 100, 200]);
        write_input(&b, "V_VP9", &[0, 100]);
        let out = dir.path().join("joined.webm");

        let report = combine(&out, &[a, b]).unwrap();
        assert_eq!(report.blocks, 5);
        // B starts one frame interval (100ms) after A's last sample, and
        // the total closes with one more interval.
        assert_eq!(report.duration_ms, 500);
        assert_eq!(
            crate::probe::probe(&out).unwrap().duration_ms,
            Some(500),
            "output declares its duration"
        );

        let mut reader = WebmReader::new(Cursor::new(std::fs::read(&out).unwrap())).unwrap();
        let mut stamps = Vec::new();
        while let Some(block) = reader.next_block().unwrap() {
            stamps.push(block.timestamp_ms);
        }
        assert_eq!(stamps, vec![0, 100, 200, 300, 400]);
    }

    #[test]
    fn incompatible_codec_fails_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.webm");
        let b = dir.path().join("b.webm");
        write_input(&a, "V_VP9", &[0, 100]);
        write_input(&b, "V_AV1", &[0, 100]);
        let out = dir.path().join("joined.webm");

        let result = combine(&out, &[a, b]);
        assert!(matches!(result, Err(EngineError::Format(_))));
        assert!(!out.exists());
    }

    #[test]
    fn missing_input_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.webm");
        write_input(&a, "V_VP9", &[0]);
        let result = combine(
            &dir.path().join("out.webm"),
            &[a, dir.path().join("missing.webm")],
        );
        assert!(matches!(result, Err(EngineError::Io(_))));
    }

    #[tokio::test]
    async fn async_form_resolves_return_codes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.webm");
        let b = dir.path().join("b.webm");
        write_input(&a, "V_VP9", &[0, 100]);
        write_input(&b, "V_VP9", &[0, 100]);
        let out = dir.path().join("joined.webm");

        assert_eq!(combine_async(out.clone(), vec![a.clone(), b]).await, 0);
        assert!(out.exists());
        assert_eq!(
            combine_async(dir.path().join("solo.webm"), vec![a]).await,
            1
        );
    }
}
