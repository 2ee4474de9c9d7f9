//! End-to-end coverage through the public surface only: repair, tags,
//! recording sessions, screen capture, and the combiner.

use std::io::Cursor;
use std::path::Path;

use clipforge::error::EngineError;
use clipforge::options::EncodingOptions;
use clipforge::recorder::{record_screen_with_source, Recorder, RejectReason, TestPatternSource};
use clipforge::repair::{fixup_webm, fixup_webm_async, get_meta_tags, RepairOptions};
use clipforge::tags::TagSet;
use clipforge::webm::block::build_simple_block;
use clipforge::webm::writer::build_video_tracks_payload;
use clipforge::webm::{WebmReader, WebmWriter};
use clipforge::{combine, probe, ContainerFormat};

/// A minimal but complete capture file: one VP9 video track, keyframe
/// every other block, 40ms cadence.
fn write_capture(path: &Path, timestamps: &[i64]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = WebmWriter::new(file, "webm").unwrap();
    writer.write_info(None).unwrap();
    let tracks = build_video_tracks_payload("V_VP9", 160, 120, None, Some(40_000_000));
    writer.write_tracks_raw(&tracks).unwrap();
    for (i, ts) in timestamps.iter().enumerate() {
        let key = i % 2 == 0;
        let body = build_simple_block(1, 0, key, &[i as u8; 32]).unwrap();
        writer.add_block(1, *ts, key, &body).unwrap();
    }
    writer.finalize().unwrap();
}

#[test]
fn repair_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("capture.webm");
    let once = dir.path().join("once.webm");
    let twice = dir.path().join("twice.webm");
    write_capture(&input, &[0, 40, 80, 120]);

    assert_eq!(fixup_webm(&input, &once, &RepairOptions::default()), 0);
    assert_eq!(fixup_webm(&once, &twice, &RepairOptions::default()), 0);

    let read_blocks = |p: &Path| {
        let mut reader = WebmReader::new(Cursor::new(std::fs::read(p).unwrap())).unwrap();
        let mut out = Vec::new();
        while let Some(b) = reader.next_block().unwrap() {
            out.push((b.timestamp_ms, b.keyframe, b.body));
        }
        out
    };
    assert_eq!(read_blocks(&once), read_blocks(&twice));

    let info = probe(&once).unwrap();
    assert_eq!(info.format, ContainerFormat::Webm);
    assert_eq!(info.duration_ms, Some(160));
}

#[test]
fn repair_handles_non_ascii_paths() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("захват видео.webm");
    let output = dir.path().join("исправлено.webm");
    write_capture(&input, &[0, 40]);
    assert_eq!(fixup_webm(&input, &output, &RepairOptions::default()), 0);
    assert!(output.exists());
}

#[test]
fn failed_repair_leaves_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("never-written.webm");
    let output = dir.path().join("out.webm");
    assert_eq!(fixup_webm(&missing, &output, &RepairOptions::default()), 1);
    assert!(!output.exists());

    let garbage = dir.path().join("garbage.webm");
    std::fs::write(&garbage, b"not even close to EBML").unwrap();
    assert_eq!(fixup_webm(&garbage, &output, &RepairOptions::default()), 1);
    assert!(!output.exists());
}

#[test]
fn sealed_tags_require_the_password() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("capture.webm");
    let output = dir.path().join("tagged.webm");
    write_capture(&input, &[0, 40]);

    let mut meta = TagSet::new();
    meta.insert("project", "launch-video");
    let options = RepairOptions {
        title: Some("Launch".into()),
        password: Some("s3cret".into()),
        meta,
        ..RepairOptions::default()
    };
    assert_eq!(fixup_webm(&input, &output, &options), 0);

    let tags = get_meta_tags(&output, Some("s3cret")).unwrap();
    assert_eq!(tags.get("title"), Some("Launch"));
    assert_eq!(tags.get("project"), Some("launch-video"));

    assert!(matches!(
        get_meta_tags(&output, Some("wrong")),
        Err(EngineError::Auth(_))
    ));
    assert!(matches!(
        get_meta_tags(&output, None),
        Err(EngineError::Auth(_))
    ));
}

#[tokio::test]
async fn async_repair_mirrors_sync_codes() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("capture.webm");
    let output = dir.path().join("fixed.webm");
    write_capture(&input, &[0, 40, 80]);

    let code = fixup_webm_async(
        input.clone(),
        output.clone(),
        RepairOptions::default(),
    )
    .await;
    assert_eq!(code, 0);
    assert!(output.exists());

    let code = fixup_webm_async(
        dir.path().join("missing.webm"),
        dir.path().join("nope.webm"),
        RepairOptions::default(),
    )
    .await;
    assert_eq!(code, 1);
}

#[test]
fn recorder_orders_frames_and_survives_close() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("ordered.mp4");
    let options = EncodingOptions {
        fps: 10,
        width: 64,
        height: 48,
        quality: Some(50),
        comment: Some("integration".into()),
        ..EncodingOptions::default()
    };
    let recorder = Recorder::new(&target, options).unwrap();
    for shade in [0u8, 60, 120, 180] {
        let frame = [shade, shade, shade, 255].repeat(64 * 48);
        assert!(bool::from(recorder.add_image(&frame, 64, 48)));
    }
    recorder.close();
    recorder.close();
    assert!(recorder.last_error().is_none());
    assert_eq!(
        recorder.add_image(&[0u8; 64 * 48 * 4], 64, 48).reason(),
        Some(RejectReason::SessionClosed)
    );

    let info = probe(&target).unwrap();
    assert_eq!(info.duration_ms, Some(400));
    let tags = get_meta_tags(&target, None).unwrap();
    assert_eq!(tags.get("comment"), Some("integration"));
    assert!(tags.get("creation_time").is_some());
}

#[test]
fn screen_capture_produces_playable_output() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("screen.mp4");
    let options = EncodingOptions {
        fps: 10,
        ..EncodingOptions::default()
    };
    let recording =
        record_screen_with_source(TestPatternSource::new(64, 48), &target, options).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(400));
    let report = recording.stop().unwrap();

    assert!(report.frames_captured >= 2);
    let info = probe(&target).unwrap();
    assert_eq!(info.format, ContainerFormat::Mp4);
    assert_eq!(info.tracks[0].codec, "av01");
}

#[test]
fn combine_keeps_the_timeline_continuous() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.webm");
    let b = dir.path().join("b.webm");
    let joined = dir.path().join("joined.webm");
    write_capture(&a, &[0, 40, 80]);
    write_capture(&b, &[0, 40]);

    let report = combine::combine(&joined, &[a, b]).unwrap();
    assert_eq!(report.blocks, 5);
    assert_eq!(probe(&joined).unwrap().duration_ms, Some(200));

    let mut reader = WebmReader::new(Cursor::new(std::fs::read(&joined).unwrap())).unwrap();
    let mut stamps = Vec::new();
    while let Some(block) = reader.next_block().unwrap() {
        stamps.push(block.timestamp_ms);
    }
    // B's first sample lands one 40ms frame interval after A's last.
    assert_eq!(stamps, vec![0, 40, 80, 120, 160]);
}

#[test]
fn log_level_setter_never_panics() {
    clipforge::set_log_level("verbose");
    clipforge::set_log_level("not-a-level");
    clipforge::set_log_level("");
}
