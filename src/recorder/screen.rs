//! Screen capture driver.
//!
//! `record_screen` opens a [`Recorder`] over the configured output and
//! runs a capture loop on a dedicated thread, paced at the configured
//! frame rate. Frames come from a [`ScreenSource`]; the Windows backend
//! grabs the desktop with GDI BitBlt, and [`TestPatternSource`] provides
//! a synthetic source for tests and headless embedders.
//!
//! Pacing controls only when frames are pulled. Presentation times still
//! come from the session's frame counter, so a slow source yields fewer
//! frames, never a stretched timeline.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::options::EncodingOptions;
use crate::recorder::Recorder;

/// A frame producer for the capture loop. `next_frame` returns one RGBA
/// buffer of `dimensions` size per call.
pub trait ScreenSource: Send {
    fn dimensions(&self) -> (u32, u32);
    fn next_frame(&mut self) -> EngineResult<Vec<u8>>;
}

/// Synthetic source: a moving gradient, deterministic per frame index.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame: u64,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame: 0,
        }
    }
}

impl ScreenSource for TestPatternSource {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn next_frame(&mut self) -> EngineResult<Vec<u8>> {
        let mut buf = Vec::with_capacity((self.width * self.height * 4) as usize);
        let shift = (self.frame * 8) as u32;
        for row in 0..self.height {
            for col in 0..self.width {
                buf.push(((col + shift) % 256) as u8);
                buf.push(((row + shift) % 256) as u8);
                buf.push((self.frame % 256) as u8);
                buf.push(255);
            }
        }
        self.frame += 1;
        Ok(buf)
    }
}

/// Counters returned by [`ScreenRecording::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenReport {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub duration_ms: u64,
}

/// Handle to a running capture. `stop` is a synchronous join; the
/// session is closed exactly once, on the capture thread.
pub struct ScreenRecording {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<ScreenReport>>,
}

impl ScreenRecording {
    pub fn stop(mut self) -> EngineResult<ScreenReport> {
        self.stop_flag.store(true, Ordering::SeqCst);
        let handle = self
            .handle
            .take()
            .ok_or_else(|| EngineError::state("capture already stopped"))?;
        handle
            .join()
            .map_err(|_| EngineError::capture("capture thread panicked"))
    }
}

impl Drop for ScreenRecording {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop_flag.store(true, Ordering::SeqCst);
            let _ = handle.join();
        }
    }
}

/// Starts a screen recording with an explicit frame source. Options are
/// validated (demuxer/muxer/encoder strings included) before the thread
/// spawns. Geometry comes from the source; a demuxer `video_size`
/// override must agree with it, since captured frames are fed through
/// unscaled. A `framerate` override is honored.
pub fn record_screen_with_source<S: ScreenSource + 'static>(
    mut source: S,
    output: &Path,
    mut options: EncodingOptions,
) -> EngineResult<ScreenRecording> {
    let (src_width, src_height) = source.dimensions();
    options.width = src_width;
    options.height = src_height;
    if options.quality.is_none() && options.bitrate.is_none() {
        options.quality = Some(5);
    }
    options.validate()?;
    if (options.width, options.height) != (src_width, src_height) {
        return Err(EngineError::options(format!(
            "video_size {}x{} does not match the capture source {src_width}x{src_height}",
            options.width, options.height
        )));
    }

    let recorder = Recorder::new(output, options.clone())?;
    let fps = options.fps;
    let (width, height) = (options.width, options.height);
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop = stop_flag.clone();

    info!(path = %output.display(), width, height, fps, "screen capture starting");
    let handle = thread::Builder::new()
        .name("screen-capture".into())
        .spawn(move || {
            let interval = Duration::from_secs_f64(1.0 / fps as f64);
            let started = Instant::now();
            let mut tick = 0u32;
            let mut frames_captured = 0u64;
            let mut frames_dropped = 0u64;

            while !stop.load(Ordering::SeqCst) {
                match source.next_frame() {
                    Ok(frame) => {
                        if bool::from(recorder.add_image(&frame, width, height)) {
                            frames_captured += 1;
                        } else {
                            frames_dropped += 1;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "frame capture failed");
                        frames_dropped += 1;
                    }
                }
                tick += 1;
                let deadline = started + interval * tick;
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                }
            }

            recorder.close();
            frames_dropped += recorder.frames_dropped();
            let report = ScreenReport {
                frames_captured,
                frames_dropped,
                duration_ms: frames_captured * 1000 / fps as u64,
            };
            debug!(?report, "screen capture finished");
            report
        })?;

    Ok(ScreenRecording {
        stop_flag,
        handle: Some(handle),
    })
}

/// Starts a recording of the primary display.
#[cfg(target_os = "windows")]
pub fn record_screen(output: &Path, options: EncodingOptions) -> EngineResult<ScreenRecording> {
    record_screen_with_source(gdi::GdiScreenSource::open()?, output, options)
}

#[cfg(not(target_os = "windows"))]
pub fn record_screen(_output: &Path, _options: EncodingOptions) -> EngineResult<ScreenRecording> {
    Err(EngineError::capture(
        "no screen capture backend on this platform",
    ))
}

/// Desktop capture through GDI BitBlt.
#[cfg(target_os = "windows")]
mod gdi {
    use super::*;
    use std::mem::zeroed;
    use windows::Win32::Graphics::Gdi::{
        BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject, GetDC,
        GetDIBits, SelectObject, BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS, SRCCOPY,
    };
    use windows::Win32::UI::WindowsAndMessaging::{
        GetDesktopWindow, GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN,
    };

    pub struct GdiScreenSource {
        width: u32,
        height: u32,
    }

    impl GdiScreenSource {
        pub fn open() -> EngineResult<Self> {
            let (width, height) = unsafe {
                (
                    GetSystemMetrics(SM_CXSCREEN) as u32,
                    GetSystemMetrics(SM_CYSCREEN) as u32,
                )
            };
            if width == 0 || height == 0 {
                return Err(EngineError::capture("no display available"));
            }
            // Encoder geometry must be even.
            Ok(Self {
                width: width & !1,
                height: height & !1,
            })
        }
    }

    impl ScreenSource for GdiScreenSource {
        fn dimensions(&self) -> (u32, u32) {
            (self.width, self.height)
        }

        fn next_frame(&mut self) -> EngineResult<Vec<u8>> {
            let (width, height) = (self.width, self.height);
            unsafe {
                let hwnd = GetDesktopWindow();
                let hdc_screen = GetDC(hwnd);
                if hdc_screen.is_invalid() {
                    return Err(EngineError::capture("GetDC failed"));
                }
                let hdc_mem = CreateCompatibleDC(hdc_screen);
                if hdc_mem.is_invalid() {
                    return Err(EngineError::capture("CreateCompatibleDC failed"));
                }
                let hbitmap = CreateCompatibleBitmap(hdc_screen, width as i32, height as i32);
                if hbitmap.is_invalid() {
                    DeleteDC(hdc_mem);
                    return Err(EngineError::capture("CreateCompatibleBitmap failed"));
                }

                let old_bitmap = SelectObject(hdc_mem, hbitmap);
                let blitted = BitBlt(
                    hdc_mem,
                    0,
                    0,
                    width as i32,
                    height as i32,
                    hdc_screen,
                    0,
                    0,
                    SRCCOPY,
                )
                .as_bool();

                let mut buffer = vec![0u8; (width * height * 4) as usize];
                let mut lines = 0;
                if blitted {
                    let mut bmi: BITMAPINFO = zeroed();
                    bmi.bmiHeader.biSize = std::mem::size_of::<BITMAPINFOHEADER>() as u32;
                    bmi.bmiHeader.biWidth = width as i32;
                    // Negative height for a top-down DIB.
                    bmi.bmiHeader.biHeight = -(height as i32);
                    bmi.bmiHeader.biPlanes = 1;
                    bmi.bmiHeader.biBitCount = 32;
                    bmi.bmiHeader.biCompression = BI_RGB.0;
                    lines = GetDIBits(
                        hdc_mem,
                        hbitmap,
                        0,
                        height,
                        Some(buffer.as_mut_ptr() as *mut _),
                        &mut bmi,
                        DIB_RGB_COLORS,
                    );
                }

                SelectObject(hdc_mem, old_bitmap);
                DeleteObject(hbitmap);
                DeleteDC(hdc_mem);

                if !blitted || lines == 0 {
                    return Err(EngineError::capture("desktop blit failed"));
                }
                // GDI hands back BGRA.
                for px in buffer.chunks_exact_mut(4) {
                    px.swap(0, 2);
                }
                Ok(buffer)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe;

    fn capture_options() -> EncodingOptions {
        EncodingOptions {
            fps: 10,
            quality: Some(50),
            ..EncodingOptions::default()
        }
    }

    #[test]
    fn records_from_test_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("screen.mp4");
        let recording = record_screen_with_source(
            TestPatternSource::new(64, 48),
            &target,
            capture_options(),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(350));
        let report = recording.stop().unwrap();

        assert!(report.frames_captured >= 2, "report: {report:?}");
        assert_eq!(
            report.duration_ms,
            report.frames_captured * 100,
            "timeline is counter-driven"
        );

        let info = probe::probe(&target).unwrap();
        assert_eq!(info.format, probe::ContainerFormat::Mp4);
        assert_eq!(info.tracks[0].width, 64);
    }

    #[test]
    fn invalid_encoder_string_fails_before_capture() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = capture_options();
        options.encoder = Some("profile".into());
        let result = record_screen_with_source(
            TestPatternSource::new(64, 48),
            &dir.path().join("x.mp4"),
            options,
        );
        assert!(matches!(result, Err(EngineError::Options(_))));
    }

    #[test]
    fn video_size_override_must_match_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = capture_options();
        options.demuxer = Some("video_size=32x24".into());
        let result = record_screen_with_source(
            TestPatternSource::new(64, 48),
            &dir.path().join("x.mp4"),
            options,
        );
        assert!(matches!(result, Err(EngineError::Options(_))));
    }

    #[test]
    fn matching_override_records_frames() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("override.mp4");
        let mut options = capture_options();
        options.demuxer = Some("video_size=64x48;framerate=20".into());
        let recording = record_screen_with_source(
            TestPatternSource::new(64, 48),
            &target,
            options,
        )
        .unwrap();
        thread::sleep(Duration::from_millis(200));
        let report = recording.stop().unwrap();
        assert!(report.frames_captured >= 1, "report: {report:?}");
        assert_eq!(report.duration_ms, report.frames_captured * 50);
    }

    #[test]
    fn dropping_the_handle_joins_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("dropped.mp4");
        let recording = record_screen_with_source(
            TestPatternSource::new(64, 48),
            &target,
            capture_options(),
        )
        .unwrap();
        drop(recording);
        assert!(target.exists());
    }
}
