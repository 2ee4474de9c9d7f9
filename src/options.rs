//! Encoding session configuration
//!
//! Options arrive as free-form bags in the scripting layers; here they are
//! an explicit struct validated at session creation, before any I/O starts.
//! Free-form `demuxer`/`muxer`/`encoder` strings stay pass-through but must
//! be well-formed `key=value` lists.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult};
use crate::tags::TagSet;

/// Output container selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp4,
    Flv,
}

impl OutputFormat {
    pub fn parse(s: &str) -> EngineResult<OutputFormat> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp4" => Ok(OutputFormat::Mp4),
            "flv" => Ok(OutputFormat::Flv),
            other => Err(EngineError::options(format!(
                "unknown output format '{other}' (expected mp4 or flv)"
            ))),
        }
    }
}

/// Parses a free-form `key=value` parameter list.
///
/// Pairs are separated by `;` (the original engine also accepted `:`);
/// every pair must contain `=` with a non-empty key. Order is preserved,
/// later duplicates win on lookup.
pub fn parse_param_list(s: &str) -> EngineResult<Vec<(String, String)>> {
    let mut params = Vec::new();
    for pair in s.split(|c| c == ';' || c == ':') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            EngineError::options(format!("malformed parameter '{pair}' (expected key=value)"))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(EngineError::options(format!(
                "empty key in parameter '{pair}'"
            )));
        }
        params.push((key.to_string(), value.trim().to_string()));
    }
    Ok(params)
}

fn lookup<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Parsed `movflags`-style finalization flags.
///
/// Input is a `+`-joined flag list (`frag_keyframe+empty_moov`,
/// `+faststart+use_metadata_tags`); a leading `+` is tolerated and unknown
/// flags are ignored with a warning, matching the forgiving original.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MovFlags {
    pub faststart: bool,
    pub frag_keyframe: bool,
    pub empty_moov: bool,
    pub use_metadata_tags: bool,
}

impl MovFlags {
    pub fn parse(s: &str) -> MovFlags {
        let mut flags = MovFlags::default();
        for flag in s.split('+').map(str::trim).filter(|f| !f.is_empty()) {
            match flag {
                "faststart" => flags.faststart = true,
                "frag_keyframe" => flags.frag_keyframe = true,
                "empty_moov" => flags.empty_moov = true,
                "use_metadata_tags" => flags.use_metadata_tags = true,
                other => tracing::warn!("ignoring unknown movflag '{other}'"),
            }
        }
        flags
    }

    /// Whether the output should be written as successive fragments.
    pub fn fragmented(&self) -> bool {
        self.frag_keyframe || self.empty_moov
    }
}

/// Configuration for a capture/encode session.
///
/// Defaults mirror the original engine: 25 fps, 1920x1080, keyframe every
/// 40 frames, 8 Mbit/s when neither `bitrate` nor `quality` is given, and
/// fragmented MP4 output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncodingOptions {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Quantizer-based rate control target, 1 (best) ..= 50 (worst).
    pub quality: Option<u32>,
    /// Explicit bitrate in bits per second. Takes precedence over `quality`.
    pub bitrate: Option<u64>,
    /// Keyframe interval in frames.
    pub gop: Option<u32>,
    /// Container finalization flags, `+`-joined.
    pub movflags: Option<String>,
    /// Capture-source override string (`video_size=WxH;framerate=N;...`).
    pub demuxer: Option<String>,
    /// Pass-through multiplexer parameters.
    pub muxer: Option<String>,
    /// Pass-through codec parameters.
    pub encoder: Option<String>,
    /// Encoder profile name, forwarded to the codec configuration.
    pub profile: Option<String>,
    pub format: OutputFormat,
    /// Arbitrary tags embedded at finalization.
    pub meta: TagSet,
    pub comment: Option<String>,
    pub title: Option<String>,
    /// Tag-block encryption key. Absent means plaintext tags.
    pub password: Option<String>,
    /// Fragment length in milliseconds for fragmented output.
    pub frag_duration: Option<u64>,
}

impl Default for EncodingOptions {
    fn default() -> Self {
        Self {
            fps: 25,
            width: 1920,
            height: 1080,
            quality: None,
            bitrate: None,
            gop: None,
            movflags: None,
            demuxer: None,
            muxer: None,
            encoder: None,
            profile: None,
            format: OutputFormat::Mp4,
            meta: TagSet::new(),
            comment: None,
            title: None,
            password: None,
            frag_duration: None,
        }
    }
}

impl EncodingOptions {
    /// Validates the whole option set and applies `demuxer` geometry
    /// overrides. Called once at session creation; errors here are
    /// `OptionError` and no I/O has happened yet.
    pub fn validate(&mut self) -> EngineResult<()> {
        if self.fps == 0 || self.fps > 240 {
            return Err(EngineError::options(format!(
                "fps {} out of range (1..=240)",
                self.fps
            )));
        }
        if let Some(q) = self.quality {
            if !(1..=50).contains(&q) {
                return Err(EngineError::options(format!(
                    "quality {q} out of range (1..=50)"
                )));
            }
        }
        if let Some(b) = self.bitrate {
            if b == 0 {
                return Err(EngineError::options("bitrate must be non-zero"));
            }
        }
        if let Some(g) = self.gop {
            if g == 0 {
                return Err(EngineError::options("gop must be non-zero"));
            }
        }

        // Well-formedness of the pass-through strings is a construction-time
        // contract even though their contents are forwarded opaquely.
        for (name, value) in [
            ("demuxer", &self.demuxer),
            ("muxer", &self.muxer),
            ("encoder", &self.encoder),
        ] {
            if let Some(s) = value {
                parse_param_list(s)
                    .map_err(|e| EngineError::options(format!("{name}: {e}")))?;
            }
        }

        self.apply_source_overrides()?;

        if self.width == 0 || self.height == 0 {
            return Err(EngineError::options(format!(
                "invalid frame geometry {}x{}",
                self.width, self.height
            )));
        }
        // Chroma subsampling needs even dimensions.
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(EngineError::options(format!(
                "frame geometry {}x{} must be even",
                self.width, self.height
            )));
        }
        Ok(())
    }

    /// Folds `video_size`/`framerate` from the `demuxer` string into the
    /// typed geometry fields. Other keys pass through untouched.
    fn apply_source_overrides(&mut self) -> EngineResult<()> {
        let Some(demuxer) = &self.demuxer else {
            return Ok(());
        };
        let params = parse_param_list(demuxer)?;
        if let Some(size) = lookup(&params, "video_size") {
            let (w, h) = size.split_once('x').ok_or_else(|| {
                EngineError::options(format!("video_size '{size}' (expected WxH)"))
            })?;
            self.width = w
                .parse()
                .map_err(|_| EngineError::options(format!("video_size width '{w}'")))?;
            self.height = h
                .parse()
                .map_err(|_| EngineError::options(format!("video_size height '{h}'")))?;
        }
        if let Some(rate) = lookup(&params, "framerate") {
            self.fps = rate
                .parse()
                .map_err(|_| EngineError::options(format!("framerate '{rate}'")))?;
        }
        Ok(())
    }

    /// Effective rate control: explicit bitrate wins over quality; with
    /// neither set the original's 8 Mbit/s default applies.
    pub fn effective_bitrate(&self) -> Option<u64> {
        match (self.bitrate, self.quality) {
            (Some(b), _) => Some(b),
            (None, Some(_)) => None,
            (None, None) => Some(8_000_000),
        }
    }

    /// Quality target when bitrate-based control is not in effect.
    pub fn effective_quality(&self) -> Option<u32> {
        if self.bitrate.is_some() {
            None
        } else {
            self.quality
        }
    }

    pub fn effective_gop(&self) -> u32 {
        self.gop.unwrap_or(40)
    }

    /// Finalization flags, defaulting to the original's fragmented MP4
    /// profile when unset.
    pub fn mov_flags(&self) -> MovFlags {
        match &self.movflags {
            Some(s) => MovFlags::parse(s),
            None => MovFlags {
                frag_keyframe: true,
                empty_moov: true,
                ..MovFlags::default()
            },
        }
    }

    /// Encoder parameter string as a key/value map.
    pub fn encoder_params(&self) -> BTreeMap<String, String> {
        self.encoder
            .as_deref()
            .and_then(|s| parse_param_list(s).ok())
            .unwrap_or_default()
            .into_iter()
            .collect()
    }

    /// Tags to embed at finalization: `meta` plus the `title`/`comment`
    /// shorthands (shorthands win on key collision).
    pub fn metadata_tags(&self) -> TagSet {
        let mut tags = self.meta.clone();
        if let Some(title) = &self.title {
            tags.insert("title", title);
        }
        if let Some(comment) = &self.comment {
            tags.insert("comment", comment);
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_list_parses_semicolon_and_colon() {
        let params = parse_param_list("profile=main;rc_mode=bitrate:allow_skip_frames=true")
            .unwrap();
        assert_eq!(
            params,
            vec![
                ("profile".into(), "main".into()),
                ("rc_mode".into(), "bitrate".into()),
                ("allow_skip_frames".into(), "true".into()),
            ]
        );
    }

    #[test]
    fn param_list_rejects_missing_equals() {
        assert!(parse_param_list("profile").is_err());
        assert!(parse_param_list("a=1;=2").is_err());
    }

    #[test]
    fn param_list_tolerates_empty_segments() {
        assert_eq!(parse_param_list("").unwrap(), vec![]);
        assert_eq!(parse_param_list(";;").unwrap(), vec![]);
    }

    #[test]
    fn movflags_parse() {
        let flags = MovFlags::parse("+faststart+use_metadata_tags");
        assert!(flags.faststart);
        assert!(flags.use_metadata_tags);
        assert!(!flags.fragmented());

        let flags = MovFlags::parse("frag_keyframe+empty_moov");
        assert!(flags.fragmented());
    }

    #[test]
    fn bitrate_wins_over_quality() {
        let opts = EncodingOptions {
            bitrate: Some(2_000_000),
            quality: Some(10),
            ..EncodingOptions::default()
        };
        assert_eq!(opts.effective_bitrate(), Some(2_000_000));
        assert_eq!(opts.effective_quality(), None);
    }

    #[test]
    fn default_rate_control_is_bitrate() {
        let opts = EncodingOptions::default();
        assert_eq!(opts.effective_bitrate(), Some(8_000_000));
        assert_eq!(opts.effective_gop(), 40);
        assert!(opts.mov_flags().fragmented());
    }

    #[test]
    fn demuxer_geometry_override() {
        let mut opts = EncodingOptions {
            demuxer: Some("video_size=640x360;framerate=10".into()),
            ..EncodingOptions::default()
        };
        opts.validate().unwrap();
        assert_eq!((opts.width, opts.height, opts.fps), (640, 360, 10));
    }

    #[test]
    fn malformed_demuxer_string_fails_validation() {
        let mut opts = EncodingOptions {
            demuxer: Some("video_size".into()),
            ..EncodingOptions::default()
        };
        assert!(matches!(
            opts.validate(),
            Err(EngineError::Options(_))
        ));
    }

    #[test]
    fn odd_geometry_rejected() {
        let mut opts = EncodingOptions {
            width: 641,
            ..EncodingOptions::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn metadata_tags_merge() {
        let mut opts = EncodingOptions::default();
        opts.meta.insert("monitor", "1");
        opts.title = Some("capture".into());
        let tags = opts.metadata_tags();
        assert_eq!(tags.get("monitor"), Some("1"));
        assert_eq!(tags.get("title"), Some("capture"));
    }

    #[test]
    fn options_deserialize_camel_case() {
        let opts: EncodingOptions = serde_json::from_str(
            r#"{"fps":30,"fragDuration":2000,"format":"flv"}"#,
        )
        .unwrap();
        assert_eq!(opts.fps, 30);
        assert_eq!(opts.frag_duration, Some(2000));
        assert_eq!(opts.format, OutputFormat::Flv);
    }
}
