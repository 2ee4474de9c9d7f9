//! Process-wide logging configuration
//!
//! The engine logs through `tracing`. Verbosity is configured once, at
//! startup, through [`set_log_level`]; sessions snapshot the level at
//! creation time rather than observing later changes.

use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Recognized verbosity levels, ordered from most to least quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Quiet,
    Error,
    Warning,
    Info,
    Verbose,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parses a level name. Unrecognized names yield `None`; callers fall
    /// back to [`LogLevel::default`].
    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quiet" | "off" => Some(LogLevel::Quiet),
            "error" | "fatal" | "panic" => Some(LogLevel::Error),
            "warning" | "warn" => Some(LogLevel::Warning),
            "info" => Some(LogLevel::Info),
            "verbose" => Some(LogLevel::Verbose),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn filter_directive(self) -> &'static str {
        match self {
            LogLevel::Quiet => "clipforge=off",
            LogLevel::Error => "clipforge=error",
            LogLevel::Warning => "clipforge=warn",
            LogLevel::Info => "clipforge=info",
            // tracing has no distinct "verbose"; map it onto debug.
            LogLevel::Verbose | LogLevel::Debug => "clipforge=debug",
            LogLevel::Trace => "clipforge=trace",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

static CONFIGURED_LEVEL: OnceLock<LogLevel> = OnceLock::new();

/// Configures the process-wide log level from a level name.
///
/// Unrecognized names fall back to the default level instead of failing.
/// The first call installs the subscriber; later calls are no-ops (the
/// level is process-wide configuration, not per-call state).
pub fn set_log_level(level: &str) {
    let parsed = LogLevel::parse(level).unwrap_or_default();
    init(parsed);
}

/// Installs the tracing subscriber with an explicit level.
///
/// `RUST_LOG` in the environment takes precedence over `level`. Safe to
/// call repeatedly; only the first call has an effect.
pub fn init(level: LogLevel) {
    let stored = *CONFIGURED_LEVEL.get_or_init(|| level);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| stored.filter_directive().into());

    // try_init so embedders with their own subscriber are left alone.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// The level the process was configured with, or the default when
/// [`init`] has not run.
pub fn current_level() -> LogLevel {
    CONFIGURED_LEVEL.get().copied().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels() {
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("QUIET"), Some(LogLevel::Quiet));
        assert_eq!(LogLevel::parse(" trace "), Some(LogLevel::Trace));
    }

    #[test]
    fn unknown_level_falls_back_to_default() {
        assert_eq!(LogLevel::parse("chatty"), None);
        assert_eq!(
            LogLevel::parse("chatty").unwrap_or_default(),
            LogLevel::Info
        );
        // Must not panic on unknown input.
        set_log_level("chatty");
    }
}
