//! Structured logging for buildstep
//!
//! Every engine event carries the same small set of fields so runs can be
//! filtered and aggregated:
//!
//! - `step`: the step's name
//! - `step_id`: the step's identity (short form in human output)
//! - `operation`: what happened ("cache.lookup", "step.run", ...)
//! - `status`: the result ("hit", "miss", "success", "error")
//!
//! # Examples
//!
//! ```rust,ignore
//! use tracing::info;
//! use buildstep::logging::{operations, status};
//!
//! info!(
//!     step = %step.name(),
//!     step_id = %step.id().short(),
//!     operation = operations::CACHE_LOOKUP,
//!     status = status::HIT,
//!     "cache hit"
//! );
//! ```
//!
//! Logs go to stderr; stdout is reserved for command output.

use std::{fmt as std_fmt, io};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    fmt::{self, format::Writer},
    prelude::*,
    EnvFilter,
};

/// Formatter that tags lines with "buildstep" instead of the module path
struct BuildstepFormatter {
    with_ansi: bool,
}

impl<S, N> FormatEvent<S, N> for BuildstepFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std_fmt::Result {
        let meta = event.metadata();

        write!(
            writer,
            "{} ",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f")
        )?;

        if self.with_ansi {
            let level_style = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::TRACE => "\x1b[35m",
            };
            write!(writer, "{}{:5}(buildstep)\x1b[0m: ", level_style, meta.level())?;
        } else {
            write!(writer, "{:5}(buildstep): ", meta.level())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Colored, for terminals
    Pretty,
    /// Plain, for CI logs
    Compact,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    /// Read `BUILDSTEP_LOG_FORMAT`, defaulting to compact under CI
    pub fn from_env() -> Self {
        Self::parse(
            std::env::var("BUILDSTEP_LOG_FORMAT").ok().as_deref(),
            std::env::var_os("CI").is_some(),
        )
    }

    fn parse(value: Option<&str>, ci: bool) -> Self {
        match value.unwrap_or_default().to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            "pretty" => Self::Pretty,
            _ if ci => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` sets the filter (default `info`), `BUILDSTEP_LOG_FORMAT` the
/// format. Calling it twice is harmless; the second call is ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match LogFormat::from_env() {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(BuildstepFormatter { with_ansi: true })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(BuildstepFormatter { with_ansi: false })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(false)
                    .with_writer(io::stderr)
                    .json(),
            )
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("buildstep: logging already initialized: {e}");
    }
}

/// Operation names
pub mod operations {
    pub const CACHE_LOOKUP: &str = "cache.lookup";
    pub const CACHE_RESTORE: &str = "cache.restore";
    pub const CACHE_STORE: &str = "cache.store";
    pub const STEP_RUN: &str = "step.run";
    pub const IMAGE_COMMIT: &str = "image.commit";
    pub const PIPELINE_EXECUTE: &str = "pipeline.execute";
}

/// Status values
pub mod status {
    pub const HIT: &str = "hit";
    pub const MISS: &str = "miss";
    pub const SUCCESS: &str = "success";
    pub const ERROR: &str = "error";
}
