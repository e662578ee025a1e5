//! Log output for binaries built on this crate.
//!
//! The library only emits events through the `tracing` macros; it never
//! installs a subscriber. A binary calls [`init_stdout`] (or
//! [`init_stdout_with`]) once at startup to get compact, human-oriented log
//! lines on stdout, filtered by `RUST_LOG`.
//!
//! Code in the crate can `use crate::tracing::prelude::*` for the usual
//! `trace!()` .. `error!()` macros.

use std::fmt;
use std::io::IsTerminal;

use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{
        FmtContext, FormatEvent, FormatFields,
        format::{DefaultFields, Writer as FmtWriter},
        time::FormatTime,
    },
    prelude::*,
    registry::LookupSpan,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

/// Log to stdout at INFO unless `RUST_LOG` says otherwise.
pub fn init_stdout() {
    init_stdout_with(LevelFilter::INFO);
}

/// Log to stdout with `default` as the level when `RUST_LOG` is unset.
///
/// Colors are used only when stdout is a terminal.
pub fn init_stdout_with(default: LevelFilter) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    let color = std::io::stdout().is_terminal();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .with_ansi(color)
                .fmt_fields(DefaultFields::new())
                .event_format(CompactFormatter { color }),
        )
        .init();
}

/// One line per event: time, level, short target, message. Structured
/// fields follow on an indented second line.
struct CompactFormatter {
    color: bool,
}

impl CompactFormatter {
    fn paint(&self, code: &'static str) -> &'static str {
        if self.color { code } else { "" }
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let formatted = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(formatted);
            return;
        }

        // Some("x") -> x
        let cleaned = match formatted.strip_prefix("Some(") {
            Some(inner) => inner.strip_suffix(')').unwrap_or(inner).to_string(),
            None => formatted,
        };
        self.fields.push((field.name().to_string(), cleaned));
    }
}

fn short_target(target: &str) -> &str {
    target.strip_prefix("stratum_rpc::").unwrap_or(target)
}

impl<S, N> FormatEvent<S, N> for CompactFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        LocalTimer.format_time(&mut writer)?;

        let (level_color, level_text) = match *event.metadata().level() {
            Level::ERROR => ("\x1b[31m", "ERROR"),
            Level::WARN => ("\x1b[33m", "WARN "),
            Level::INFO => ("\x1b[32m", "INFO "),
            Level::DEBUG => ("\x1b[34m", "DEBUG"),
            Level::TRACE => ("\x1b[35m", "TRACE"),
        };
        write!(
            writer,
            " {}{}{} {}: ",
            self.paint(level_color),
            level_text,
            self.paint("\x1b[0m"),
            short_target(event.metadata().target())
        )?;

        if let Some(message) = &visitor.message {
            write!(writer, "{}", message.trim_matches('"'))?;
        }

        if !visitor.fields.is_empty() {
            // Timestamp (8) + space + level (5) + space
            write!(writer, "\n{}               ", self.paint("\x1b[90m"))?;
            for (i, (key, value)) in visitor.fields.iter().enumerate() {
                if i > 0 {
                    write!(writer, ", ")?;
                }
                write!(writer, "{}={}", key, value.trim_matches('"'))?;
            }
            write!(writer, "{}", self.paint("\x1b[0m"))?;
        }

        writeln!(writer)
    }
}

/// Local wall-clock time to the second.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut FmtWriter<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
