//! Provide tracing, tailored to this program.
//!
//! The binary calls [`init_stderr`] once at startup. Everything else
//! uses `use crate::tracing::prelude::*` for the `trace!()` ... `error!()`
//! macros.
//!
//! Logs go to stderr because stdout carries the JSON command responses.

use std::fmt;

use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{
        format::{DefaultFields, Writer as FmtWriter},
        time::FormatTime,
        FmtContext, FormatEvent, FormatFields,
    },
    prelude::*,
    registry::LookupSpan,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

/// Install the stderr subscriber, filtered by RUST_LOG (default INFO).
///
/// Set `RUST_LOG=packctl=trace` to see every bus transaction.
pub fn init_stderr() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .fmt_fields(DefaultFields::new())
                .event_format(CompactFormatter),
        )
        .init();
}

/// One line per event: time, level, target without the crate prefix,
/// message, then any structured fields as `key=value`.
struct CompactFormatter;

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else if !field.name().starts_with("log.") {
            self.fields.push((field.name(), format!("{:?}", value)));
        }
    }
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

        let level = match *event.metadata().level() {
            Level::ERROR => "ERROR",
            Level::WARN => "WARN ",
            Level::INFO => "INFO ",
            Level::DEBUG => "DEBUG",
            Level::TRACE => "TRACE",
        };
        let target = event.metadata().target();
        let target = target.strip_prefix("packctl::").unwrap_or(target);
        write!(writer, " {} {}: ", level, target)?;

        if let Some(msg) = &visitor.message {
            write!(writer, "{}", msg.trim_matches('"'))?;
        }
        for (key, value) in &visitor.fields {
            write!(writer, " {}={}", key, value.trim_matches('"'))?;
        }
        writeln!(writer)
    }
}

// Local wall-clock time to the second; the default timer prints long UTC
// timestamps.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut FmtWriter<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let stamp = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| fmt::Error)?;
        write!(w, "{}", stamp)
    }
}
