// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `tracing` subscriber setup shared by the binary and by tests.
//!
//! Verbosity comes from the `CCDEMUX_LOG` env filter (default `info`); the
//! parser's debug streams live under targets like `ccdemux::parse` and
//! `ccdemux::vides`, so `CCDEMUX_LOG=ccdemux::parse=debug` turns on one
//! stream without drowning in the others. `CCDEMUX_FORMAT` selects the
//! output shape: human-readable lines with microsecond timestamps by
//! default, `systemd` priority prefixes when running under journald, or
//! `json`.

use tracing_core::{Event, Level, Subscriber};
use tracing_log::NormalizeEvent;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::{FmtContext, FormatFields, FormattedFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

enum LogFormat {
    Plain,
    Systemd,
    Json,
}

impl LogFormat {
    fn from_env() -> Self {
        match std::env::var("CCDEMUX_FORMAT").as_deref() {
            Ok("systemd") => LogFormat::Systemd,
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .with_env_var("CCDEMUX_LOG")
        .from_env_lossy()
}

struct MicrosTimer;

impl FormatTime for MicrosTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", jiff::Zoned::now().strftime("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}

/// sd-daemon(3) priority prefixes journald uses to classify a line.
fn sd_priority(level: Level) -> &'static str {
    if level == Level::ERROR {
        "<3>"
    } else if level == Level::WARN {
        "<4>"
    } else if level == Level::INFO {
        "<5>"
    } else if level == Level::DEBUG {
        "<6>"
    } else {
        "<7>"
    }
}

/// Event format for the `systemd` output: a priority prefix, the target, the
/// enclosing span scope, then the event fields. journald supplies its own
/// timestamps, so none are written here.
struct SdDaemonFormat;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for SdDaemonFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        // Events forwarded from the `log` facade carry their real metadata
        // out of band.
        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());

        write!(writer, "{}{}: ", sd_priority(*meta.level()), meta.target())?;
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                writer.write_char(' ')?;
            }
        }
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Panics are reported through the same stream as demux errors so they get a
/// timestamp, land at the right journald priority, and are not interleaved
/// with whatever the caption sink is writing to stdout.
fn log_panic(info: &std::panic::PanicHookInfo) {
    let message = info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| info.payload().downcast_ref::<String>().map(String::as_str));
    tracing::error!(
        target: "ccdemux::panic",
        location = info.location().map(tracing::field::display),
        backtrace = %std::backtrace::Backtrace::force_capture(),
        "panic: {}",
        message.unwrap_or("<non-string payload>"),
    );
}

/// Installs the global subscriber, the `log` bridge, and the panic hook.
/// Call once, before the first diagnostic.
pub fn install() {
    tracing_log::LogTracer::init().expect("no global logger installed yet");
    let registry = tracing_subscriber::registry();
    match LogFormat::from_env() {
        LogFormat::Systemd => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .event_format(SdDaemonFormat)
                .with_filter(env_filter());
            tracing::subscriber::set_global_default(registry.with(layer))
                .expect("no global subscriber installed yet");
        }
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_filter(env_filter());
            tracing::subscriber::set_global_default(registry.with(layer))
                .expect("no global subscriber installed yet");
        }
        LogFormat::Plain => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_timer(MicrosTimer)
                .with_filter(env_filter());
            tracing::subscriber::set_global_default(registry.with(layer))
                .expect("no global subscriber installed yet");
        }
    }

    // Setting CCDEMUX_NO_PANIC_HOOK keeps the default stderr panic output,
    // which is easier to read under a debugger.
    if std::env::var_os("CCDEMUX_NO_PANIC_HOOK").is_none() {
        std::panic::set_hook(Box::new(log_panic));
    }
}

/// As [`install`], but writes through the test writer so output is captured
/// per test, and leaves the panic hook alone (the test harness needs its
/// own).
pub fn install_for_tests() {
    tracing_log::LogTracer::init().expect("no global logger installed yet");
    let layer = tracing_subscriber::fmt::layer()
        .with_test_writer()
        .with_timer(MicrosTimer)
        .with_filter(env_filter());
    tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layer))
        .expect("no global subscriber installed yet");
}
