//! ---
//! parley_section: "01-shared-runtime"
//! parley_subsection: "module"
//! parley_type: "source"
//! parley_scope: "code"
//! parley_description: "Shared primitives for every extension context."
//! parley_version: "v0.0.0-prealpha"
//! parley_owner: "tbd"
//! ---
//! Tracing bootstrap for a process hosting one or more extension contexts.
//!
//! Every context writes to its own rolling file so that a popup's records do
//! not interleave with the background's when both run in one process.

use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "PARLEY_LOG";
const DEFAULT_FILE_PREFIX: &str = "parley";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Writer guards; dropping them would lose buffered records.
struct Guards {
    _file: WorkerGuard,
    _stdout: WorkerGuard,
}

static GUARDS: OnceCell<Guards> = OnceCell::new();

/// Available log formats for bus-hosting processes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Base name of the rolling log file for `context`, e.g. `parley-popup.log`.
///
/// Characters outside `[A-Za-z0-9_-]` in the context label become `-`.
pub fn log_file_name(context: &str, config: &LoggingConfig) -> String {
    let prefix = config
        .file_prefix
        .as_deref()
        .filter(|prefix| !prefix.trim().is_empty())
        .unwrap_or(DEFAULT_FILE_PREFIX);
    let label: String = context
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let label = if label.is_empty() { "context" } else { label.as_str() };
    format!("{}-{}.log", prefix, label)
}

/// Install the process-wide subscriber for the context named `context`.
///
/// * `PARLEY_LOG` overrides the log filter (e.g. `info`, `parley_msg=trace`).
///   When unset `RUST_LOG` is honoured, finally defaulting to `info`.
/// * Stdout receives the configured format. A daily rolling JSON file named
///   by [`log_file_name`] is written under `config.directory`.
/// * JSON output carries the fields of the current span, so records emitted
///   inside a listener turn show which context and bus they belong to.
///
/// Only the first call installs a subscriber; later calls are no-ops.
pub fn init_tracing(context: &str, config: &LoggingConfig) -> Result<()> {
    if GUARDS.get().is_some() {
        return Ok(());
    }

    std::fs::create_dir_all(&config.directory)?;
    let file_name = log_file_name(context, config);
    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, &file_name));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    if GUARDS
        .set(Guards {
            _file: file_guard,
            _stdout: stdout_guard,
        })
        .is_err()
    {
        // Lost a race with another initialiser; its subscriber stands.
        return Ok(());
    }

    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(vec![stdout_layer(config.format, stdout_writer), file_layer])
        .with(env_filter())
        .try_init()
        .ok();

    info!(
        context = %context,
        log_dir = %config.directory.display(),
        log_file = %file_name,
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}

fn stdout_layer(format: LogFormat, writer: NonBlocking) -> BoxedLayer {
    match format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(writer)
            .boxed(),
    }
}

fn env_filter() -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(directive).unwrap_or_else(|err| {
            eprintln!(
                "invalid {} directive ({}); defaulting to info logging",
                LOG_ENV, err
            );
            EnvFilter::new("info")
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}
