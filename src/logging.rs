//! Tracing subscriber setup.
//!
//! Logs go to a daily rolling file when `host.log_dir` is set, otherwise to
//! stderr. `RUST_LOG` overrides the default directives.

use qrlink_core::shellexpand;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Crates whose level follows the verbosity setting.
const OWN_CRATES: &[&str] = &["qrlink", "qrlink_core", "qrlink_session", "qrlink_backend"];

/// Default filter directives.
///
/// Stderr shares the terminal with the interactive display, so it only gets
/// warnings unless `verbose` is set.
fn build_filter_directives(verbose: bool, to_file: bool) -> Vec<String> {
    let level = if verbose {
        "debug"
    } else if to_file {
        "info"
    } else {
        "warn"
    };
    let mut directives = vec!["warn".to_string()];
    directives.extend(OWN_CRATES.iter().map(|krate| format!("{krate}={level}")));
    directives
}

/// Install the global subscriber. Keep the returned guard alive until exit
/// so buffered file lines are flushed.
pub fn init(log_dir: &str, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let to_file = !log_dir.is_empty();
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(build_filter_directives(verbose, to_file).join(",")));

    if !to_file {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()?;
        return Ok(None);
    }

    let dir = shellexpand(log_dir);
    std::fs::create_dir_all(&dir)?;
    let appender = tracing_appender::rolling::daily(&dir, "qrlink.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()?;
    Ok(Some(guard))
}
