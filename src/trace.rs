use std::fs::File;
use std::sync::Arc;

use tracing::warn;
use tracing_subscriber::{filter, prelude::*};

/// Environment variable naming a file to receive a JSON snapshot of each
/// solve (obstacles, per-path point sequences, search count).
pub(crate) const SOLVE_TRACE_ENV: &str = "BENDROUTE_SOLVE_TRACE_JSON";

/// Installs a layered subscriber: pretty INFO events on stdout plus the full
/// event stream in `debug.log`. Intended for binaries, benches, and manual
/// debugging; returns an error if a global subscriber is already set.
pub fn init_debug_logging() -> Result<(), Box<dyn std::error::Error>> {
    let stdout_log = tracing_subscriber::fmt::layer().pretty();
    let file = File::create("debug.log")?;
    let debug_log = tracing_subscriber::fmt::layer().with_writer(Arc::new(file));

    tracing_subscriber::registry()
        .with(
            stdout_log
                .with_filter(filter::LevelFilter::INFO)
                .and_then(debug_log),
        )
        .try_init()?;
    Ok(())
}

/// Writes the solve snapshot to the file named by [`SOLVE_TRACE_ENV`], if
/// set. Trace I/O never fails the solve; problems are only logged.
pub(crate) fn dump_solve_snapshot(snapshot: impl FnOnce() -> serde_json::Value) {
    let Ok(path) = std::env::var(SOLVE_TRACE_ENV) else {
        return;
    };
    let value = snapshot();
    match serde_json::to_string_pretty(&value) {
        Ok(serialized) => {
            if let Err(err) = std::fs::write(&path, serialized) {
                warn!(%err, path = %path, "failed to write solve trace");
            }
        }
        Err(err) => warn!(%err, "failed to serialize solve trace"),
    }
}
