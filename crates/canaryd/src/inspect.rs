//! Offline log inspection.

use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use canary_state::{LogEntry, RoutingState, TransactionLog, fold};

#[derive(Serialize)]
struct Report {
    path: String,
    entries: usize,
    discarded_bytes: u64,
    current: RoutingState,
    digest: String,
    last_version: u64,
    history: Vec<RoutingState>,
    in_doubt: Vec<LogEntry>,
}

/// Replay the log at `path` without modifying it and print the result.
pub fn run_inspect(path: &Path, stable_model: &str, canary_model: &str) -> anyhow::Result<()> {
    let replay =
        TransactionLog::read(path).with_context(|| format!("reading {}", path.display()))?;
    let recovered = fold(&replay.entries, RoutingState::genesis(stable_model, canary_model));

    let report = Report {
        path: path.display().to_string(),
        entries: replay.entries.len(),
        discarded_bytes: replay.discarded_bytes,
        digest: recovered.current.digest(),
        current: recovered.current,
        last_version: recovered.last_version,
        history: recovered.history,
        in_doubt: recovered.in_doubt,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
