//! State file commands.

use super::{format_timestamp, CliError, CliResult};
use rlsync_engine::{
    PersistentRepositoryStateProvider, RepositoryStateProvider, StagedWrites, StateValue,
    HIGH_WATER_MARK, OFFSET_SINCE,
};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

fn open_existing(path: &Path) -> CliResult<PersistentRepositoryStateProvider> {
    if !path.exists() {
        return Err(CliError::MissingState(path.to_path_buf()));
    }
    Ok(PersistentRepositoryStateProvider::open(path)?)
}

fn is_timestamp_key(key: &str) -> bool {
    key == HIGH_WATER_MARK || key == OFFSET_SINCE || key.starts_with("lastModified.")
}

/// Prints every committed entry of the state file at `path`.
pub fn show(path: &Path, format: &str) -> CliResult<()> {
    let snapshot = open_existing(path)?.snapshot();
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        _ => print_text_output(path, &snapshot),
    }
    Ok(())
}

fn print_text_output(path: &Path, snapshot: &BTreeMap<String, StateValue>) {
    println!("State file: {}", path.display());
    if snapshot.is_empty() {
        println!("  (empty)");
        return;
    }
    for (key, value) in snapshot {
        match value {
            StateValue::Long(ms) if is_timestamp_key(key) => {
                println!("  {:<24} {} ({})", key, ms, format_timestamp(*ms))
            }
            _ => println!("  {:<24} {}", key, value),
        }
    }
}

/// Clears the resume keys, or every entry with `all`. Returns the number of
/// entries removed.
pub fn reset(path: &Path, all: bool) -> CliResult<usize> {
    let state = open_existing(path)?;
    let before = state.snapshot();
    if all {
        let writes = before
            .keys()
            .fold(StagedWrites::new(), |writes, key| writes.clear(key.as_str()));
        state.commit(writes)?;
    } else {
        state.reset_and_commit()?;
    }
    let cleared = before.len() - state.snapshot().len();
    info!(path = %path.display(), cleared, all, "state reset");
    Ok(cleared)
}
