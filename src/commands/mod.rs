pub mod config;
pub mod dependencies;
pub mod environment;
pub mod provision;
pub mod update;

use std::path::PathBuf;

use crate::AppState;

/// Progress sink for terminal runs. Mirrors every report into the log.
pub fn print_progress(percent: u8, status: &str) {
    println!("[{percent:>3}%] {status}");
    tracing::info!("[{}%] {}", percent, status);
}

/// Interpreter of the named environment, else the orchestrator's default choice.
pub(crate) fn select_interpreter(state: &AppState, environment: Option<&str>) -> Result<PathBuf, String> {
    match environment {
        Some(name) => state
            .orchestrator
            .environments()
            .activate(name)
            .ok_or_else(|| format!("environment {name} not found")),
        None => state
            .orchestrator
            .resolve_interpreter()
            .ok_or_else(|| "no python interpreter found, run setup first".to_string()),
    }
}
