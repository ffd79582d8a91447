use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::commands::print_progress;
use crate::models::Progress;
use crate::services::{HistoryEntry, UpdateInfo, UpdateOutcome};
use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
pub struct UpdateCheck {
    pub current_version: String,
    pub update: Option<UpdateInfo>,
}

pub async fn check_update(state: Arc<AppState>) -> Result<UpdateCheck, String> {
    tokio::task::spawn_blocking(move || {
        let updater = state.orchestrator.updater();
        UpdateCheck {
            current_version: updater.current_version(),
            update: updater.check_for_updates(),
        }
    })
    .await
    .map_err(|err| err.to_string())
}

pub async fn perform_update(state: Arc<AppState>) -> Result<UpdateOutcome, String> {
    tokio::task::spawn_blocking(move || {
        let progress: Progress = &print_progress;
        state.orchestrator.updater().update(Some(progress))
    })
    .await
    .map_err(|err| err.to_string())
}

/// Applies a package already on disk instead of downloading the latest release.
pub async fn apply_local_package(
    state: Arc<AppState>,
    archive: PathBuf,
    version: String,
) -> Result<(), String> {
    tokio::task::spawn_blocking(move || {
        state
            .orchestrator
            .updater()
            .apply_package(&archive, &version, &print_progress)
    })
    .await
    .map_err(|err| err.to_string())?
    .map_err(|err| err.to_string())
}

pub async fn rollback_update(state: Arc<AppState>) -> Result<bool, String> {
    tokio::task::spawn_blocking(move || state.orchestrator.updater().rollback())
        .await
        .map_err(|err| err.to_string())
}

pub async fn update_history(state: Arc<AppState>) -> Result<Vec<HistoryEntry>, String> {
    tokio::task::spawn_blocking(move || state.orchestrator.updater().history())
        .await
        .map_err(|err| err.to_string())
}

pub async fn cleanup_backups(state: Arc<AppState>, keep: Option<usize>) -> Result<usize, String> {
    tokio::task::spawn_blocking(move || {
        let keep = keep.unwrap_or(state.config.update_settings.keep_backups);
        state.orchestrator.updater().cleanup_old_backups(keep)
    })
    .await
    .map_err(|err| err.to_string())
}
