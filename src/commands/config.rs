use std::path::PathBuf;
use std::sync::Arc;

use crate::models::LauncherConfig;
use crate::AppState;

pub async fn show_config(state: Arc<AppState>) -> Result<LauncherConfig, String> {
    tokio::task::spawn_blocking(move || state.config_store.load())
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())
}

/// Problems found in the stored document. Empty means valid.
pub async fn validate_config(state: Arc<AppState>) -> Result<Vec<String>, String> {
    tokio::task::spawn_blocking(move || state.config_store.validate())
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())
}

pub async fn set_config_value(
    state: Arc<AppState>,
    key: String,
    value: String,
) -> Result<LauncherConfig, String> {
    tokio::task::spawn_blocking(move || state.config_store.set(&key, &value))
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())
}

pub async fn reset_config(state: Arc<AppState>) -> Result<LauncherConfig, String> {
    tokio::task::spawn_blocking(move || state.config_store.reset())
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())
}

pub async fn export_config(state: Arc<AppState>, target: PathBuf) -> Result<(), String> {
    tokio::task::spawn_blocking(move || state.config_store.export(&target))
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())
}

pub async fn import_config(state: Arc<AppState>, source: PathBuf) -> Result<LauncherConfig, String> {
    tokio::task::spawn_blocking(move || state.config_store.import(&source))
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())
}

pub async fn backup_config(state: Arc<AppState>) -> Result<PathBuf, String> {
    tokio::task::spawn_blocking(move || state.config_store.backup())
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())
}

pub async fn restore_config(state: Arc<AppState>) -> Result<LauncherConfig, String> {
    tokio::task::spawn_blocking(move || state.config_store.restore())
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())
}
