use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::commands::select_interpreter;
use crate::services::{InstalledPackage, PackageConflict};
use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ConflictReport {
    pub conflicts: Vec<PackageConflict>,
    pub resolved: Option<bool>,
}

pub async fn install_dependencies(
    state: Arc<AppState>,
    manifest: Option<PathBuf>,
    environment: Option<String>,
) -> Result<bool, String> {
    tokio::task::spawn_blocking(move || {
        let interpreter = select_interpreter(&state, environment.as_deref())?;
        Ok(state
            .orchestrator
            .dependencies()
            .install_from_manifest(manifest.as_deref(), &interpreter))
    })
    .await
    .map_err(|err| err.to_string())?
}

pub async fn install_package(
    state: Arc<AppState>,
    requirement: String,
    environment: Option<String>,
) -> Result<bool, String> {
    tokio::task::spawn_blocking(move || {
        let interpreter = select_interpreter(&state, environment.as_deref())?;
        Ok(state
            .orchestrator
            .dependencies()
            .install_one(&requirement, &interpreter))
    })
    .await
    .map_err(|err| err.to_string())?
}

pub async fn upgrade_pip(state: Arc<AppState>, environment: Option<String>) -> Result<bool, String> {
    tokio::task::spawn_blocking(move || {
        let interpreter = select_interpreter(&state, environment.as_deref())?;
        let runtime = state.orchestrator.runtime();
        if !runtime.bootstrap_pip(&interpreter) {
            return Ok(false);
        }
        Ok(state.orchestrator.dependencies().upgrade_pip(&interpreter))
    })
    .await
    .map_err(|err| err.to_string())?
}

pub async fn list_packages(
    state: Arc<AppState>,
    environment: Option<String>,
) -> Result<Vec<InstalledPackage>, String> {
    tokio::task::spawn_blocking(move || {
        let interpreter = select_interpreter(&state, environment.as_deref())?;
        state
            .orchestrator
            .dependencies()
            .installed_packages(&interpreter)
            .ok_or_else(|| "failed to list installed packages".to_string())
    })
    .await
    .map_err(|err| err.to_string())?
}

pub async fn check_conflicts(
    state: Arc<AppState>,
    environment: Option<String>,
    fix: bool,
) -> Result<ConflictReport, String> {
    tokio::task::spawn_blocking(move || {
        let interpreter = select_interpreter(&state, environment.as_deref())?;
        let dependencies = state.orchestrator.dependencies();
        let conflicts = dependencies.check_conflicts(&interpreter);
        let resolved = (fix && !conflicts.is_empty())
            .then(|| dependencies.resolve_conflicts(&conflicts, &interpreter));
        Ok(ConflictReport { conflicts, resolved })
    })
    .await
    .map_err(|err| err.to_string())?
}
