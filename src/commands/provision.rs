use std::sync::Arc;

use serde::Serialize;

use crate::commands::print_progress;
use crate::models::LifecycleEvent;
use crate::services::{LaunchOutcome, SetupOutcome, WorkingCopyState};
use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
pub struct RepoStatus {
    pub remote: String,
    pub path: String,
    pub state: WorkingCopyState,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub tool_version: Option<String>,
}

fn persist(state: &AppState, events: &[LifecycleEvent]) -> Result<(), String> {
    if events.is_empty() {
        return Ok(());
    }
    state
        .config_store
        .apply(events)
        .map(|_| ())
        .map_err(|err| err.to_string())
}

/// Full launcher flow: setup on first run, then hand off to the application.
pub async fn run_launcher(state: Arc<AppState>) -> Result<bool, String> {
    let worker = state.clone();
    let (success, events) = tokio::task::spawn_blocking(move || worker.orchestrator.run(&print_progress))
        .await
        .map_err(|err| err.to_string())?;
    persist(&state, &events)?;
    Ok(success)
}

pub async fn run_setup(state: Arc<AppState>) -> Result<SetupOutcome, String> {
    let worker = state.clone();
    let outcome = tokio::task::spawn_blocking(move || worker.orchestrator.run_setup(&print_progress))
        .await
        .map_err(|err| err.to_string())?;
    persist(&state, &outcome.events)?;
    Ok(outcome)
}

pub async fn launch_app(state: Arc<AppState>) -> Result<LaunchOutcome, String> {
    let worker = state.clone();
    let outcome = tokio::task::spawn_blocking(move || worker.orchestrator.start(&print_progress))
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())?;
    persist(&state, &outcome.events)?;
    Ok(outcome)
}

pub async fn sync_repository(state: Arc<AppState>, branch: Option<String>) -> Result<RepoStatus, String> {
    tokio::task::spawn_blocking(move || {
        let remote = state.config.github_repo.clone();
        let target = state.orchestrator.working_copy();
        let branch = branch.or_else(|| state.config.branch.clone());
        let repo = state.orchestrator.repo();
        if !repo.ensure_tool_installed() {
            return Err("git is not available".to_string());
        }
        if !repo.ensure_working_copy(&remote, &target, branch.as_deref()) {
            return Err(format!("failed to sync {remote}"));
        }
        Ok(describe_repo(&state))
    })
    .await
    .map_err(|err| err.to_string())?
}

pub async fn repo_status(state: Arc<AppState>) -> Result<RepoStatus, String> {
    tokio::task::spawn_blocking(move || describe_repo(&state))
        .await
        .map_err(|err| err.to_string())
}

fn describe_repo(state: &AppState) -> RepoStatus {
    let repo = state.orchestrator.repo();
    let target = state.orchestrator.working_copy();
    let remote = state.config.github_repo.clone();
    RepoStatus {
        state: repo.inspect(&remote, &target),
        branch: repo.current_branch(&target),
        commit: repo.head_commit(&target),
        tool_version: repo.tool_version(),
        path: target.display().to_string(),
        remote,
    }
}
