use std::sync::Arc;

use crate::services::{EnvironmentDetails, IsolatedEnvironment, RuntimeInstallation};
use crate::AppState;

pub async fn list_environments(state: Arc<AppState>) -> Result<Vec<IsolatedEnvironment>, String> {
    tokio::task::spawn_blocking(move || state.orchestrator.environments().detect())
        .await
        .map_err(|err| err.to_string())
}

pub async fn describe_environment(state: Arc<AppState>, name: String) -> Result<EnvironmentDetails, String> {
    tokio::task::spawn_blocking(move || state.orchestrator.environments().describe(&name))
        .await
        .map_err(|err| err.to_string())?
        .ok_or_else(|| "environment not found".to_string())
}

pub async fn create_environment(
    state: Arc<AppState>,
    name: Option<String>,
    conda: bool,
) -> Result<IsolatedEnvironment, String> {
    tokio::task::spawn_blocking(move || {
        let settings = &state.config.environment_settings;
        let orchestrator = &state.orchestrator;
        let (name, created) = if conda {
            let name = name.unwrap_or_else(|| settings.conda_env_name.clone());
            let conda = orchestrator
                .runtime()
                .discover_conda()
                .ok_or_else(|| "conda not found".to_string())?;
            let created = orchestrator.environments().create_conda(&name, &conda);
            (name, created)
        } else {
            let name = name.unwrap_or_else(|| settings.venv_name.clone());
            let base = orchestrator
                .runtime()
                .find()
                .ok_or_else(|| "no base python interpreter found".to_string())?;
            let created = orchestrator.environments().create(&name, &base.path);
            (name, created)
        };
        if !created {
            return Err(format!("failed to create environment {name}"));
        }
        orchestrator
            .environments()
            .find(&name)
            .ok_or_else(|| format!("environment {name} has no interpreter"))
    })
    .await
    .map_err(|err| err.to_string())?
}

pub async fn remove_environment(state: Arc<AppState>, name: String) -> Result<bool, String> {
    tokio::task::spawn_blocking(move || state.orchestrator.environments().remove(&name))
        .await
        .map_err(|err| err.to_string())
}

pub async fn freeze_environment(state: Arc<AppState>, name: String) -> Result<Vec<String>, String> {
    tokio::task::spawn_blocking(move || state.orchestrator.environments().freeze(&name))
        .await
        .map_err(|err| err.to_string())?
        .ok_or_else(|| "failed to list installed packages".to_string())
}

pub async fn list_runtimes(state: Arc<AppState>) -> Result<Vec<RuntimeInstallation>, String> {
    tokio::task::spawn_blocking(move || state.orchestrator.runtime().discover())
        .await
        .map_err(|err| err.to_string())
}

pub async fn install_runtime(state: Arc<AppState>, version: Option<String>) -> Result<bool, String> {
    tokio::task::spawn_blocking(move || {
        let version = version.unwrap_or_else(|| state.config.python_version.clone());
        let target = state.paths.runtime_dir(&state.config);
        state.orchestrator.runtime().install(&version, &target)
    })
    .await
    .map_err(|err| err.to_string())
}
