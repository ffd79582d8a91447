use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::errors::{LauncherError, Result};
use crate::models::{LauncherConfig, LifecycleEvent, Progress};
use crate::services::dependency_installer::DependencyInstaller;
use crate::services::environment_manager::EnvironmentManager;
use crate::services::network_fetcher::NetworkFetcher;
use crate::services::platform::PlatformCapabilities;
use crate::services::repo_sync::RepoSynchronizer;
use crate::services::runtime_provisioner::RuntimeProvisioner;
use crate::services::self_updater::SelfUpdater;
use crate::utils::paths::LauncherPaths;
use crate::utils::process::hide_console_window;

#[derive(Debug, Clone, Serialize)]
pub struct SetupOutcome {
    pub success: bool,
    pub status: String,
    /// Flags for the config store to persist. Empty unless setup succeeded.
    pub events: Vec<LifecycleEvent>,
    pub interpreter: Option<PathBuf>,
}

impl SetupOutcome {
    fn failed(status: &str) -> Self {
        Self {
            success: false,
            status: status.to_string(),
            events: Vec::new(),
            interpreter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchOutcome {
    pub pid: u32,
    pub interpreter: PathBuf,
    pub events: Vec<LifecycleEvent>,
}

/// Sequences the provisioning services and hands off to the application.
pub struct Orchestrator {
    config: Arc<LauncherConfig>,
    paths: LauncherPaths,
    repo: RepoSynchronizer,
    runtime: RuntimeProvisioner,
    environments: EnvironmentManager,
    dependencies: DependencyInstaller,
    updater: SelfUpdater,
}

impl Orchestrator {
    pub fn new(
        config: Arc<LauncherConfig>,
        paths: LauncherPaths,
        capabilities: Arc<dyn PlatformCapabilities>,
    ) -> Self {
        let advanced = &config.advanced_settings;
        let fetcher = NetworkFetcher::new(
            Duration::from_secs(advanced.download_timeout_secs),
            Duration::from_millis(advanced.probe_timeout_ms),
        );

        let repo = RepoSynchronizer::new(
            config.clone(),
            fetcher.clone(),
            paths.tools_dir.clone(),
            paths.download_dir.clone(),
        );
        let runtime = RuntimeProvisioner::new(
            config.clone(),
            fetcher.clone(),
            capabilities.clone(),
            paths.runtime_dir(&config),
            paths.download_dir.clone(),
            paths.assets_dir(),
            paths.conda_dir(),
        );
        let environments = EnvironmentManager::new(config.clone(), paths.root.clone());
        let dependencies =
            DependencyInstaller::new(config.clone(), capabilities, paths.default_manifest(&config));
        let updater = SelfUpdater::new(
            config.clone(),
            fetcher,
            paths.install_dir(),
            paths.config_dir.clone(),
            paths.download_dir.clone(),
        );

        Self {
            config,
            paths,
            repo,
            runtime,
            environments,
            dependencies,
            updater,
        }
    }

    pub fn repo(&self) -> &RepoSynchronizer {
        &self.repo
    }

    pub fn runtime(&self) -> &RuntimeProvisioner {
        &self.runtime
    }

    pub fn environments(&self) -> &EnvironmentManager {
        &self.environments
    }

    pub fn dependencies(&self) -> &DependencyInstaller {
        &self.dependencies
    }

    pub fn updater(&self) -> &SelfUpdater {
        &self.updater
    }

    pub fn working_copy(&self) -> PathBuf {
        self.paths.working_copy(&self.config)
    }

    /// First detected environment, else the base runtime.
    pub fn resolve_interpreter(&self) -> Option<PathBuf> {
        if let Some(env) = self.environments.detect().into_iter().next() {
            return Some(env.interpreter);
        }
        self.runtime.find().map(|installation| installation.path)
    }

    fn create_environment(&self) -> bool {
        let settings = &self.config.environment_settings;
        if settings.use_conda {
            let conda = self.runtime.discover_conda().or_else(|| {
                tracing::info!("conda requested but not found, installing miniconda");
                self.runtime.install_conda(self.runtime.conda_dir())
            });
            if let Some(conda) = conda {
                return self.environments.create_conda(&settings.conda_env_name, &conda);
            }
            tracing::warn!("conda unavailable, falling back to venv");
        }
        let Some(base) = self.runtime.find() else {
            tracing::error!("no base interpreter to create {} from", settings.venv_name);
            return false;
        };
        self.environments.create(&settings.venv_name, &base.path)
    }

    /// One-time provisioning: repository, runtime, environment, dependencies.
    pub fn run_setup(&self, progress: Progress) -> SetupOutcome {
        progress(0, "starting first-run setup");

        let remote = self.config.github_repo.trim();
        if remote.is_empty() {
            progress(100, "configure the repository address first");
            return SetupOutcome::failed("configure the repository address first");
        }

        if self.repo.tool_version().is_none() {
            progress(5, "git not found, installing");
            if !self.repo.ensure_tool_installed() {
                let status = "git installation failed, install it manually and retry";
                progress(100, status);
                return SetupOutcome::failed(status);
            }
        }

        progress(15, "syncing repository");
        let working_copy = self.working_copy();
        if !self
            .repo
            .ensure_working_copy(remote, &working_copy, self.config.branch.as_deref())
        {
            let status = "repository sync failed, check the network connection and repository address";
            progress(100, status);
            return SetupOutcome::failed(status);
        }

        if !self.runtime.is_installed() {
            progress(25, "python not found, installing");
            let target = self.paths.runtime_dir(&self.config);
            if !self.runtime.install(&self.config.python_version, &target) {
                let status = "python installation failed, install it manually and retry";
                progress(100, status);
                return SetupOutcome::failed(status);
            }
        }

        let existing = self.environments.detect();
        if !existing.is_empty() {
            let names: Vec<&str> = existing.iter().map(|env| env.name.as_str()).collect();
            progress(50, &format!("found existing environments: {}", names.join(", ")));
        } else if self.config.environment_settings.auto_create_venv {
            progress(60, "creating isolated environment");
            if !self.create_environment() {
                let status = "environment creation failed";
                progress(100, status);
                return SetupOutcome::failed(status);
            }
        }

        let Some(interpreter) = self.resolve_interpreter() else {
            let status = "no python interpreter available";
            progress(100, status);
            return SetupOutcome::failed(status);
        };

        progress(70, "installing dependencies");
        if !self.dependencies.install_from_manifest(None, &interpreter) {
            let status = "dependency install failed, see the log";
            progress(100, status);
            return SetupOutcome::failed(status);
        }
        let conflicts = self.dependencies.check_conflicts(&interpreter);
        if !conflicts.is_empty() {
            tracing::warn!("{} package conflicts left in place", conflicts.len());
        }

        progress(90, "setup complete");
        SetupOutcome {
            success: true,
            status: "setup complete".to_string(),
            events: vec![
                LifecycleEvent::EnvironmentConfigured,
                LifecycleEvent::FirstRunCompleted,
                LifecycleEvent::last_run_now(),
            ],
            interpreter: Some(interpreter),
        }
    }

    /// Spawns `<working copy>/<app_entry>` and returns without waiting for it.
    pub fn launch(&self, interpreter: &Path) -> Result<LaunchOutcome> {
        let working_copy = self.working_copy();
        let entry = working_copy.join(&self.config.app_entry);
        if !entry.is_file() {
            return Err(LauncherError::NotFound(entry.display().to_string()));
        }

        let mut cmd = std::process::Command::new(interpreter);
        cmd.arg(&entry)
            .current_dir(&working_copy)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if !self.config.show_console {
            hide_console_window(&mut cmd);
        }

        let child = cmd.spawn().map_err(|err| {
            LauncherError::Process(format!("failed to start {}: {err}", entry.display()))
        })?;
        tracing::info!("started {} (pid {})", entry.display(), child.id());
        Ok(LaunchOutcome {
            pid: child.id(),
            interpreter: interpreter.to_path_buf(),
            events: vec![LifecycleEvent::last_run_now()],
        })
    }

    pub fn start(&self, progress: Progress) -> Result<LaunchOutcome> {
        progress(95, "starting application");
        let Some(interpreter) = self.resolve_interpreter() else {
            progress(100, "no python environment found");
            return Err(LauncherError::NotFound("python interpreter".to_string()));
        };
        match self.launch(&interpreter) {
            Ok(outcome) => {
                progress(100, "application started");
                Ok(outcome)
            }
            Err(err) => {
                progress(100, &format!("failed to start application: {err}"));
                Err(err)
            }
        }
    }

    /// Logs whether a newer launcher is published. Never applies it.
    pub fn startup_update_check(&self) {
        if !self.config.check_updates {
            return;
        }
        if let Some(update) = self.updater.check_for_updates() {
            tracing::info!(
                "launcher {} is available; run the update command to install it",
                update.version
            );
        }
    }

    /// Setup when needed, then launch if configured to. Returns every event to persist.
    pub fn run(&self, progress: Progress) -> (bool, Vec<LifecycleEvent>) {
        self.startup_update_check();

        let mut events = Vec::new();
        if self.config.first_run || !self.config.environment_configured {
            let outcome = self.run_setup(progress);
            if !outcome.success {
                return (false, events);
            }
            events.extend(outcome.events);
            if !self.config.auto_start {
                progress(100, "setup complete, start the application manually");
                return (true, events);
            }
        }

        match self.start(progress) {
            Ok(outcome) => {
                events.extend(outcome.events);
                (true, events)
            }
            Err(err) => {
                tracing::error!("launch failed: {}", err);
                (false, events)
            }
        }
    }
}
