use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress sink shared by every long-running step: `(percent, status)`.
pub type Progress<'a> = &'a (dyn Fn(u8, &str) + Send + Sync);

pub fn silent_progress(_percent: u8, _status: &str) {}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LauncherConfig {
    pub github_repo: String,
    pub branch: Option<String>,
    pub default_branch: Option<String>,
    /// Groups of repository names that refer to the same project across renames.
    pub repo_aliases: Vec<Vec<String>>,
    /// Hosts that serve a copy of `github.com` under the same owner/repo path.
    pub mirror_hosts: Vec<String>,
    pub python_version: String,
    pub use_pip_update: bool,
    pub use_git_mirror: bool,
    pub use_python_mirror: bool,
    pub check_updates: bool,
    pub auto_start: bool,
    pub show_console: bool,
    pub git_mirror_url: String,
    pub python_mirror_url: String,
    pub pip_mirror_url: String,
    pub launcher_github_repo: String,
    pub working_copy_dir: String,
    pub runtime_dir: String,
    pub app_entry: String,
    pub first_run: bool,
    pub environment_configured: bool,
    pub last_run: Option<String>,
    pub environment_settings: EnvironmentSettings,
    pub advanced_settings: AdvancedSettings,
    pub update_settings: UpdateSettings,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            github_repo: "https://github.com/nikkigallery/Whimbox".to_string(),
            branch: None,
            default_branch: None,
            repo_aliases: Vec::new(),
            mirror_hosts: vec!["github.com.cnpmjs.org".to_string(), "hub.fastgit.xyz".to_string()],
            python_version: "3.12".to_string(),
            use_pip_update: true,
            use_git_mirror: true,
            use_python_mirror: true,
            check_updates: true,
            auto_start: true,
            show_console: false,
            git_mirror_url: "https://gitclone.com/github.com".to_string(),
            python_mirror_url: "https://mirrors.aliyun.com/pypi/simple/".to_string(),
            pip_mirror_url: "https://mirrors.aliyun.com/pypi/simple/".to_string(),
            launcher_github_repo: "https://github.com/nikkigallery/WhimboxLauncher".to_string(),
            working_copy_dir: "app".to_string(),
            runtime_dir: "python".to_string(),
            app_entry: "whimbox.py".to_string(),
            first_run: true,
            environment_configured: false,
            last_run: None,
            environment_settings: EnvironmentSettings::default(),
            advanced_settings: AdvancedSettings::default(),
            update_settings: UpdateSettings::default(),
        }
    }
}

impl LauncherConfig {
    pub fn pip_index(&self) -> Option<&str> {
        if self.use_python_mirror && !self.pip_mirror_url.trim().is_empty() {
            Some(self.pip_mirror_url.trim())
        } else {
            None
        }
    }

    pub fn git_mirror(&self) -> Option<&str> {
        if self.use_git_mirror && !self.git_mirror_url.trim().is_empty() {
            Some(self.git_mirror_url.trim().trim_end_matches('/'))
        } else {
            None
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EnvironmentSettings {
    pub auto_create_venv: bool,
    pub venv_name: String,
    pub use_conda: bool,
    pub conda_env_name: String,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            auto_create_venv: true,
            venv_name: "venv".to_string(),
            use_conda: false,
            conda_env_name: "conda_env".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AdvancedSettings {
    pub probe_timeout_ms: u64,
    pub download_timeout_secs: u64,
    pub clone_timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub max_retries: u32,
    pub log_level: String,
    pub cleanup_temp_files: bool,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 3000,
            download_timeout_secs: 600,
            clone_timeout_secs: 600,
            install_timeout_secs: 300,
            max_retries: 3,
            log_level: "INFO".to_string(),
            cleanup_temp_files: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct UpdateSettings {
    /// Top-level entries a release archive must contain to be applied.
    pub required_files: Vec<String>,
    pub keep_backups: usize,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            required_files: vec![format!(
                "{}{}",
                env!("CARGO_PKG_NAME"),
                std::env::consts::EXE_SUFFIX
            )],
            keep_backups: 3,
        }
    }
}

/// Flags the core asks the config collaborator to persist.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    FirstRunCompleted,
    EnvironmentConfigured,
    LastRun { at: DateTime<Utc> },
}

impl LifecycleEvent {
    pub fn last_run_now() -> Self {
        Self::LastRun { at: Utc::now() }
    }
}
