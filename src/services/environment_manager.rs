use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::System;

use crate::models::LauncherConfig;
use crate::services::dependency_installer::list_installed;
use crate::utils::file::{dir_size, remove_dir_with_retry};
use crate::utils::process::{command, probe_version, run_with_timeout};

/// Directory names checked, in order, when looking for an existing environment.
pub const ENVIRONMENT_NAMES: [&str; 6] = ["venv", ".venv", ".conda", "conda_env", "env", ".env"];

const INTERPRETER_PATHS: [&[&str]; 3] = [&["Scripts", "python.exe"], &["bin", "python"], &["python.exe"]];
const CHECK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    Conda,
    Venv,
    Virtualenv,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsolatedEnvironment {
    pub name: String,
    pub path: PathBuf,
    pub interpreter: PathBuf,
    pub kind: EnvironmentKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentDetails {
    #[serde(flatten)]
    pub environment: IsolatedEnvironment,
    pub size_bytes: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub python_version: Option<String>,
    pub package_count: usize,
}

pub fn interpreter_in(env_dir: &Path) -> Option<PathBuf> {
    INTERPRETER_PATHS
        .iter()
        .map(|parts| parts.iter().fold(env_dir.to_path_buf(), |path, part| path.join(part)))
        .find(|path| path.is_file())
}

pub fn kind_of(env_dir: &Path) -> EnvironmentKind {
    if env_dir.join("conda-meta").is_dir() {
        EnvironmentKind::Conda
    } else if env_dir.join("pyvenv.cfg").is_file() {
        EnvironmentKind::Venv
    } else if env_dir.join("Scripts").join("activate.bat").is_file() {
        EnvironmentKind::Virtualenv
    } else {
        EnvironmentKind::Unknown
    }
}

fn valid_name(name: &str) -> bool {
    let name = name.trim();
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
        && !Path::new(name).is_absolute()
}

pub struct EnvironmentManager {
    config: Arc<LauncherConfig>,
    base_dir: PathBuf,
}

impl EnvironmentManager {
    pub fn new(config: Arc<LauncherConfig>, base_dir: PathBuf) -> Self {
        Self { config, base_dir }
    }

    fn environment_at(&self, name: &str) -> Option<IsolatedEnvironment> {
        let path = self.base_dir.join(name);
        if !path.is_dir() {
            return None;
        }
        let interpreter = interpreter_in(&path)?;
        Some(IsolatedEnvironment {
            name: name.to_string(),
            kind: kind_of(&path),
            path,
            interpreter,
        })
    }

    /// Environments found under the base directory in naming-convention order.
    pub fn detect(&self) -> Vec<IsolatedEnvironment> {
        let found: Vec<_> = ENVIRONMENT_NAMES
            .iter()
            .filter_map(|name| self.environment_at(name))
            .collect();
        for env in &found {
            tracing::debug!("found {:?} environment {} at {}", env.kind, env.name, env.path.display());
        }
        found
    }

    pub fn find(&self, name: &str) -> Option<IsolatedEnvironment> {
        if !valid_name(name) {
            return None;
        }
        self.environment_at(name)
    }

    /// Interpreter for `name`. The process environment is left untouched.
    pub fn activate(&self, name: &str) -> Option<PathBuf> {
        let env = self.find(name)?;
        tracing::info!("activated {} ({})", env.name, env.interpreter.display());
        Some(env.interpreter)
    }

    pub fn create(&self, name: &str, base_interpreter: &Path) -> bool {
        let Some(path) = self.creation_target(name) else {
            return false;
        };

        let mut cmd = command(base_interpreter);
        cmd.args(["-m", "venv"]).arg(&path);
        self.run_creation(cmd, name)
    }

    pub fn create_conda(&self, name: &str, conda: &Path) -> bool {
        let Some(path) = self.creation_target(name) else {
            return false;
        };

        let mut cmd = command(conda);
        cmd.args(["create", "-p"])
            .arg(&path)
            .arg(format!("python={}", self.config.python_version))
            .arg("-y");
        self.run_creation(cmd, name)
    }

    fn creation_target(&self, name: &str) -> Option<PathBuf> {
        if !valid_name(name) {
            tracing::error!("refusing to create environment with name {:?}", name);
            return None;
        }
        let path = self.base_dir.join(name.trim());
        if path.exists() {
            tracing::error!("environment directory {} already exists", path.display());
            return None;
        }
        Some(path)
    }

    fn run_creation(&self, mut cmd: std::process::Command, name: &str) -> bool {
        let timeout = Duration::from_secs(self.config.advanced_settings.install_timeout_secs);
        match run_with_timeout(&mut cmd, timeout) {
            Ok(output) if output.success() => {}
            Ok(output) => {
                tracing::error!("creating {} failed: {}", name, output.diagnostic());
                return false;
            }
            Err(err) => {
                tracing::error!("creating {} failed: {}", name, err);
                return false;
            }
        }
        match self.find(name) {
            Some(env) => {
                tracing::info!("created {:?} environment {}", env.kind, env.path.display());
                true
            }
            None => {
                tracing::error!("environment {} has no interpreter after creation", name);
                false
            }
        }
    }

    /// Stops interpreters running out of the environment, then deletes it.
    pub fn remove(&self, name: &str) -> bool {
        let Some(env) = self.find(name) else {
            tracing::warn!("no environment named {} to remove", name);
            return false;
        };

        let stopped = terminate_processes_under(&env.path);
        if stopped > 0 {
            tracing::info!("stopped {} processes running from {}", stopped, env.path.display());
            std::thread::sleep(Duration::from_millis(500));
        }
        let removed = remove_dir_with_retry(&env.path, 3, Duration::from_millis(500));
        if removed {
            tracing::info!("removed environment {}", env.path.display());
        } else {
            tracing::error!("could not remove environment {}", env.path.display());
        }
        removed
    }

    pub fn is_valid(&self, name: &str) -> bool {
        let Some(env) = self.find(name) else {
            return false;
        };
        let mut cmd = command(&env.interpreter);
        cmd.args(["-c", "import sys; print(sys.prefix)"]);
        matches!(run_with_timeout(&mut cmd, CHECK_TIMEOUT), Ok(output) if output.success())
    }

    /// `pip freeze` lines for the environment.
    pub fn freeze(&self, name: &str) -> Option<Vec<String>> {
        let env = self.find(name)?;
        let mut cmd = command(&env.interpreter);
        cmd.args(["-m", "pip", "freeze"]);
        let output = run_with_timeout(&mut cmd, CHECK_TIMEOUT).ok()?;
        if !output.success() {
            tracing::warn!("pip freeze failed in {}: {}", name, output.diagnostic());
            return None;
        }
        Some(
            output
                .stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn describe(&self, name: &str) -> Option<EnvironmentDetails> {
        let environment = self.find(name)?;
        let size_bytes = dir_size(&environment.path).unwrap_or(0);
        let created_at = fs::metadata(&environment.path)
            .ok()
            .and_then(|meta| meta.created().or_else(|_| meta.modified()).ok())
            .map(DateTime::<Utc>::from);
        let python_version = probe_version(environment.interpreter.as_os_str(), CHECK_TIMEOUT);
        let package_count = list_installed(&environment.interpreter, CHECK_TIMEOUT)
            .map(|packages| packages.len())
            .unwrap_or(0);
        Some(EnvironmentDetails {
            environment,
            size_bytes,
            created_at,
            python_version,
            package_count,
        })
    }
}

fn terminate_processes_under(dir: &Path) -> usize {
    let root = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let mut system = System::new_all();
    system.refresh_processes();

    let mut stopped = 0;
    for process in system.processes().values() {
        let inside = process
            .exe()
            .map(|exe| exe.starts_with(&root) || exe.starts_with(dir))
            .unwrap_or(false);
        if !inside {
            continue;
        }
        if process.kill() {
            stopped += 1;
        } else {
            tracing::warn!("failed to stop pid {}", process.pid());
        }
    }
    stopped
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_root() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bootstrap-envs-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create env root");
        dir
    }

    fn fake_env(root: &Path, name: &str, interpreter: &[&str], marker: Option<&str>) {
        let env = root.join(name);
        let exe = interpreter.iter().fold(env.clone(), |path, part| path.join(part));
        fs::create_dir_all(exe.parent().expect("interpreter parent")).expect("create env dirs");
        fs::write(&exe, b"").expect("write fake interpreter");
        match marker {
            Some("conda-meta") => fs::create_dir_all(env.join("conda-meta")).expect("create conda-meta"),
            Some(file) => fs::write(env.join(file), b"").expect("write marker"),
            None => {}
        }
    }

    fn manager(root: &Path) -> EnvironmentManager {
        EnvironmentManager::new(Arc::new(LauncherConfig::default()), root.to_path_buf())
    }

    #[test]
    fn detects_environments_in_convention_order() {
        let root = temp_root();
        fake_env(&root, ".conda", &["python.exe"], Some("conda-meta"));
        fake_env(&root, "venv", &["bin", "python"], Some("pyvenv.cfg"));
        fake_env(&root, "env", &["Scripts", "python.exe"], Some("Scripts/activate.bat"));
        fs::create_dir_all(root.join(".venv")).expect("create interpreter-less dir");

        let found = manager(&root).detect();
        let summary: Vec<_> = found.iter().map(|env| (env.name.as_str(), env.kind)).collect();
        assert_eq!(
            summary,
            vec![
                ("venv", EnvironmentKind::Venv),
                (".conda", EnvironmentKind::Conda),
                ("env", EnvironmentKind::Virtualenv),
            ]
        );
        assert_eq!(found[0].interpreter, root.join("venv").join("bin").join("python"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn activation_returns_interpreter_without_touching_process_env() {
        let root = temp_root();
        fake_env(&root, "venv", &["bin", "python"], None);
        let before = std::env::var_os("VIRTUAL_ENV");

        let interpreter = manager(&root).activate("venv").expect("activate venv");
        assert_eq!(interpreter, root.join("venv").join("bin").join("python"));
        assert_eq!(std::env::var_os("VIRTUAL_ENV"), before);
        assert_eq!(manager(&root).activate("missing"), None);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn creation_rejects_existing_directories_and_unsafe_names() {
        let root = temp_root();
        fs::create_dir_all(root.join("venv")).expect("create occupied dir");
        let manager = manager(&root);
        let python = Path::new("python3");

        assert!(!manager.create("venv", python));
        assert!(!manager.create("../escape", python));
        assert!(!manager.create("nested/env", python));
        assert!(!manager.create("", python));
        assert!(!root.parent().expect("parent").join("escape").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn remove_deletes_environment_directory() {
        let root = temp_root();
        fake_env(&root, "venv", &["bin", "python"], Some("pyvenv.cfg"));
        let manager = manager(&root);

        assert!(manager.remove("venv"));
        assert!(!root.join("venv").exists());
        assert!(!manager.remove("venv"));
        let _ = fs::remove_dir_all(root);
    }
}
