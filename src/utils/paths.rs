use std::path::{Path, PathBuf};

use crate::models::LauncherConfig;

pub const PORTABLE_MARKER: &str = "portable.config.json";

fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

fn is_portable_root(path: &Path) -> bool {
    path.join(PORTABLE_MARKER).exists()
}

fn env_dir(key: &str) -> Option<PathBuf> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    ensure_dir(Path::new(trimmed))
}

fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

/// Root that every relative launcher path hangs off.
pub fn resolve_root_dir() -> PathBuf {
    if let Some(dir) = env_dir("BOOTSTRAP_ROOT_DIR") {
        return dir;
    }

    if let Some(dir) = exe_dir() {
        if is_portable_root(&dir) {
            return dir;
        }
    }

    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub fn resolve_log_dir(root: &Path) -> PathBuf {
    if let Some(dir) = env_dir("BOOTSTRAP_LOG_DIR") {
        return dir;
    }

    let root_logs = root.join("logs");
    if let Some(found) = ensure_dir(&root_logs) {
        return found;
    }

    if let Some(dir) = exe_dir() {
        if let Some(found) = ensure_dir(&dir.join("logs")) {
            return found;
        }
    }

    PathBuf::from("logs")
}

/// Every on-disk location the launcher touches, resolved once per process.
#[derive(Clone, Debug)]
pub struct LauncherPaths {
    pub root: PathBuf,
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
    pub download_dir: PathBuf,
    pub tools_dir: PathBuf,
}

impl LauncherPaths {
    pub fn resolve() -> Self {
        Self::with_root(resolve_root_dir())
    }

    pub fn with_root(root: PathBuf) -> Self {
        let config_dir = root.join("config");
        let log_dir = resolve_log_dir(&root);
        Self {
            download_dir: root.join("downloads"),
            tools_dir: root.join("tools"),
            config_dir,
            log_dir,
            root,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("launcher_config.json")
    }

    pub fn working_copy(&self, config: &LauncherConfig) -> PathBuf {
        self.root.join(&config.working_copy_dir)
    }

    pub fn runtime_dir(&self, config: &LauncherConfig) -> PathBuf {
        self.root.join(&config.runtime_dir)
    }

    pub fn default_manifest(&self, config: &LauncherConfig) -> PathBuf {
        self.working_copy(config).join("requirements.txt")
    }

    /// Miniconda installed by the launcher when none is found.
    pub fn conda_dir(&self) -> PathBuf {
        self.root.join("conda")
    }

    /// Files shipped next to the launcher, such as a bundled `get-pip.py`.
    pub fn assets_dir(&self) -> PathBuf {
        self.root.join("assets")
    }

    /// Directory the running launcher was installed into; updates are applied here.
    pub fn install_dir(&self) -> PathBuf {
        exe_dir().unwrap_or_else(|| self.root.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_layout_from_root() {
        let root = std::env::temp_dir().join(format!("bootstrap-paths-test-{}", uuid::Uuid::new_v4()));
        let paths = LauncherPaths::with_root(root.clone());
        let config = LauncherConfig::default();

        assert_eq!(paths.config_file(), root.join("config").join("launcher_config.json"));
        assert_eq!(paths.working_copy(&config), root.join("app"));
        assert_eq!(paths.runtime_dir(&config), root.join("python"));
        assert_eq!(
            paths.default_manifest(&config),
            root.join("app").join("requirements.txt")
        );
        assert_eq!(paths.conda_dir(), root.join("conda"));
        let _ = std::fs::remove_dir_all(root);
    }
}
