use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::errors::Result;
use crate::models::LauncherConfig;
use crate::services::network_fetcher::NetworkFetcher;
use crate::services::platform::PlatformCapabilities;
use crate::utils::file::extract_zip;
use crate::utils::process::{command, probe_version, run_checked, run_with_timeout};

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const GET_PIP_TIMEOUT: Duration = Duration::from_secs(120);
const GET_PIP_URL: &str = "https://bootstrap.pypa.io/get-pip.py";
const CONDA_INSTALL_TIMEOUT: Duration = Duration::from_secs(600);
const CONDA_INSTALLER: &str = "Miniconda3-latest-Windows-x86_64.exe";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeLineage {
    System,
    Embedded,
    Registry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeInstallation {
    pub path: PathBuf,
    pub version: String,
    pub lineage: RuntimeLineage,
}

/// Maps `3.12` style requests onto a patch release that ships an embeddable build.
pub fn resolve_patch_version(requested: &str) -> String {
    let requested = requested.trim();
    let known = match requested {
        "3.8" => "3.8.10",
        "3.9" => "3.9.13",
        "3.10" => "3.10.11",
        "3.11" => "3.11.9",
        "3.12" => "3.12.8",
        "3.13" => "3.13.1",
        other if other.split('.').count() >= 3 => return other.to_string(),
        other => return format!("{other}.0"),
    };
    known.to_string()
}

/// Makes an embeddable `._pth` file load `site` and see the `Scripts` directory.
pub fn wire_path_config(content: &str) -> String {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let mut has_site = false;
    for line in lines.iter_mut() {
        let trimmed = line.trim();
        if trimmed == "import site" {
            has_site = true;
        } else if trimmed.trim_start_matches('#').trim() == "import site" {
            *line = "import site".to_string();
            has_site = true;
        }
    }
    if !lines.iter().any(|line| line.trim() == "Scripts") {
        let position = lines
            .iter()
            .position(|line| line.trim() == "import site")
            .unwrap_or(lines.len());
        lines.insert(position, "Scripts".to_string());
    }
    if !has_site {
        lines.push("import site".to_string());
    }
    let mut wired = lines.join("\n");
    wired.push('\n');
    wired
}

fn version_from_banner(banner: &str) -> String {
    banner
        .trim()
        .strip_prefix("Python ")
        .unwrap_or(banner.trim())
        .to_string()
}

/// Official installer first unless the mirror is preferred.
pub fn conda_installer_candidates(use_mirror: bool) -> Vec<String> {
    let official = format!("https://repo.anaconda.com/miniconda/{CONDA_INSTALLER}");
    let mirror = format!("https://mirrors.tuna.tsinghua.edu.cn/anaconda/miniconda/{CONDA_INSTALLER}");
    if use_mirror {
        vec![mirror, official]
    } else {
        vec![official, mirror]
    }
}

/// Silent NSIS install; `/D=` must be last and unquoted.
pub fn conda_installer_args(target: &Path) -> Vec<String> {
    vec!["/S".to_string(), format!("/D={}", target.display())]
}

/// Executables a conda distribution places under its root.
pub fn conda_executables_in(dir: &Path) -> [PathBuf; 2] {
    [
        dir.join("Scripts").join("conda.exe"),
        dir.join("bin").join("conda"),
    ]
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}

pub struct RuntimeProvisioner {
    config: Arc<LauncherConfig>,
    fetcher: NetworkFetcher,
    capabilities: Arc<dyn PlatformCapabilities>,
    runtime_dir: PathBuf,
    download_dir: PathBuf,
    assets_dir: PathBuf,
    conda_dir: PathBuf,
}

impl RuntimeProvisioner {
    pub fn new(
        config: Arc<LauncherConfig>,
        fetcher: NetworkFetcher,
        capabilities: Arc<dyn PlatformCapabilities>,
        runtime_dir: PathBuf,
        download_dir: PathBuf,
        assets_dir: PathBuf,
        conda_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            fetcher,
            capabilities,
            runtime_dir,
            download_dir,
            assets_dir,
            conda_dir,
        }
    }

    pub fn local_interpreter(&self) -> PathBuf {
        local_interpreter_in(&self.runtime_dir)
    }

    fn conventional_locations(&self) -> Vec<PathBuf> {
        let compact = self.config.python_version.replace('.', "");
        let mut paths = Vec::new();
        if cfg!(target_os = "windows") {
            paths.push(PathBuf::from(format!(r"C:\Python{compact}\python.exe")));
            paths.push(PathBuf::from(format!(r"C:\Program Files\Python{compact}\python.exe")));
            if let Some(local) = std::env::var_os("LOCALAPPDATA") {
                paths.push(
                    PathBuf::from(local)
                        .join("Programs")
                        .join("Python")
                        .join(format!("Python{compact}"))
                        .join("python.exe"),
                );
            }
        } else {
            let versioned = format!("python{}", self.config.python_version);
            for dir in ["/usr/bin", "/usr/local/bin", "/opt/homebrew/bin"] {
                paths.push(Path::new(dir).join(&versioned));
                paths.push(Path::new(dir).join("python3"));
            }
        }
        paths
    }

    fn probe(&self, path: &Path, lineage: RuntimeLineage) -> Option<RuntimeInstallation> {
        let banner = probe_version(path.as_os_str(), VERSION_TIMEOUT)?;
        Some(RuntimeInstallation {
            path: path.to_path_buf(),
            version: version_from_banner(&banner),
            lineage,
        })
    }

    /// Every responsive interpreter, local install first, registry last.
    pub fn discover(&self) -> Vec<RuntimeInstallation> {
        let mut candidates: Vec<(PathBuf, RuntimeLineage)> = Vec::new();
        candidates.push((self.local_interpreter(), RuntimeLineage::Embedded));
        for path in self.conventional_locations() {
            candidates.push((path, RuntimeLineage::System));
        }
        for name in ["python3", "python"] {
            candidates.push((PathBuf::from(name), RuntimeLineage::System));
        }
        for path in self.capabilities.discover_runtime() {
            candidates.push((path, RuntimeLineage::Registry));
        }

        let mut found: Vec<RuntimeInstallation> = Vec::new();
        for (path, lineage) in candidates {
            if path.is_absolute() && !path.exists() {
                continue;
            }
            if found.iter().any(|known| known.path == path) {
                continue;
            }
            if let Some(installation) = self.probe(&path, lineage) {
                tracing::debug!("found python {} at {}", installation.version, path.display());
                found.push(installation);
            }
        }
        found
    }

    pub fn find(&self) -> Option<RuntimeInstallation> {
        let local = self.local_interpreter();
        if local.exists() {
            if let Some(installation) = self.probe(&local, RuntimeLineage::Embedded) {
                return Some(installation);
            }
        }
        self.discover().into_iter().next()
    }

    pub fn is_installed(&self) -> bool {
        self.find().is_some()
    }

    fn download_candidates(&self, full_version: &str) -> Vec<String> {
        let file_name = format!("python-{full_version}-embed-amd64.zip");
        let official = format!("https://www.python.org/ftp/python/{full_version}/{file_name}");
        let mirror = format!("https://registry.npmmirror.com/-/binary/python/{full_version}/{file_name}");
        if self.config.use_python_mirror {
            vec![mirror, official]
        } else {
            vec![official, mirror]
        }
    }

    /// Downloads and wires the embeddable runtime into `target`.
    pub fn install(&self, version: &str, target: &Path) -> bool {
        if !cfg!(target_os = "windows") {
            tracing::error!(
                "the embeddable python {} build only exists for Windows; install it with the system package manager",
                version
            );
            return false;
        }

        let full_version = resolve_patch_version(version);
        let probe_timeout = Duration::from_millis(self.config.advanced_settings.probe_timeout_ms);
        let candidates = self
            .fetcher
            .rank_candidates(&self.download_candidates(&full_version), probe_timeout);
        let archive = self
            .download_dir
            .join(format!("python-{full_version}-embed-amd64.zip"));

        if !candidates
            .iter()
            .any(|url| self.fetcher.fetch(url, &archive, None))
        {
            tracing::error!("python {} could not be downloaded", full_version);
            return false;
        }

        if let Err(err) = self.unpack(&archive, target) {
            tracing::error!("python {} could not be unpacked: {}", full_version, err);
            return false;
        }
        if self.config.advanced_settings.cleanup_temp_files {
            let _ = fs::remove_file(&archive);
        }

        let interpreter = local_interpreter_in(target);
        if !self.bootstrap_pip(&interpreter) {
            tracing::warn!("pip is not available in {}", target.display());
        }

        match probe_version(interpreter.as_os_str(), VERSION_TIMEOUT) {
            Some(banner) => {
                tracing::info!("installed {} at {}", banner, target.display());
                true
            }
            None => {
                tracing::error!("interpreter missing after install: {}", interpreter.display());
                false
            }
        }
    }

    fn unpack(&self, archive: &Path, target: &Path) -> Result<()> {
        let files = extract_zip(archive, target)?;
        tracing::info!("extracted {} files into {}", files, target.display());
        let wired = configure_path_files(target)?;
        tracing::debug!("rewired {} path configuration files", wired);
        fs::create_dir_all(target.join("Scripts"))?;
        Ok(())
    }

    pub fn pip_available(&self, interpreter: &Path) -> bool {
        let mut cmd = command(interpreter);
        cmd.args(["-m", "pip", "--version"]);
        matches!(run_with_timeout(&mut cmd, VERSION_TIMEOUT), Ok(output) if output.success())
    }

    /// Tries `ensurepip`, then `get-pip.py` (bundled copy first, then download).
    pub fn bootstrap_pip(&self, interpreter: &Path) -> bool {
        if self.pip_available(interpreter) {
            return true;
        }

        let mut ensurepip = command(interpreter);
        ensurepip.args(["-m", "ensurepip", "--upgrade"]);
        match run_with_timeout(&mut ensurepip, GET_PIP_TIMEOUT) {
            Ok(output) if output.success() && self.pip_available(interpreter) => return true,
            Ok(output) => tracing::info!("ensurepip unavailable: {}", output.diagnostic()),
            Err(err) => tracing::info!("ensurepip failed: {}", err),
        }

        let script = self.download_dir.join("get-pip.py");
        let bundled = self.assets_dir.join("get-pip.py");
        let staged = if bundled.exists() {
            fs::create_dir_all(&self.download_dir).is_ok() && fs::copy(&bundled, &script).is_ok()
        } else {
            self.fetcher.fetch(GET_PIP_URL, &script, None)
        };
        if !staged {
            tracing::error!("get-pip.py is not available");
            return false;
        }

        let mut get_pip = command(interpreter);
        get_pip.arg(&script).arg("--no-warn-script-location");
        if let Some(index) = self.config.pip_index() {
            get_pip.args(["-i", index]);
        }
        let result = run_with_timeout(&mut get_pip, GET_PIP_TIMEOUT);
        let _ = fs::remove_file(&script);
        match result {
            Ok(output) if output.success() => {}
            Ok(output) => tracing::warn!("get-pip.py failed: {}", output.diagnostic()),
            Err(err) => tracing::warn!("get-pip.py failed: {}", err),
        }
        self.pip_available(interpreter)
    }

    pub fn conda_dir(&self) -> &Path {
        &self.conda_dir
    }

    pub fn discover_conda(&self) -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(exe) = std::env::var_os("CONDA_EXE") {
            candidates.push(PathBuf::from(exe));
        }
        candidates.extend(conda_executables_in(&self.conda_dir));
        if let Some(home) = home_dir() {
            for distribution in ["miniconda3", "anaconda3", "Miniconda3", "Anaconda3"] {
                candidates.extend(conda_executables_in(&home.join(distribution)));
            }
        }
        if cfg!(target_os = "windows") {
            candidates.push(PathBuf::from(r"C:\ProgramData\Miniconda3\Scripts\conda.exe"));
            candidates.push(PathBuf::from(r"C:\ProgramData\Anaconda3\Scripts\conda.exe"));
        }
        candidates.push(PathBuf::from("conda"));

        candidates
            .into_iter()
            .filter(|path| !path.is_absolute() || path.exists())
            .find(|path| probe_version(path.as_os_str(), VERSION_TIMEOUT).is_some())
    }

    /// Installs Miniconda silently into `target` and returns the conda executable.
    pub fn install_conda(&self, target: &Path) -> Option<PathBuf> {
        if !cfg!(target_os = "windows") {
            tracing::error!(
                "automatic conda install is only supported on Windows; install Miniconda manually into {}",
                target.display()
            );
            return None;
        }

        let probe_timeout = Duration::from_millis(self.config.advanced_settings.probe_timeout_ms);
        let candidates = self.fetcher.rank_candidates(
            &conda_installer_candidates(self.config.use_python_mirror),
            probe_timeout,
        );
        let installer = self.download_dir.join(CONDA_INSTALLER);
        if !candidates
            .iter()
            .any(|url| self.fetcher.fetch(url, &installer, None))
        {
            tracing::error!("miniconda installer could not be downloaded");
            return None;
        }

        tracing::info!("installing miniconda into {}", target.display());
        let mut cmd = command(&installer);
        cmd.args(conda_installer_args(target));
        let result = run_checked(&mut cmd, CONDA_INSTALL_TIMEOUT, "miniconda installer");
        let _ = fs::remove_file(&installer);
        if let Err(err) = result {
            tracing::error!("conda installation failed: {}", err);
            return None;
        }

        let installed = conda_executables_in(target)
            .into_iter()
            .find(|path| path.exists())
            .or_else(|| self.discover_conda());
        match &installed {
            Some(conda) => tracing::info!("conda ready at {}", conda.display()),
            None => tracing::error!("conda not found after installing into {}", target.display()),
        }
        installed
    }
}

pub fn local_interpreter_in(dir: &Path) -> PathBuf {
    let windows = dir.join("python.exe");
    if windows.exists() || cfg!(target_os = "windows") {
        return windows;
    }
    let unix = dir.join("bin").join("python3");
    if unix.exists() {
        return unix;
    }
    dir.join("bin").join("python")
}

/// Rewrites every `python*._pth` directly under `dir`.
pub fn configure_path_files(dir: &Path) -> Result<usize> {
    let mut rewired = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        if name.starts_with("python") && name.ends_with("._pth") {
            let content = fs::read_to_string(&path)?;
            fs::write(&path, wire_path_config(&content))?;
            rewired += 1;
        }
    }
    Ok(rewired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn maps_short_versions_to_patch_releases() {
        assert_eq!(resolve_patch_version("3.12"), "3.12.8");
        assert_eq!(resolve_patch_version("3.10"), "3.10.11");
        assert_eq!(resolve_patch_version("3.7"), "3.7.0");
        assert_eq!(resolve_patch_version("3.11.4"), "3.11.4");
    }

    #[test]
    fn enables_site_and_scripts_in_embeddable_path_file() {
        let stock = "python312.zip\n.\n\n# Uncomment to run site.main() automatically\n#import site\n";
        let wired = wire_path_config(stock);
        let lines: Vec<&str> = wired.lines().collect();

        assert!(lines.contains(&"import site"));
        assert!(!lines.contains(&"#import site"));
        assert_eq!(lines.iter().filter(|line| **line == "Scripts").count(), 1);
        assert_eq!(wire_path_config(&wired), wired);
    }

    #[test]
    fn appends_site_import_when_missing() {
        let wired = wire_path_config("python311.zip\n.");
        assert_eq!(wired, "python311.zip\n.\nScripts\nimport site\n");
    }

    #[test]
    fn rewrites_only_python_path_files() {
        let dir = std::env::temp_dir().join(format!("bootstrap-pth-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create runtime dir");
        fs::write(dir.join("python312._pth"), "python312.zip\n.\n#import site\n").expect("write pth");
        fs::write(dir.join("notes._pth"), "#import site\n").expect("write unrelated file");

        assert_eq!(configure_path_files(&dir).expect("rewire"), 1);
        let wired = fs::read_to_string(dir.join("python312._pth")).expect("read pth");
        assert!(wired.contains("\nimport site\n"));
        assert_eq!(
            fs::read_to_string(dir.join("notes._pth")).expect("read unrelated"),
            "#import site\n"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn strips_python_prefix_from_version_banner() {
        assert_eq!(version_from_banner("Python 3.12.8\n"), "3.12.8");
    }

    fn provisioner(root: &Path, use_mirror: bool) -> RuntimeProvisioner {
        let mut config = LauncherConfig::default();
        config.use_python_mirror = use_mirror;
        RuntimeProvisioner::new(
            Arc::new(config),
            NetworkFetcher::new(Duration::from_secs(1), Duration::from_millis(100)),
            Arc::new(crate::services::platform::NoCapabilities),
            root.join("python"),
            root.join("downloads"),
            root.join("assets"),
            root.join("conda"),
        )
    }

    #[test]
    fn conda_installer_is_silent_and_targets_the_launcher_dir() {
        let official = conda_installer_candidates(false);
        assert_eq!(
            official[0],
            "https://repo.anaconda.com/miniconda/Miniconda3-latest-Windows-x86_64.exe"
        );
        assert_eq!(conda_installer_candidates(true)[1], official[0]);

        let target = PathBuf::from("launcher").join("conda");
        let args = conda_installer_args(&target);
        assert_eq!(args[0], "/S");
        assert_eq!(args.last().map(String::as_str), Some(format!("/D={}", target.display()).as_str()));
    }

    #[cfg(unix)]
    #[test]
    fn conda_installed_under_the_launcher_is_discovered() {
        use std::os::unix::fs::PermissionsExt;

        let root = std::env::temp_dir().join(format!("bootstrap-conda-{}", Uuid::new_v4()));
        let provisioner = provisioner(&root, false);
        let conda = provisioner.conda_dir().join("bin").join("conda");
        fs::create_dir_all(conda.parent().expect("bin dir")).expect("create conda bin");
        fs::write(&conda, "#!/bin/sh\necho conda 24.1.2\n").expect("write fake conda");
        fs::set_permissions(&conda, fs::Permissions::from_mode(0o755)).expect("chmod conda");

        if std::env::var_os("CONDA_EXE").is_none() {
            assert_eq!(provisioner.discover_conda(), Some(conda));
        }
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn conda_install_is_refused_off_windows() {
        let root = std::env::temp_dir().join(format!("bootstrap-conda-{}", Uuid::new_v4()));
        let provisioner = provisioner(&root, false);
        assert_eq!(provisioner.install_conda(&root.join("conda")), None);
        assert!(!root.join("downloads").exists());
    }
}
