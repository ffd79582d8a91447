use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::utils::process::{command, run_with_timeout};

static CUDA_VERSION: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"CUDA Version:\s*(\d+)\.(\d+)").ok());

static REGISTRY_INSTALL_PATH: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\(Default\)\s+REG_SZ\s+(.+?)\s*$").ok());

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// GPU driver capability reported by the vendor tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Acceleration {
    pub major: u32,
    pub minor: u32,
}

impl std::fmt::Display for Acceleration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// OS facts the provisioning steps consult. Swappable so tests never touch the host.
pub trait PlatformCapabilities: Send + Sync {
    /// Interpreter locations known to the OS (registry on Windows).
    fn discover_runtime(&self) -> Vec<PathBuf>;
    fn discover_acceleration(&self) -> Option<Acceleration>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCapabilities;

impl PlatformCapabilities for SystemCapabilities {
    fn discover_runtime(&self) -> Vec<PathBuf> {
        registry::python_install_paths()
    }

    fn discover_acceleration(&self) -> Option<Acceleration> {
        let mut cmd = command("nvidia-smi");
        let output = match run_with_timeout(&mut cmd, PROBE_TIMEOUT) {
            Ok(output) if output.success() => output,
            Ok(output) => {
                tracing::debug!("nvidia-smi failed: {}", output.diagnostic());
                return None;
            }
            Err(err) => {
                tracing::debug!("nvidia-smi unavailable: {}", err);
                return None;
            }
        };
        let found = parse_cuda_version(&output.stdout);
        if let Some(version) = found {
            tracing::info!("detected CUDA {}", version);
        }
        found
    }
}

/// Reports nothing. Used where host probing is unwanted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapabilities;

impl PlatformCapabilities for NoCapabilities {
    fn discover_runtime(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn discover_acceleration(&self) -> Option<Acceleration> {
        None
    }
}

pub fn parse_cuda_version(text: &str) -> Option<Acceleration> {
    let regex = CUDA_VERSION.as_ref()?;
    let captures = regex.captures(text)?;
    Some(Acceleration {
        major: captures.get(1)?.as_str().parse().ok()?,
        minor: captures.get(2)?.as_str().parse().ok()?,
    })
}

/// Pulls the `(Default)` values out of `reg query` output.
pub fn parse_registry_install_paths(text: &str) -> Vec<PathBuf> {
    let Some(regex) = REGISTRY_INSTALL_PATH.as_ref() else {
        return Vec::new();
    };
    regex
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .map(|value| PathBuf::from(value.as_str()))
        .collect()
}

#[cfg(target_os = "windows")]
mod registry {
    use std::path::PathBuf;

    use super::{parse_registry_install_paths, PROBE_TIMEOUT};
    use crate::utils::process::{command, run_with_timeout};

    const ROOTS: [&str; 3] = [
        r"HKLM\SOFTWARE\Python\PythonCore",
        r"HKLM\SOFTWARE\WOW6432Node\Python\PythonCore",
        r"HKCU\SOFTWARE\Python\PythonCore",
    ];

    pub fn python_install_paths() -> Vec<PathBuf> {
        let mut found = Vec::new();
        for root in ROOTS {
            let mut cmd = command("reg");
            cmd.args(["query", root, "/s", "/f", "InstallPath", "/k"]);
            let keys = match run_with_timeout(&mut cmd, PROBE_TIMEOUT) {
                Ok(output) if output.success() => output.stdout,
                _ => continue,
            };
            for key in keys.lines().map(str::trim).filter(|line| line.ends_with("InstallPath")) {
                let mut cmd = command("reg");
                cmd.args(["query", key, "/ve"]);
                if let Ok(output) = run_with_timeout(&mut cmd, PROBE_TIMEOUT) {
                    for path in parse_registry_install_paths(&output.stdout) {
                        let exe = path.join("python.exe");
                        if exe.exists() && !found.contains(&exe) {
                            found.push(exe);
                        }
                    }
                }
            }
        }
        found
    }
}

#[cfg(not(target_os = "windows"))]
mod registry {
    use std::path::PathBuf;

    pub fn python_install_paths() -> Vec<PathBuf> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_cuda_version_from_nvidia_smi_banner() {
        let banner = "| NVIDIA-SMI 546.33   Driver Version: 546.33   CUDA Version: 12.3     |";
        assert_eq!(
            parse_cuda_version(banner),
            Some(Acceleration { major: 12, minor: 3 })
        );
        assert_eq!(parse_cuda_version("No devices were found"), None);
    }

    #[test]
    fn reads_default_values_from_registry_output() {
        let output = "\r\nHKEY_LOCAL_MACHINE\\SOFTWARE\\Python\\PythonCore\\3.12\\InstallPath\r\n    (Default)    REG_SZ    C:\\Program Files\\Python312\\\r\n\r\n";
        assert_eq!(
            parse_registry_install_paths(output),
            vec![PathBuf::from("C:\\Program Files\\Python312\\")]
        );
    }
}
