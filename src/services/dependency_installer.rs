use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::models::LauncherConfig;
use crate::services::platform::{Acceleration, PlatformCapabilities};
use crate::utils::process::{command, run_with_timeout};

const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const UNINSTALL_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Highest CUDA runtime each torch wheel index targets, newest first.
const TORCH_CUDA_INDEXES: [(u32, u32, &str); 4] = [
    (12, 6, "cu126"),
    (12, 4, "cu124"),
    (12, 1, "cu121"),
    (11, 8, "cu118"),
];

const CONFLICT_RULES: [(&str, &str); 2] = [
    ("tensorflow", "tensorflow-gpu"),
    ("opencv-python", "opencv-contrib-python"),
];

/// One `pip install` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallStep {
    pub packages: Vec<String>,
    /// Replaces the configured mirror for this step only.
    pub index_url: Option<String>,
}

impl InstallStep {
    fn of(packages: Vec<String>) -> Self {
        Self {
            packages,
            index_url: None,
        }
    }
}

type PlanFn = fn(&str, Option<&Acceleration>) -> Vec<InstallStep>;

pub struct SpecialInstaller {
    pub family: &'static str,
    pub plan: PlanFn,
}

pub static SPECIAL_INSTALLERS: &[SpecialInstaller] = &[
    SpecialInstaller { family: "torch", plan: plan_torch },
    SpecialInstaller { family: "tensorflow", plan: plan_tensorflow },
    SpecialInstaller { family: "cuda", plan: plan_cuda },
    SpecialInstaller { family: "cupy", plan: plan_cupy },
    SpecialInstaller { family: "opencv", plan: plan_opencv },
    SpecialInstaller { family: "pygame", plan: plan_generic },
    SpecialInstaller { family: "pandas", plan: plan_pandas },
    SpecialInstaller { family: "numpy", plan: plan_generic },
    SpecialInstaller { family: "scipy", plan: plan_scipy },
    SpecialInstaller { family: "matplotlib", plan: plan_matplotlib },
    SpecialInstaller { family: "scikit-learn", plan: plan_scikit_learn },
    SpecialInstaller { family: "jupyter", plan: plan_jupyter },
    SpecialInstaller { family: "django", plan: plan_django },
    SpecialInstaller { family: "flask", plan: plan_flask },
    SpecialInstaller { family: "fastapi", plan: plan_fastapi },
    SpecialInstaller { family: "streamlit", plan: plan_generic },
];

pub static GENERIC_INSTALLER: SpecialInstaller = SpecialInstaller {
    family: "generic",
    plan: plan_generic,
};

/// First family whose name occurs in the requirement wins.
pub fn installer_for(requirement: &str) -> &'static SpecialInstaller {
    let lowered = requirement.to_ascii_lowercase();
    SPECIAL_INSTALLERS
        .iter()
        .find(|installer| lowered.contains(installer.family))
        .unwrap_or(&GENERIC_INSTALLER)
}

/// Requirement lines with comments and blank lines removed, order kept.
pub fn parse_manifest(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| match line.find(" #") {
            Some(index) => &line[..index],
            None => line,
        })
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Lowercased distribution name without extras, markers or version specifiers.
pub fn requirement_name(requirement: &str) -> String {
    let end = requirement
        .find(|ch: char| "=<>!~[;@ ".contains(ch))
        .unwrap_or(requirement.len());
    normalize_name(&requirement[..end])
}

fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('_', "-")
}

/// Swaps the distribution name of a requirement while keeping its version constraint.
fn renamed(requirement: &str, name: &str) -> String {
    let start = requirement
        .find(|ch: char| "=<>!~;@ ".contains(ch))
        .unwrap_or(requirement.len());
    format!("{name}{}", &requirement[start..])
}

fn plan_generic(requirement: &str, _: Option<&Acceleration>) -> Vec<InstallStep> {
    vec![InstallStep::of(vec![requirement.to_string()])]
}

/// `members` with the requirement's own entry pinned; unrelated requirements get their own step.
fn plan_bundle(requirement: &str, members: &[&str]) -> Vec<InstallStep> {
    let name = requirement_name(requirement);
    let bundle: Vec<String> = members
        .iter()
        .map(|member| {
            if normalize_name(member) == name {
                requirement.to_string()
            } else {
                member.to_string()
            }
        })
        .collect();
    let mut steps = vec![InstallStep::of(bundle)];
    if !members.iter().any(|member| normalize_name(member) == name) {
        steps.extend(plan_generic(requirement, None));
    }
    steps
}

pub fn torch_index_tag(acceleration: Option<&Acceleration>) -> Option<&'static str> {
    let acceleration = acceleration?;
    TORCH_CUDA_INDEXES
        .iter()
        .find(|(major, minor, _)| (acceleration.major, acceleration.minor) >= (*major, *minor))
        .map(|(_, _, tag)| *tag)
}

fn plan_torch(requirement: &str, acceleration: Option<&Acceleration>) -> Vec<InstallStep> {
    let mut steps = plan_bundle(requirement, &["torch", "torchvision", "torchaudio"]);
    if let Some(tag) = torch_index_tag(acceleration) {
        steps[0].index_url = Some(format!("https://download.pytorch.org/whl/{tag}"));
    }
    steps
}

fn plan_tensorflow(requirement: &str, acceleration: Option<&Acceleration>) -> Vec<InstallStep> {
    let accelerated = acceleration.map_or(false, |acc| acc.major >= 11);
    if accelerated && requirement_name(requirement) == "tensorflow" {
        return plan_generic(&renamed(requirement, "tensorflow[and-cuda]"), None);
    }
    plan_generic(requirement, None)
}

fn plan_cuda(requirement: &str, acceleration: Option<&Acceleration>) -> Vec<InstallStep> {
    match acceleration.map(|acc| acc.major) {
        Some(major @ (11 | 12)) => vec![InstallStep::of(vec![
            requirement.to_string(),
            format!("cupy-cuda{major}x"),
            "pynvml".to_string(),
        ])],
        Some(_) => plan_generic(requirement, None),
        None => Vec::new(),
    }
}

fn plan_cupy(requirement: &str, acceleration: Option<&Acceleration>) -> Vec<InstallStep> {
    if requirement_name(requirement) != "cupy" {
        return plan_generic(requirement, None);
    }
    match acceleration {
        Some(acc) => plan_generic(&renamed(requirement, &format!("cupy-cuda{}x", acc.major)), None),
        None => plan_generic(requirement, None),
    }
}

fn plan_opencv(requirement: &str, _: Option<&Acceleration>) -> Vec<InstallStep> {
    if requirement_name(requirement) == "opencv" {
        return plan_generic(&renamed(requirement, "opencv-python"), None);
    }
    plan_generic(requirement, None)
}

fn plan_pandas(requirement: &str, _: Option<&Acceleration>) -> Vec<InstallStep> {
    plan_bundle(requirement, &["pandas", "numpy", "openpyxl", "xlrd"])
}

fn plan_scipy(requirement: &str, _: Option<&Acceleration>) -> Vec<InstallStep> {
    plan_bundle(requirement, &["scipy", "numpy"])
}

fn plan_matplotlib(requirement: &str, _: Option<&Acceleration>) -> Vec<InstallStep> {
    plan_bundle(requirement, &["matplotlib", "numpy", "pillow"])
}

fn plan_scikit_learn(requirement: &str, _: Option<&Acceleration>) -> Vec<InstallStep> {
    plan_bundle(requirement, &["scikit-learn", "numpy", "scipy", "matplotlib"])
}

fn plan_jupyter(requirement: &str, _: Option<&Acceleration>) -> Vec<InstallStep> {
    plan_bundle(requirement, &["jupyter", "jupyterlab", "notebook", "ipykernel"])
}

fn plan_django(requirement: &str, _: Option<&Acceleration>) -> Vec<InstallStep> {
    plan_bundle(requirement, &["django", "djangorestframework", "django-cors-headers"])
}

fn plan_flask(requirement: &str, _: Option<&Acceleration>) -> Vec<InstallStep> {
    plan_bundle(requirement, &["flask", "flask-sqlalchemy", "flask-login", "flask-wtf"])
}

fn plan_fastapi(requirement: &str, _: Option<&Acceleration>) -> Vec<InstallStep> {
    plan_bundle(requirement, &["fastapi", "uvicorn[standard]", "pydantic"])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageConflict {
    pub package: String,
    pub version: String,
    pub conflicts_with: String,
    pub conflict_version: String,
}

/// `pip list --format=json` for `interpreter`.
pub fn list_installed(interpreter: &Path, timeout: Duration) -> Option<Vec<InstalledPackage>> {
    let mut cmd = command(interpreter);
    cmd.args(["-m", "pip", "list", "--format=json", "--disable-pip-version-check"]);
    let output = match run_with_timeout(&mut cmd, timeout) {
        Ok(output) if output.success() => output,
        Ok(output) => {
            tracing::warn!("pip list failed: {}", output.diagnostic());
            return None;
        }
        Err(err) => {
            tracing::warn!("pip list failed: {}", err);
            return None;
        }
    };
    match serde_json::from_str::<Vec<InstalledPackage>>(output.stdout.trim()) {
        Ok(packages) => Some(packages),
        Err(err) => {
            tracing::warn!("unreadable pip list output: {}", err);
            None
        }
    }
}

/// Each known conflicting pair present in `installed`, reported once.
pub fn find_conflicts(installed: &[InstalledPackage]) -> Vec<PackageConflict> {
    let version_of = |name: &str| {
        installed
            .iter()
            .find(|package| normalize_name(&package.name) == name)
            .map(|package| package.version.clone())
    };
    let mut seen = HashSet::new();
    CONFLICT_RULES
        .iter()
        .filter_map(|(package, other)| {
            let version = version_of(package)?;
            let conflict_version = version_of(other)?;
            seen.insert((*package, *other)).then(|| PackageConflict {
                package: package.to_string(),
                version,
                conflicts_with: other.to_string(),
                conflict_version,
            })
        })
        .collect()
}

pub struct DependencyInstaller {
    config: Arc<LauncherConfig>,
    capabilities: Arc<dyn PlatformCapabilities>,
    default_manifest: PathBuf,
    acceleration: OnceCell<Option<Acceleration>>,
}

impl DependencyInstaller {
    pub fn new(
        config: Arc<LauncherConfig>,
        capabilities: Arc<dyn PlatformCapabilities>,
        default_manifest: PathBuf,
    ) -> Self {
        Self {
            config,
            capabilities,
            default_manifest,
            acceleration: OnceCell::new(),
        }
    }

    fn acceleration(&self) -> Option<&Acceleration> {
        self.acceleration
            .get_or_init(|| self.capabilities.discover_acceleration())
            .as_ref()
    }

    pub fn install_from_manifest(&self, manifest: Option<&Path>, interpreter: &Path) -> bool {
        let manifest = manifest.unwrap_or(&self.default_manifest);
        let content = match fs::read_to_string(manifest) {
            Ok(content) => content,
            Err(err) => {
                tracing::error!("cannot read manifest {}: {}", manifest.display(), err);
                return false;
            }
        };

        let requirements = parse_manifest(&content);
        if requirements.is_empty() {
            tracing::info!("{} lists no requirements", manifest.display());
            return true;
        }

        if self.config.use_pip_update && !self.upgrade_pip(interpreter) {
            tracing::warn!("pip upgrade failed, continuing with installs");
        }

        let failed: Vec<&String> = requirements
            .iter()
            .filter(|requirement| !self.install_one(requirement, interpreter))
            .collect();

        tracing::info!(
            "installed {} of {} requirements",
            requirements.len() - failed.len(),
            requirements.len()
        );
        if failed.is_empty() {
            true
        } else {
            let names: Vec<&str> = failed.iter().map(|name| name.as_str()).collect();
            tracing::error!("failed requirements: {}", names.join(", "));
            false
        }
    }

    pub fn install_one(&self, requirement: &str, interpreter: &Path) -> bool {
        let installer = installer_for(requirement);
        let steps = (installer.plan)(requirement, self.acceleration());
        if installer.family != GENERIC_INSTALLER.family {
            tracing::info!("{} handled by the {} installer", requirement, installer.family);
        }
        if steps.is_empty() {
            tracing::info!("nothing to install for {} on this machine", requirement);
            return true;
        }
        steps.iter().all(|step| self.run_step(step, interpreter))
    }

    fn run_step(&self, step: &InstallStep, interpreter: &Path) -> bool {
        let advanced = &self.config.advanced_settings;
        let attempts = advanced.max_retries.max(1);
        let timeout = Duration::from_secs(advanced.install_timeout_secs);
        let label = step.packages.join(" ");

        for attempt in 1..=attempts {
            let mut cmd = command(interpreter);
            cmd.args(["-m", "pip", "install", "--disable-pip-version-check"])
                .args(&step.packages);
            match (&step.index_url, self.config.pip_index()) {
                (Some(index), _) => {
                    cmd.args(["--index-url", index.as_str()]);
                }
                (None, Some(mirror)) => {
                    cmd.args(["-i", mirror]);
                }
                (None, None) => {}
            }

            match run_with_timeout(&mut cmd, timeout) {
                Ok(output) if output.success() => {
                    tracing::info!("installed {}", label);
                    return true;
                }
                Ok(output) => tracing::warn!(
                    "installing {} failed (attempt {}/{}): {}",
                    label,
                    attempt,
                    attempts,
                    output.diagnostic()
                ),
                Err(err) => tracing::warn!(
                    "installing {} failed (attempt {}/{}): {}",
                    label,
                    attempt,
                    attempts,
                    err
                ),
            }
            if attempt < attempts {
                std::thread::sleep(RETRY_BACKOFF);
            }
        }
        false
    }

    pub fn upgrade_pip(&self, interpreter: &Path) -> bool {
        let mut cmd = command(interpreter);
        cmd.args(["-m", "pip", "install", "--upgrade", "pip"]);
        if let Some(mirror) = self.config.pip_index() {
            cmd.args(["-i", mirror]);
        }
        let timeout = Duration::from_secs(self.config.advanced_settings.install_timeout_secs);
        match run_with_timeout(&mut cmd, timeout) {
            Ok(output) if output.success() => true,
            Ok(output) => {
                tracing::warn!("pip upgrade failed: {}", output.diagnostic());
                false
            }
            Err(err) => {
                tracing::warn!("pip upgrade failed: {}", err);
                false
            }
        }
    }

    pub fn installed_packages(&self, interpreter: &Path) -> Option<Vec<InstalledPackage>> {
        list_installed(interpreter, LIST_TIMEOUT)
    }

    pub fn check_conflicts(&self, interpreter: &Path) -> Vec<PackageConflict> {
        let conflicts = self
            .installed_packages(interpreter)
            .map(|installed| find_conflicts(&installed))
            .unwrap_or_default();
        for conflict in &conflicts {
            tracing::warn!(
                "{} {} conflicts with {} {}",
                conflict.package,
                conflict.version,
                conflict.conflicts_with,
                conflict.conflict_version
            );
        }
        conflicts
    }

    /// Uninstalls the second package of every conflicting pair.
    pub fn resolve_conflicts(&self, conflicts: &[PackageConflict], interpreter: &Path) -> bool {
        let mut resolved = true;
        for conflict in conflicts {
            let mut cmd = command(interpreter);
            cmd.args(["-m", "pip", "uninstall", "-y", conflict.conflicts_with.as_str()]);
            match run_with_timeout(&mut cmd, UNINSTALL_TIMEOUT) {
                Ok(output) if output.success() => {
                    tracing::info!("uninstalled {}", conflict.conflicts_with)
                }
                Ok(output) => {
                    tracing::error!(
                        "uninstalling {} failed: {}",
                        conflict.conflicts_with,
                        output.diagnostic()
                    );
                    resolved = false;
                }
                Err(err) => {
                    tracing::error!("uninstalling {} failed: {}", conflict.conflicts_with, err);
                    resolved = false;
                }
            }
        }
        resolved
    }
}
