use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::errors::{LauncherError, Result};
use crate::models::{LauncherConfig, LifecycleEvent};
use crate::utils::file::write_atomic;

const REQUIRED_KEYS: [&str; 6] = [
    "github_repo",
    "python_version",
    "use_pip_update",
    "use_git_mirror",
    "use_python_mirror",
    "check_updates",
];

const URL_KEYS: [&str; 3] = ["git_mirror_url", "python_mirror_url", "pip_mirror_url"];

fn valid_python_version(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    (2..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit()))
}

/// Problems with a raw configuration document. Empty means valid.
pub fn validate_document(document: &Value) -> Vec<String> {
    let Some(object) = document.as_object() else {
        return vec!["configuration must be a JSON object".to_string()];
    };

    let mut problems: Vec<String> = REQUIRED_KEYS
        .iter()
        .filter(|key| !object.contains_key(**key))
        .map(|key| format!("missing required key {key}"))
        .collect();

    if let Some(version) = object.get("python_version") {
        if !version.as_str().map_or(false, valid_python_version) {
            problems.push(format!("invalid python_version {version}"));
        }
    }

    for key in URL_KEYS {
        if let Some(url) = object.get(key).and_then(Value::as_str) {
            if !url.is_empty() && !url.starts_with("http://") && !url.starts_with("https://") {
                problems.push(format!("{key} must be an http(s) URL"));
            }
        }
    }
    problems
}

pub fn apply_events(config: &mut LauncherConfig, events: &[LifecycleEvent]) {
    for event in events {
        match event {
            LifecycleEvent::FirstRunCompleted => config.first_run = false,
            LifecycleEvent::EnvironmentConfigured => config.environment_configured = true,
            LifecycleEvent::LastRun { at } => config.last_run = Some(at.to_rfc3339()),
        }
    }
}

/// Sets `dotted.key` inside a JSON document. The raw value is parsed as JSON
/// when possible, otherwise stored as a string.
fn set_path(document: &mut Value, key: &str, raw: &str) -> Result<()> {
    let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    let mut cursor = document;
    let parts: Vec<&str> = key.split('.').filter(|part| !part.is_empty()).collect();
    let Some((last, parents)) = parts.split_last() else {
        return Err(LauncherError::Config("empty configuration key".to_string()));
    };
    for part in parents {
        cursor = cursor
            .as_object_mut()
            .ok_or_else(|| LauncherError::Config(format!("{key} is not an object path")))?
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    cursor
        .as_object_mut()
        .ok_or_else(|| LauncherError::Config(format!("{key} is not an object path")))?
        .insert(last.to_string(), value);
    Ok(())
}

/// Owns `launcher_config.json`; the only writer of persisted configuration.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "launcher_config".to_string());
        self.path.with_file_name(format!("{stem}_backup.json"))
    }

    /// Missing or unreadable files are replaced with defaults.
    pub fn load(&self) -> Result<LauncherConfig> {
        if !self.path.exists() {
            tracing::info!("no configuration at {}, writing defaults", self.path.display());
            let config = LauncherConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let parsed = fs::read_to_string(&self.path)
            .map_err(LauncherError::from)
            .and_then(|raw| serde_json::from_str::<LauncherConfig>(&raw).map_err(LauncherError::from));
        match parsed {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::error!("configuration {} unreadable ({}), resetting", self.path.display(), err);
                let config = LauncherConfig::default();
                self.save(&config)?;
                Ok(config)
            }
        }
    }

    pub fn save(&self, config: &LauncherConfig) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(config)?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }

    /// Validates the file as stored, before defaults fill any gaps.
    pub fn validate(&self) -> Result<Vec<String>> {
        let raw = fs::read_to_string(&self.path)?;
        let document: Value = serde_json::from_str(&raw)?;
        Ok(validate_document(&document))
    }

    pub fn apply(&self, events: &[LifecycleEvent]) -> Result<LauncherConfig> {
        let mut config = self.load()?;
        apply_events(&mut config, events);
        self.save(&config)?;
        Ok(config)
    }

    pub fn set(&self, key: &str, raw_value: &str) -> Result<LauncherConfig> {
        let mut document = serde_json::to_value(self.load()?)?;
        set_path(&mut document, key, raw_value)?;
        let problems = validate_document(&document);
        if !problems.is_empty() {
            return Err(LauncherError::Config(problems.join("; ")));
        }
        let config: LauncherConfig = serde_json::from_value(document)?;
        self.save(&config)?;
        Ok(config)
    }

    pub fn reset(&self) -> Result<LauncherConfig> {
        let config = LauncherConfig::default();
        self.save(&config)?;
        tracing::info!("configuration reset to defaults");
        Ok(config)
    }

    pub fn export(&self, target: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.load()?)?;
        write_atomic(target, &bytes)?;
        Ok(())
    }

    /// Replaces the configuration with `source` if it validates.
    pub fn import(&self, source: &Path) -> Result<LauncherConfig> {
        let raw = fs::read_to_string(source)
            .map_err(|_| LauncherError::NotFound(source.display().to_string()))?;
        let document: Value = serde_json::from_str(&raw)?;
        let problems = validate_document(&document);
        if !problems.is_empty() {
            return Err(LauncherError::Config(problems.join("; ")));
        }
        let config: LauncherConfig = serde_json::from_value(document)?;
        self.save(&config)?;
        Ok(config)
    }

    pub fn backup(&self) -> Result<PathBuf> {
        let target = self.backup_path();
        self.export(&target)?;
        Ok(target)
    }

    pub fn restore(&self) -> Result<LauncherConfig> {
        self.import(&self.backup_path())
    }
}
