use std::cmp::Ordering;
use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{LauncherError, Result};
use crate::models::{silent_progress, LauncherConfig, Progress};
use crate::services::network_fetcher::NetworkFetcher;
use crate::services::remote_identity::RemoteIdentity;
use crate::utils::file::{copy_dir_recursive, copy_entry, extract_zip, remove_entry, sha256_file, write_atomic};

const HISTORY_LIMIT: usize = 50;
const MIN_PACKAGE_BYTES: u64 = 1024;
const BACKUP_DIR: &str = "backup";
const BACKUP_STAGING_DIR: &str = "backup.partial";

static ROTATED_BACKUP: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^backup_\d{8}_\d{6}(_\d+)?$").ok());

/// Names the updater owns inside the install dir: the live backup, its staging
/// copy and rotated `backup_<YYYYmmdd_HHMMSS>` directories.
fn is_backup_name(name: &str) -> bool {
    name == BACKUP_DIR
        || name == BACKUP_STAGING_DIR
        || ROTATED_BACKUP
            .as_ref()
            .map_or(false, |pattern| pattern.is_match(name))
}

/// Orders dotted versions numerically, padding the shorter side with zeros.
/// A leading `v` is ignored and non-numeric components count as zero.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    fn parts(version: &str) -> Vec<u64> {
        version
            .trim()
            .trim_start_matches(['v', 'V'])
            .split('.')
            .map(|part| part.trim().parse().unwrap_or(0))
            .collect()
    }
    let (mut left, mut right) = (parts(left), parts(right));
    let len = left.len().max(right.len());
    left.resize(len, 0);
    right.resize(len, 0);
    left.cmp(&right)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// Result of a full check-download-apply cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate,
    Updated(String),
    Failed,
}

impl UpdateOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, UpdateOutcome::Failed)
    }

    pub fn message(&self) -> String {
        match self {
            UpdateOutcome::UpToDate => "launcher is current".to_string(),
            UpdateOutcome::Updated(version) => format!("updated to {version}"),
            UpdateOutcome::Failed => "update failed, see the log".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateInfo {
    pub version: String,
    pub download_url: String,
    pub release_notes: String,
    pub published_at: String,
}

/// `Some` only when `release` is newer than `current` and ships a `.zip` asset.
pub fn parse_release(release: &Release, current: &str) -> Option<UpdateInfo> {
    let version = release.tag_name.trim().trim_start_matches(['v', 'V']).to_string();
    if compare_versions(&version, current) != Ordering::Greater {
        return None;
    }
    let asset = release
        .assets
        .iter()
        .find(|asset| asset.name.to_ascii_lowercase().ends_with(".zip"));
    let Some(asset) = asset else {
        tracing::warn!("release {} has no zip asset", version);
        return None;
    };
    Some(UpdateInfo {
        version,
        download_url: asset.browser_download_url.clone(),
        release_notes: release.body.clone().unwrap_or_default(),
        published_at: release.published_at.clone().unwrap_or_default(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMarker {
    pub version: String,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: String,
    pub action: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

pub struct SelfUpdater {
    config: Arc<LauncherConfig>,
    fetcher: NetworkFetcher,
    install_dir: PathBuf,
    config_dir: PathBuf,
    download_dir: PathBuf,
}

impl SelfUpdater {
    pub fn new(
        config: Arc<LauncherConfig>,
        fetcher: NetworkFetcher,
        install_dir: PathBuf,
        config_dir: PathBuf,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            fetcher,
            install_dir,
            config_dir,
            download_dir,
        }
    }

    fn marker_path(&self) -> PathBuf {
        self.config_dir.join("version.json")
    }

    fn history_path(&self) -> PathBuf {
        self.config_dir.join("update_history.json")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.install_dir.join(BACKUP_DIR)
    }

    pub fn read_version_marker(&self) -> Option<VersionMarker> {
        let raw = fs::read_to_string(self.marker_path()).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn write_version_marker(&self, version: &str) -> Result<()> {
        let marker = VersionMarker {
            version: version.to_string(),
            last_updated: Utc::now(),
        };
        write_atomic(&self.marker_path(), &serde_json::to_vec_pretty(&marker)?)?;
        Ok(())
    }

    pub fn current_version(&self) -> String {
        self.read_version_marker()
            .map(|marker| marker.version)
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        fs::read_to_string(self.history_path())
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    /// Appends to the history log, dropping the oldest entries past the limit.
    pub fn record_history(&self, version: &str, action: &str, success: bool) -> Result<()> {
        let mut history = self.history();
        history.push(HistoryEntry {
            version: version.to_string(),
            action: action.to_string(),
            success,
            timestamp: Utc::now(),
        });
        if history.len() > HISTORY_LIMIT {
            let excess = history.len() - HISTORY_LIMIT;
            history.drain(..excess);
        }
        write_atomic(&self.history_path(), &serde_json::to_vec_pretty(&history)?)?;
        Ok(())
    }

    fn release_feed_url(&self) -> Option<String> {
        let repo = self.config.launcher_github_repo.trim();
        let slug = match RemoteIdentity::parse(repo) {
            Some(identity) if identity.host != "file" => format!("{}/{}", identity.owner, identity.repo),
            _ if repo.split('/').filter(|part| !part.is_empty()).count() == 2 => {
                repo.trim_matches('/').to_string()
            }
            _ => return None,
        };
        Some(format!("https://api.github.com/repos/{slug}/releases/latest"))
    }

    pub fn check_for_updates(&self) -> Option<UpdateInfo> {
        let Some(url) = self.release_feed_url() else {
            tracing::warn!(
                "cannot derive a release feed from {}",
                self.config.launcher_github_repo
            );
            return None;
        };
        let release = match self.fetcher.get_json::<Release>(&url) {
            Ok(release) => release,
            Err(err) => {
                tracing::warn!("update check failed: {}", err);
                return None;
            }
        };
        let current = self.current_version();
        let update = parse_release(&release, &current);
        match &update {
            Some(info) => tracing::info!("update {} available (current {})", info.version, current),
            None => tracing::info!("launcher {} is up to date", current),
        }
        update
    }

    pub fn perform_update(&self, progress: Option<Progress>) -> bool {
        self.update(progress).succeeded()
    }

    pub fn update(&self, progress: Option<Progress>) -> UpdateOutcome {
        let report = progress.unwrap_or(&silent_progress);
        let Some(update) = self.check_for_updates() else {
            report(100, "launcher is up to date");
            return UpdateOutcome::UpToDate;
        };

        let archive = self.download_dir.join(format!("launcher-{}.zip", update.version));
        let download_progress = |percent: u8, _: &str| {
            report(percent, &format!("downloading update {percent}%"));
        };
        if !self
            .fetcher
            .fetch(&update.download_url, &archive, Some(&download_progress))
        {
            let _ = self.record_history(&update.version, "download", false);
            return UpdateOutcome::Failed;
        }

        match self.apply_package(&archive, &update.version, report) {
            Ok(()) => UpdateOutcome::Updated(update.version),
            Err(err) => {
                tracing::error!("update to {} failed: {}", update.version, err);
                UpdateOutcome::Failed
            }
        }
    }

    pub fn apply_package(&self, archive: &Path, version: &str, report: Progress) -> Result<()> {
        let result = self.apply_package_inner(archive, version, report);
        let _ = self.record_history(version, "update", result.is_ok());
        result
    }

    fn apply_package_inner(&self, archive: &Path, version: &str, report: Progress) -> Result<()> {
        report(10, "verifying update package");
        let digest = self.verify_package(archive)?;
        tracing::info!("update package {} sha256 {}", archive.display(), digest);

        report(20, "extracting update");
        let staging = self.download_dir.join(format!("update-{}", Uuid::new_v4()));
        extract_zip(archive, &staging)?;

        report(40, "backing up current version");
        if let Err(err) = self.create_backup() {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }

        report(60, "installing new version");
        let installed = overwrite_from(&staging, &self.install_dir);
        report(90, "cleaning up");
        let _ = fs::remove_dir_all(&staging);
        if self.config.advanced_settings.cleanup_temp_files {
            let _ = fs::remove_file(archive);
        }
        let files = installed?;

        self.write_version_marker(version)?;
        tracing::info!("installed {} files for launcher {}", files, version);
        report(100, "update installed");
        Ok(())
    }

    /// Rejects archives that are missing, tiny, corrupt or lack required entries.
    pub fn verify_package(&self, archive: &Path) -> Result<String> {
        let metadata = fs::metadata(archive)
            .map_err(|_| LauncherError::NotFound(archive.display().to_string()))?;
        if metadata.len() < MIN_PACKAGE_BYTES {
            return Err(LauncherError::Integrity(format!(
                "{} is only {} bytes",
                archive.display(),
                metadata.len()
            )));
        }

        let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
        let mut names = Vec::with_capacity(zip.len());
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index)?;
            io::copy(&mut entry, &mut io::sink()).map_err(|err| {
                LauncherError::Integrity(format!("corrupt entry {}: {}", entry.name(), err))
            })?;
            names.push(entry.name().replace('\\', "/"));
        }

        for required in &self.config.update_settings.required_files {
            let required = required.trim_matches('/');
            let present = names
                .iter()
                .any(|name| name == required || name.starts_with(&format!("{required}/")));
            if !present {
                return Err(LauncherError::Integrity(format!(
                    "update package is missing {required}"
                )));
            }
        }

        sha256_file(archive)
    }

    fn skipped_entries(&self) -> Vec<OsString> {
        let mut skipped: Vec<OsString> = fs::read_dir(&self.install_dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|entry| entry.path().is_dir())
                    .map(|entry| entry.file_name())
                    .filter(|name| is_backup_name(&name.to_string_lossy()))
                    .collect()
            })
            .unwrap_or_default();
        for owned in [BACKUP_DIR, BACKUP_STAGING_DIR] {
            if !skipped.iter().any(|name| name == owned) {
                skipped.push(OsString::from(owned));
            }
        }
        if self.download_dir.parent() == Some(self.install_dir.as_path()) {
            if let Some(name) = self.download_dir.file_name() {
                skipped.push(name.to_os_string());
            }
        }
        skipped
    }

    /// Copies the install dir into a staging directory, then renames it to `backup`.
    fn create_backup(&self) -> Result<()> {
        let backup = self.backup_dir();
        let staging = self.install_dir.join(BACKUP_STAGING_DIR);
        remove_entry(&staging)?;

        let skipped = self.skipped_entries();
        let skip: Vec<&OsStr> = skipped.iter().map(OsString::as_os_str).collect();
        let copied = copy_dir_recursive(&self.install_dir, &staging, &skip)?;

        if backup.exists() {
            let rotated = self.rotated_backup_path();
            fs::rename(&backup, &rotated)?;
            tracing::info!("previous backup kept at {}", rotated.display());
            self.cleanup_old_backups(self.config.update_settings.keep_backups);
        }
        fs::rename(&staging, &backup)?;
        tracing::info!("backed up {} files to {}", copied, backup.display());
        Ok(())
    }

    fn rotated_backup_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let mut candidate = self.install_dir.join(format!("{BACKUP_DIR}_{stamp}"));
        let mut counter = 1;
        while candidate.exists() {
            candidate = self.install_dir.join(format!("{BACKUP_DIR}_{stamp}_{counter}"));
            counter += 1;
        }
        candidate
    }

    /// Deletes all but the newest `keep` rotated backups. Returns how many were removed.
    pub fn cleanup_old_backups(&self, keep: usize) -> usize {
        let mut rotated: Vec<PathBuf> = fs::read_dir(&self.install_dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|entry| entry.path().is_dir())
                    .filter(|entry| {
                        let name = entry.file_name().to_string_lossy().to_string();
                        name != BACKUP_DIR && name != BACKUP_STAGING_DIR && is_backup_name(&name)
                    })
                    .map(|entry| entry.path())
                    .collect()
            })
            .unwrap_or_default();
        rotated.sort();
        rotated.reverse();

        let mut removed = 0;
        for stale in rotated.into_iter().skip(keep) {
            match fs::remove_dir_all(&stale) {
                Ok(()) => removed += 1,
                Err(err) => tracing::warn!("failed to remove {}: {}", stale.display(), err),
            }
        }
        removed
    }

    /// Restores every item of the backup over the install dir, then drops the backup.
    pub fn rollback(&self) -> bool {
        let version = self.current_version();
        let result = self.rollback_inner();
        let _ = self.record_history(&version, "rollback", result.is_ok());
        match result {
            Ok(restored) => {
                tracing::info!("rolled back {} items", restored);
                true
            }
            Err(err) => {
                tracing::error!("rollback failed: {}", err);
                false
            }
        }
    }

    fn rollback_inner(&self) -> Result<usize> {
        let backup = self.backup_dir();
        if !backup.is_dir() {
            return Err(LauncherError::NotFound(backup.display().to_string()));
        }

        let mut restored = 0;
        for entry in fs::read_dir(&backup)? {
            let entry = entry?;
            let source = entry.path();
            let target = self.install_dir.join(entry.file_name());
            remove_entry(&target)?;
            copy_entry(&source, &target)?;
            restored += 1;
        }
        fs::remove_dir_all(&backup)?;
        Ok(restored)
    }
}

/// Copies every file under `staging` into `target`. A locked destination is
/// renamed to `*.old` first so the running executable can be replaced.
fn overwrite_from(staging: &Path, target: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in fs::read_dir(staging)? {
        let entry = entry?;
        let source = entry.path();
        let destination = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&destination)?;
            copied += overwrite_from(&source, &destination)?;
            continue;
        }
        if fs::copy(&source, &destination).is_err() {
            let parked = destination.with_extension("old");
            let _ = fs::remove_file(&parked);
            fs::rename(&destination, &parked)?;
            fs::copy(&source, &destination)?;
        }
        copied += 1;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    struct Sandbox {
        root: PathBuf,
    }

    impl Sandbox {
        fn new() -> Self {
            let root = std::env::temp_dir().join(format!("bootstrap-update-{}", Uuid::new_v4()));
            fs::create_dir_all(root.join("install")).expect("create install dir");
            Self { root }
        }

        fn updater(&self) -> SelfUpdater {
            let mut config = LauncherConfig::default();
            config.update_settings.required_files = vec!["launcher.bin".to_string()];
            SelfUpdater::new(
                Arc::new(config),
                NetworkFetcher::new(std::time::Duration::from_secs(5), std::time::Duration::from_millis(200)),
                self.root.join("install"),
                self.root.join("config"),
                self.root.join("downloads"),
            )
        }

        fn package(&self, entries: &[(&str, Vec<u8>)]) -> PathBuf {
            let path = self.root.join("update.zip");
            let file = File::create(&path).expect("create package");
            let mut writer = zip::ZipWriter::new(file);
            for (name, body) in entries {
                writer
                    .start_file(
                        *name,
                        FileOptions::default().compression_method(zip::CompressionMethod::Stored),
                    )
                    .expect("start zip entry");
                writer.write_all(body).expect("write zip entry");
            }
            writer.finish().expect("finish package");
            path
        }
    }

    impl Drop for Sandbox {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    fn payload(fill: u8) -> Vec<u8> {
        (0..4096).map(|index| fill.wrapping_add((index % 251) as u8)).collect()
    }

    #[test]
    fn compares_versions_numerically_with_padding() {
        assert_eq!(compare_versions("1.2.10", "1.2.9"), Ordering::Greater);
        assert_eq!(compare_versions("v1.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("0.9", "0.10"), Ordering::Less);
        assert_eq!(compare_versions("2", "1.99.99"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.rc", "1.0.0"), Ordering::Equal);
    }

    #[test]
    fn release_parsing_requires_newer_version_and_zip_asset() {
        let release = Release {
            tag_name: "v1.4.0".to_string(),
            body: Some("notes".to_string()),
            published_at: None,
            assets: vec![
                ReleaseAsset {
                    name: "checksums.txt".to_string(),
                    browser_download_url: "https://example.invalid/sums".to_string(),
                },
                ReleaseAsset {
                    name: "launcher-1.4.0.zip".to_string(),
                    browser_download_url: "https://example.invalid/launcher.zip".to_string(),
                },
            ],
        };

        let info = parse_release(&release, "1.3.9").expect("newer release");
        assert_eq!(info.version, "1.4.0");
        assert_eq!(info.download_url, "https://example.invalid/launcher.zip");
        assert_eq!(parse_release(&release, "1.4"), None);

        let no_zip = Release {
            assets: release.assets[..1].to_vec(),
            ..release
        };
        assert_eq!(parse_release(&no_zip, "1.0.0"), None);
    }

    #[test]
    fn apply_backs_up_and_rollback_restores_exact_bytes() {
        let sandbox = Sandbox::new();
        let updater = sandbox.updater();
        let install = sandbox.root.join("install");
        let original_bin = payload(1);
        let original_settings = b"mode=stable\n".to_vec();
        fs::write(install.join("launcher.bin"), &original_bin).expect("write launcher");
        fs::create_dir_all(install.join("data")).expect("create data dir");
        fs::write(install.join("data").join("settings.ini"), &original_settings).expect("write settings");

        let new_bin = payload(7);
        let archive = sandbox.package(&[
            ("launcher.bin", new_bin.clone()),
            ("data/settings.ini", b"mode=next\n".to_vec()),
        ]);
        updater
            .apply_package(&archive, "2.0.0", &silent_progress)
            .expect("apply update");

        assert_eq!(fs::read(install.join("launcher.bin")).expect("read new launcher"), new_bin);
        assert_eq!(
            fs::read(updater.backup_dir().join("launcher.bin")).expect("read backup"),
            original_bin
        );
        assert_eq!(updater.current_version(), "2.0.0");

        assert!(updater.rollback());
        assert_eq!(fs::read(install.join("launcher.bin")).expect("read restored"), original_bin);
        assert_eq!(
            fs::read(install.join("data").join("settings.ini")).expect("read restored settings"),
            original_settings
        );
        assert!(!updater.backup_dir().exists());

        let actions: Vec<_> = updater
            .history()
            .into_iter()
            .map(|entry| (entry.action, entry.success))
            .collect();
        assert_eq!(
            actions,
            vec![("update".to_string(), true), ("rollback".to_string(), true)]
        );
    }

    #[test]
    fn verification_rejects_small_or_incomplete_packages() {
        let sandbox = Sandbox::new();
        let updater = sandbox.updater();

        let tiny = sandbox.root.join("tiny.zip");
        fs::write(&tiny, b"PK").expect("write tiny file");
        assert!(matches!(updater.verify_package(&tiny), Err(LauncherError::Integrity(_))));

        let incomplete = sandbox.package(&[("readme.txt", payload(3))]);
        assert!(matches!(
            updater.verify_package(&incomplete),
            Err(LauncherError::Integrity(_))
        ));
        assert!(matches!(
            updater.verify_package(&sandbox.root.join("missing.zip")),
            Err(LauncherError::NotFound(_))
        ));
    }

    #[test]
    fn history_keeps_only_the_newest_entries() {
        let sandbox = Sandbox::new();
        let updater = sandbox.updater();
        for index in 0..55 {
            updater
                .record_history(&format!("1.0.{index}"), "update", true)
                .expect("record history");
        }
        let history = updater.history();
        assert_eq!(history.len(), 50);
        assert_eq!(history[0].version, "1.0.5");
        assert_eq!(history[49].version, "1.0.54");
    }

    #[test]
    fn cleanup_keeps_newest_rotated_backups() {
        let sandbox = Sandbox::new();
        let updater = sandbox.updater();
        let install = sandbox.root.join("install");
        for stamp in ["20240101_000000", "20240201_000000", "20240301_000000", "20240401_000000"] {
            fs::create_dir_all(install.join(format!("backup_{stamp}"))).expect("create rotated backup");
        }

        assert_eq!(updater.cleanup_old_backups(3), 1);
        assert!(!install.join("backup_20240101_000000").exists());
        assert!(install.join("backup_20240401_000000").exists());
    }

    #[test]
    fn backup_never_contains_itself_across_repeated_updates() {
        let sandbox = Sandbox::new();
        let updater = sandbox.updater();
        let install = sandbox.root.join("install");
        fs::write(install.join("launcher.bin"), payload(1)).expect("write launcher");

        for (fill, version) in [(2, "1.1.0"), (3, "1.2.0"), (4, "1.3.0")] {
            let archive = sandbox.package(&[("launcher.bin", payload(fill))]);
            updater
                .apply_package(&archive, version, &silent_progress)
                .expect("apply update");
        }

        let backup = updater.backup_dir();
        assert_eq!(fs::read(backup.join("launcher.bin")).expect("read backup"), payload(3));
        assert!(!backup.join(BACKUP_DIR).exists());
        assert!(!install.join(BACKUP_STAGING_DIR).exists());
        let nested_rotations = fs::read_dir(&backup)
            .expect("list backup")
            .flatten()
            .filter(|entry| is_backup_name(&entry.file_name().to_string_lossy()))
            .count();
        assert_eq!(nested_rotations, 0);
    }

    #[test]
    fn files_that_only_look_like_backups_are_kept() {
        let sandbox = Sandbox::new();
        let updater = sandbox.updater();
        let install = sandbox.root.join("install");
        fs::write(install.join("launcher.bin"), payload(1)).expect("write launcher");
        fs::write(install.join("backup_notes.txt"), b"keep me").expect("write notes");
        fs::create_dir_all(install.join("backup_tools")).expect("create tools dir");
        fs::write(install.join("backup_tools").join("run.cfg"), b"x").expect("write tool cfg");
        fs::create_dir_all(install.join("backup_20240101_000000")).expect("create rotated backup");

        let archive = sandbox.package(&[("launcher.bin", payload(9))]);
        updater
            .apply_package(&archive, "2.0.0", &silent_progress)
            .expect("apply update");

        let backup = updater.backup_dir();
        assert_eq!(fs::read(backup.join("backup_notes.txt")).expect("read notes"), b"keep me");
        assert!(backup.join("backup_tools").join("run.cfg").exists());
        assert!(!backup.join("backup_20240101_000000").exists());

        assert!(is_backup_name("backup_20240101_000000_2"));
        assert!(!is_backup_name("backup_notes.txt"));
        assert!(!is_backup_name("backups"));
    }

    #[cfg(unix)]
    #[test]
    fn update_and_rollback_handle_environment_symlinks() {
        let sandbox = Sandbox::new();
        let updater = sandbox.updater();
        let install = sandbox.root.join("install");
        fs::write(install.join("launcher.bin"), payload(1)).expect("write launcher");
        let venv = install.join("venv");
        fs::create_dir_all(venv.join("lib").join("site")).expect("create venv lib");
        fs::write(venv.join("lib").join("site").join("mod.py"), b"x = 1\n").expect("write module");
        std::os::unix::fs::symlink("lib", venv.join("lib64")).expect("link lib64");
        std::os::unix::fs::symlink("missing-python", venv.join("python3")).expect("link dangling");

        let archive = sandbox.package(&[("launcher.bin", payload(5))]);
        updater
            .apply_package(&archive, "2.0.0", &silent_progress)
            .expect("apply update over a venv");
        assert_eq!(fs::read(install.join("launcher.bin")).expect("read launcher"), payload(5));

        let backed_link = updater.backup_dir().join("venv").join("lib64");
        assert!(fs::symlink_metadata(&backed_link)
            .expect("backup keeps lib64")
            .file_type()
            .is_symlink());

        assert!(updater.rollback());
        assert_eq!(fs::read(install.join("launcher.bin")).expect("read restored"), payload(1));
        assert!(fs::symlink_metadata(venv.join("lib64"))
            .expect("restored lib64")
            .file_type()
            .is_symlink());
        assert!(venv.join("lib64").join("site").join("mod.py").exists());
    }

    #[test]
    fn outcome_messages_tell_an_applied_update_from_a_current_one() {
        assert_eq!(UpdateOutcome::UpToDate.message(), "launcher is current");
        assert_eq!(UpdateOutcome::Updated("2.1.0".to_string()).message(), "updated to 2.1.0");
        assert!(UpdateOutcome::Updated("2.1.0".to_string()).succeeded());
        assert!(!UpdateOutcome::Failed.succeeded());
    }

    #[test]
    fn update_without_a_release_feed_leaves_the_install_alone() {
        let sandbox = Sandbox::new();
        let mut config = LauncherConfig::default();
        config.launcher_github_repo = String::new();
        let updater = SelfUpdater::new(
            Arc::new(config),
            NetworkFetcher::new(std::time::Duration::from_secs(1), std::time::Duration::from_millis(100)),
            sandbox.root.join("install"),
            sandbox.root.join("config"),
            sandbox.root.join("downloads"),
        );

        assert_eq!(updater.update(None), UpdateOutcome::UpToDate);
        assert!(updater.perform_update(None));
        assert!(!updater.backup_dir().exists());
    }
}
