use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::errors::{LauncherError, Result};
use crate::models::LauncherConfig;
use crate::services::network_fetcher::NetworkFetcher;
use crate::services::remote_identity::{mirror_url_for, RemoteMatcher};
use crate::utils::file::{backup_rename, clear_path};
use crate::utils::process::{command, probe_version, run_checked, run_with_timeout, ProcessOutput};

const PORTABLE_GIT_VERSION: &str = "2.47.1";
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const QUICK_TIMEOUT: Duration = Duration::from_secs(30);
const FETCH_TIMEOUT: Duration = Duration::from_secs(300);
const CLONE_CYCLES: usize = 2;

/// What is on disk at the working-copy location, computed once per sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkingCopyState {
    Absent,
    NonRepoDirectory,
    RepoMatching { current_remote: String },
    RepoDivergent { current_remote: Option<String> },
}

pub struct RepoSynchronizer {
    config: Arc<LauncherConfig>,
    fetcher: NetworkFetcher,
    matcher: RemoteMatcher,
    tools_dir: PathBuf,
    #[cfg_attr(not(target_os = "windows"), allow(dead_code))]
    download_dir: PathBuf,
    git: OnceCell<PathBuf>,
}

impl RepoSynchronizer {
    pub fn new(
        config: Arc<LauncherConfig>,
        fetcher: NetworkFetcher,
        tools_dir: PathBuf,
        download_dir: PathBuf,
    ) -> Self {
        let matcher = RemoteMatcher::from_config(&config);
        Self {
            config,
            fetcher,
            matcher,
            tools_dir,
            download_dir,
            git: OnceCell::new(),
        }
    }

    fn portable_dir(&self) -> PathBuf {
        self.tools_dir.join("git")
    }

    fn candidate_locations(&self) -> Vec<PathBuf> {
        let portable = self.portable_dir();
        let mut candidates = Vec::new();
        if cfg!(target_os = "windows") {
            candidates.push(portable.join("cmd").join("git.exe"));
            candidates.push(portable.join("bin").join("git.exe"));
            candidates.push(PathBuf::from(r"C:\Program Files\Git\cmd\git.exe"));
            candidates.push(PathBuf::from(r"C:\Program Files\Git\bin\git.exe"));
            candidates.push(PathBuf::from(r"C:\Program Files (x86)\Git\bin\git.exe"));
        } else {
            candidates.push(portable.join("bin").join("git"));
            candidates.push(PathBuf::from("/usr/bin/git"));
            candidates.push(PathBuf::from("/usr/local/bin/git"));
            candidates.push(PathBuf::from("/opt/homebrew/bin/git"));
        }
        candidates
            .into_iter()
            .filter(|path| path.exists())
            .chain(std::iter::once(PathBuf::from("git")))
            .collect()
    }

    fn locate_tool(&self) -> Option<PathBuf> {
        self.candidate_locations().into_iter().find(|candidate| {
            match probe_version(candidate.as_os_str(), VERSION_TIMEOUT) {
                Some(version) => {
                    tracing::info!("using {} ({})", candidate.display(), version);
                    true
                }
                None => false,
            }
        })
    }

    fn git(&self) -> Result<&Path> {
        self.git
            .get_or_try_init(|| {
                self.locate_tool()
                    .ok_or_else(|| LauncherError::ToolMissing("git".to_string()))
            })
            .map(PathBuf::as_path)
    }

    /// Finds a working git, installing the portable distribution if none responds.
    pub fn ensure_tool_installed(&self) -> bool {
        if self.git().is_ok() {
            return true;
        }
        tracing::warn!("git was not found, attempting portable install");
        if !self.install_portable() {
            return false;
        }
        match self.git() {
            Ok(path) => {
                tracing::info!("portable git ready at {}", path.display());
                true
            }
            Err(err) => {
                tracing::error!("git still unavailable after install: {}", err);
                false
            }
        }
    }

    pub fn tool_version(&self) -> Option<String> {
        let git = self.git().ok()?;
        probe_version(git.as_os_str(), VERSION_TIMEOUT)
    }

    #[cfg(target_os = "windows")]
    fn install_portable(&self) -> bool {
        let file_name = format!("PortableGit-{PORTABLE_GIT_VERSION}-64-bit.7z.exe");
        let tag = format!("v{PORTABLE_GIT_VERSION}.windows.1");
        let candidates = vec![
            format!("https://registry.npmmirror.com/-/binary/git-for-windows/{tag}/{file_name}"),
            format!("https://github.com/git-for-windows/git/releases/download/{tag}/{file_name}"),
        ];
        let probe_timeout = Duration::from_millis(self.config.advanced_settings.probe_timeout_ms);
        let installer = self.download_dir.join(&file_name);

        let downloaded = self
            .fetcher
            .rank_candidates(&candidates, probe_timeout)
            .iter()
            .any(|url| self.fetcher.fetch(url, &installer, None));
        if !downloaded {
            tracing::error!("portable git could not be downloaded from any source");
            return false;
        }

        let target = self.portable_dir();
        let mut extract = command(&installer);
        extract.arg("-y").arg(format!("-o{}", target.display()));
        let timeout = Duration::from_secs(self.config.advanced_settings.download_timeout_secs);
        let result = run_checked(&mut extract, timeout, "portable git extraction");
        if self.config.advanced_settings.cleanup_temp_files {
            let _ = std::fs::remove_file(&installer);
        }
        match result {
            Ok(_) => true,
            Err(err) => {
                tracing::error!("{}", err);
                false
            }
        }
    }

    #[cfg(not(target_os = "windows"))]
    fn install_portable(&self) -> bool {
        tracing::error!(
            "portable git {} is only distributed for Windows; install git with the system package manager",
            PORTABLE_GIT_VERSION
        );
        false
    }

    fn git_command(&self, dir: Option<&Path>) -> Result<Command> {
        let mut cmd = command(self.git()?);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = dir {
            cmd.arg("-C").arg(dir);
        }
        Ok(cmd)
    }

    fn run_git(&self, dir: &Path, args: &[&str], timeout: Duration) -> Result<ProcessOutput> {
        let mut cmd = self.git_command(Some(dir))?;
        cmd.args(args);
        let context = format!("git {}", args.first().copied().unwrap_or_default());
        run_checked(&mut cmd, timeout, &context)
    }

    fn query(&self, dir: &Path, args: &[&str]) -> Option<String> {
        let output = self.run_git(dir, args, QUICK_TIMEOUT).ok()?;
        let value = output.stdout.trim().to_string();
        (!value.is_empty()).then_some(value)
    }

    pub fn remote_url(&self, target: &Path) -> Option<String> {
        self.query(target, &["config", "--get", "remote.origin.url"])
    }

    pub fn current_branch(&self, target: &Path) -> Option<String> {
        self.query(target, &["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn head_commit(&self, target: &Path) -> Option<String> {
        self.query(target, &["rev-parse", "HEAD"])
    }

    fn is_repository(&self, target: &Path) -> bool {
        target.join(".git").exists()
            && self
                .query(target, &["rev-parse", "--git-dir"])
                .is_some()
    }

    pub fn inspect(&self, remote: &str, target: &Path) -> WorkingCopyState {
        if !target.exists() {
            return WorkingCopyState::Absent;
        }
        if !target.is_dir() || !self.is_repository(target) {
            return WorkingCopyState::NonRepoDirectory;
        }
        match self.remote_url(target) {
            Some(current) if self.matcher.equivalent(&current, remote) => {
                WorkingCopyState::RepoMatching {
                    current_remote: current,
                }
            }
            current => WorkingCopyState::RepoDivergent {
                current_remote: current,
            },
        }
    }

    /// Leaves `target` as a clean checkout of `remote`. Local changes are discarded.
    pub fn ensure_working_copy(&self, remote: &str, target: &Path, branch: Option<&str>) -> bool {
        if let Err(err) = self.git() {
            tracing::error!("cannot sync {}: {}", target.display(), err);
            return false;
        }

        let state = self.inspect(remote, target);
        tracing::info!("working copy {} is {:?}", target.display(), state);

        match state {
            WorkingCopyState::Absent => self.clone_fresh(remote, target, branch),
            WorkingCopyState::NonRepoDirectory => {
                if !clear_path(target) {
                    return false;
                }
                self.clone_fresh(remote, target, branch)
            }
            WorkingCopyState::RepoMatching { current_remote } => {
                match self.repair(remote, target, branch) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(
                            "repair of {} (origin {}) failed: {}",
                            target.display(),
                            current_remote,
                            err
                        );
                        self.set_aside(target) && self.clone_fresh(remote, target, branch)
                    }
                }
            }
            WorkingCopyState::RepoDivergent { current_remote } => {
                tracing::warn!(
                    "{} tracks {} instead of {}",
                    target.display(),
                    current_remote.as_deref().unwrap_or("<no origin>"),
                    remote
                );
                self.set_aside(target) && self.clone_fresh(remote, target, branch)
            }
        }
    }

    fn set_aside(&self, target: &Path) -> bool {
        match backup_rename(target) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!("backup of {} failed: {}", target.display(), err);
                clear_path(target)
            }
        }
    }

    fn repair(&self, remote: &str, target: &Path, requested: Option<&str>) -> Result<()> {
        self.run_git(target, &["remote", "set-url", "origin", remote], QUICK_TIMEOUT)?;
        self.run_git(target, &["fetch", "--all", "--prune"], FETCH_TIMEOUT)?;

        let branch = self.select_branch(target, requested).ok_or_else(|| {
            LauncherError::StateConflict(format!(
                "no usable branch on origin for {}",
                target.display()
            ))
        })?;
        let upstream = format!("origin/{branch}");

        self.run_git(target, &["checkout", "-f", "-B", &branch, &upstream], QUICK_TIMEOUT)?;
        self.run_git(target, &["reset", "--hard", &upstream], QUICK_TIMEOUT)?;
        self.run_git(target, &["clean", "-fd"], QUICK_TIMEOUT)?;
        tracing::info!("repaired {} at {}", target.display(), upstream);
        Ok(())
    }

    fn remote_branch_exists(&self, target: &Path, branch: &str) -> bool {
        let reference = format!("refs/remotes/origin/{branch}");
        self.run_git(
            target,
            &["rev-parse", "--verify", "--quiet", &reference],
            QUICK_TIMEOUT,
        )
        .is_ok()
    }

    /// A requested branch wins when origin has it; otherwise origin's default.
    fn select_branch(&self, target: &Path, requested: Option<&str>) -> Option<String> {
        if let Some(branch) = requested.filter(|branch| !branch.trim().is_empty()) {
            if self.remote_branch_exists(target, branch) {
                return Some(branch.to_string());
            }
            tracing::warn!("branch {} not found on origin, using default", branch);
        }
        self.default_branch(target)
    }

    fn default_branch(&self, target: &Path) -> Option<String> {
        if let Some(head) = self.query(target, &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"]) {
            if let Some(branch) = head.strip_prefix("origin/") {
                return Some(branch.to_string());
            }
        }

        if let Ok(output) = self.run_git(target, &["remote", "show", "origin"], FETCH_TIMEOUT) {
            if let Some(branch) = parse_head_branch(&output.stdout) {
                return Some(branch);
            }
        }

        self.config
            .default_branch
            .iter()
            .map(String::as_str)
            .chain(["main", "master"])
            .find(|branch| self.remote_branch_exists(target, branch))
            .map(str::to_string)
    }

    fn clone_candidates(&self, remote: &str) -> Vec<String> {
        let mirror = self
            .config
            .git_mirror()
            .and_then(|base| mirror_url_for(remote, base))
            .filter(|url| url != remote);
        let Some(mirror) = mirror else {
            return vec![remote.to_string()];
        };

        let probe_timeout = Duration::from_millis(self.config.advanced_settings.probe_timeout_ms);
        let primary_alive = remote.starts_with("http") && self.fetcher.probe(remote, probe_timeout);
        if !primary_alive {
            tracing::info!("{} did not answer, trying mirror first", remote);
        }
        order_clone_candidates(remote, mirror, primary_alive)
    }

    fn clone_once(&self, url: &str, target: &Path, branch: Option<&str>) -> Result<ProcessOutput> {
        let mut cmd = self.git_command(None)?;
        cmd.arg("clone");
        if let Some(branch) = branch.filter(|branch| !branch.trim().is_empty()) {
            cmd.args(["--branch", branch]);
        }
        cmd.arg(url).arg(target);
        let timeout = Duration::from_secs(self.config.advanced_settings.clone_timeout_secs);
        run_with_timeout(&mut cmd, timeout)
    }

    fn clone_fresh(&self, remote: &str, target: &Path, branch: Option<&str>) -> bool {
        if let Some(parent) = target.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let candidates = self.clone_candidates(remote);

        for cycle in 0..CLONE_CYCLES {
            if cycle > 0 && !clear_path(target) {
                return false;
            }
            let mut saw_existing = false;
            for url in &candidates {
                tracing::info!("cloning {} into {}", url, target.display());
                match self.clone_once(url, target, branch) {
                    Ok(output) if output.success() => return true,
                    Ok(output) => {
                        let reason = output.diagnostic();
                        tracing::warn!("clone from {} failed: {}", url, reason);
                        saw_existing |= reason.contains("already exists");
                    }
                    Err(err) => tracing::warn!("clone from {} failed: {}", url, err),
                }
                if !saw_existing {
                    let _ = clear_path(target);
                }
            }
            if !saw_existing {
                break;
            }
        }

        tracing::error!("every clone source failed for {}", remote);
        false
    }
}

/// A live primary is tried before its mirror; a dead one after it.
fn order_clone_candidates(remote: &str, mirror: String, primary_alive: bool) -> Vec<String> {
    if primary_alive {
        vec![remote.to_string(), mirror]
    } else {
        vec![mirror, remote.to_string()]
    }
}

fn parse_head_branch(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("HEAD branch:"))
        .map(|branch| branch.trim().to_string())
        .filter(|branch| !branch.is_empty() && branch != "(unknown)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use uuid::Uuid;

    fn git_available() -> bool {
        probe_version(std::ffi::OsStr::new("git"), VERSION_TIMEOUT).is_some()
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = command("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=Launcher Test", "-c", "user.email=test@example.invalid"])
            .args(args)
            .output()
            .expect("run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    struct Fixture {
        root: PathBuf,
        remote: String,
    }

    impl Fixture {
        /// A bare repository with one commit on `main`.
        fn new(label: &str) -> Self {
            let root = std::env::temp_dir().join(format!("bootstrap-repo-{label}-{}", Uuid::new_v4()));
            let remote = Self::bare_with_commit(&root, "origin");
            Self { root, remote }
        }

        fn bare_with_commit(root: &Path, name: &str) -> String {
            let bare = root.join(format!("{name}.git"));
            let seed = root.join(format!("{name}-seed"));
            fs::create_dir_all(&bare).expect("create bare dir");
            fs::create_dir_all(&seed).expect("create seed dir");
            git(&bare, &["init", "--bare"]);
            git(&bare, &["symbolic-ref", "HEAD", "refs/heads/main"]);
            git(&seed, &["init"]);
            git(&seed, &["checkout", "-b", "main"]);
            fs::write(seed.join("whimbox.py"), "print('hi')\n").expect("write seed file");
            git(&seed, &["add", "."]);
            git(&seed, &["commit", "-m", "initial"]);
            git(&seed, &["push", bare.to_str().expect("utf-8 path"), "main"]);
            bare.to_string_lossy().to_string()
        }

        fn origin_head(&self) -> String {
            git(Path::new(&self.remote), &["rev-parse", "refs/heads/main"])
        }

        fn synchronizer(&self) -> RepoSynchronizer {
            let config = LauncherConfig {
                use_git_mirror: false,
                ..LauncherConfig::default()
            };
            RepoSynchronizer::new(
                Arc::new(config),
                NetworkFetcher::new(Duration::from_secs(5), Duration::from_millis(200)),
                self.root.join("tools"),
                self.root.join("downloads"),
            )
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            crate::utils::file::clear_readonly(&self.root);
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn clones_into_absent_directory() {
        if !git_available() {
            return;
        }
        let fixture = Fixture::new("absent");
        let sync = fixture.synchronizer();
        let target = fixture.root.join("app");

        assert_eq!(sync.inspect(&fixture.remote, &target), WorkingCopyState::Absent);
        assert!(sync.ensure_working_copy(&fixture.remote, &target, None));
        assert_eq!(sync.head_commit(&target), Some(fixture.origin_head()));
        assert_eq!(sync.current_branch(&target).as_deref(), Some("main"));
    }

    #[test]
    fn repair_is_idempotent_and_discards_local_changes() {
        if !git_available() {
            return;
        }
        let fixture = Fixture::new("repair");
        let sync = fixture.synchronizer();
        let target = fixture.root.join("app");
        assert!(sync.ensure_working_copy(&fixture.remote, &target, None));

        fs::write(target.join("whimbox.py"), "print('edited')\n").expect("edit tracked file");
        fs::write(target.join("scratch.txt"), "tmp").expect("write untracked file");
        git(&target, &["commit", "-am", "local change"]);
        assert_ne!(sync.head_commit(&target), Some(fixture.origin_head()));

        for _ in 0..3 {
            assert!(sync.ensure_working_copy(&fixture.remote, &target, None));
            assert_eq!(sync.head_commit(&target), Some(fixture.origin_head()));
        }
        assert!(!target.join("scratch.txt").exists());
        assert_eq!(
            fs::read_to_string(target.join("whimbox.py")).expect("read tracked file"),
            "print('hi')\n"
        );
    }

    #[test]
    fn divergent_checkout_is_backed_up_then_recloned() {
        if !git_available() {
            return;
        }
        let fixture = Fixture::new("divergent");
        let other = Fixture::bare_with_commit(&fixture.root, "other");
        let sync = fixture.synchronizer();
        let target = fixture.root.join("app");
        git(&fixture.root, &["clone", &other, "app"]);
        fs::write(target.join("notes.txt"), "keep me").expect("write local notes");

        assert!(matches!(
            sync.inspect(&fixture.remote, &target),
            WorkingCopyState::RepoDivergent { .. }
        ));
        assert!(sync.ensure_working_copy(&fixture.remote, &target, None));

        let remote_url = sync.remote_url(&target).expect("origin url");
        assert!(RemoteMatcher::default().equivalent(&remote_url, &fixture.remote));
        let backups: Vec<_> = fs::read_dir(&fixture.root)
            .expect("list root")
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("app_backup_"))
            .collect();
        assert_eq!(backups.len(), 1);
        assert!(backups[0].path().join("notes.txt").exists());
    }

    #[test]
    fn plain_directory_is_replaced_by_checkout() {
        if !git_available() {
            return;
        }
        let fixture = Fixture::new("plain");
        let sync = fixture.synchronizer();
        let target = fixture.root.join("app");
        fs::create_dir_all(&target).expect("create plain dir");
        fs::write(target.join("leftover.txt"), "x").expect("write leftover");

        assert_eq!(
            sync.inspect(&fixture.remote, &target),
            WorkingCopyState::NonRepoDirectory
        );
        assert!(sync.ensure_working_copy(&fixture.remote, &target, None));
        assert!(!target.join("leftover.txt").exists());
        assert!(target.join("whimbox.py").exists());
    }

    #[test]
    fn unknown_branch_falls_back_to_default() {
        if !git_available() {
            return;
        }
        let fixture = Fixture::new("branch");
        let sync = fixture.synchronizer();
        let target = fixture.root.join("app");
        assert!(sync.ensure_working_copy(&fixture.remote, &target, None));
        assert!(sync.ensure_working_copy(&fixture.remote, &target, Some("does-not-exist")));
        assert_eq!(sync.current_branch(&target).as_deref(), Some("main"));
    }

    #[test]
    fn reads_head_branch_from_remote_show() {
        let output = "* remote origin\n  Fetch URL: x\n  HEAD branch: develop\n  Remote branches:\n";
        assert_eq!(parse_head_branch(output).as_deref(), Some("develop"));
        assert_eq!(parse_head_branch("  HEAD branch: (unknown)\n"), None);
    }

    #[test]
    fn live_primary_goes_before_mirror() {
        let remote = "https://github.com/owner/app.git";
        let mirror = "https://mirror.example.invalid/owner/app.git".to_string();

        assert_eq!(
            order_clone_candidates(remote, mirror.clone(), true),
            vec![remote.to_string(), mirror.clone()]
        );
        assert_eq!(
            order_clone_candidates(remote, mirror.clone(), false),
            vec![mirror, remote.to_string()]
        );
    }

    #[test]
    fn without_mirror_only_primary_is_tried() {
        let fixture_root = std::env::temp_dir().join(format!("bootstrap-repo-plain-{}", Uuid::new_v4()));
        let sync = RepoSynchronizer::new(
            Arc::new(LauncherConfig {
                use_git_mirror: false,
                ..LauncherConfig::default()
            }),
            NetworkFetcher::new(Duration::from_secs(5), Duration::from_millis(200)),
            fixture_root.join("tools"),
            fixture_root.join("downloads"),
        );
        let remote = "https://github.com/owner/app.git";
        assert_eq!(sync.clone_candidates(remote), vec![remote.to_string()]);
    }

    #[test]
    fn occupied_target_is_cleared_and_recloned_once() {
        if !git_available() {
            return;
        }
        let fixture = Fixture::new("occupied");
        let sync = fixture.synchronizer();
        let target = fixture.root.join("app");
        fs::create_dir_all(&target).expect("create occupied target");
        fs::write(target.join("stale.txt"), "left behind").expect("write stale file");

        assert!(sync.clone_fresh(&fixture.remote, &target, None));
        assert!(!target.join("stale.txt").exists());
        assert_eq!(sync.head_commit(&target), Some(fixture.origin_head()));
    }
}
