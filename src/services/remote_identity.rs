use std::path::Path;

use url::Url;

use crate::models::LauncherConfig;

/// Host/owner/repository triple extracted from a git remote address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub host: String,
    pub owner: String,
    pub repo: String,
}

fn strip_git_suffix(name: &str) -> &str {
    name.strip_suffix(".git").unwrap_or(name)
}

impl RemoteIdentity {
    /// Parses https/http/ssh/git URLs, scp-style `user@host:owner/repo` and local paths.
    pub fn parse(remote: &str) -> Option<Self> {
        let remote = remote.trim().trim_end_matches('/');
        if remote.is_empty() {
            return None;
        }

        if let Some(identity) = Self::parse_scp(remote) {
            return Some(identity);
        }

        if let Ok(url) = Url::parse(remote) {
            if url.scheme() == "file" {
                let path = url.to_file_path().ok()?;
                return Self::from_local_path(&path);
            }
            if url.scheme().len() > 1 {
                let host = url.host_str()?.to_ascii_lowercase();
                let segments: Vec<&str> = url
                    .path_segments()
                    .map(|parts| parts.filter(|part| !part.is_empty()).collect())
                    .unwrap_or_default();
                return Self::from_segments(host, &segments);
            }
        }

        Self::from_local_path(Path::new(remote))
    }

    fn parse_scp(remote: &str) -> Option<Self> {
        if remote.contains("://") {
            return None;
        }
        let (authority, path) = remote.split_once(':')?;
        // `C:\repo` is a drive letter, not a host.
        if authority.len() <= 1 || path.starts_with('\\') || authority.contains('/') {
            return None;
        }
        let host = authority
            .rsplit_once('@')
            .map(|(_, host)| host)
            .unwrap_or(authority)
            .to_ascii_lowercase();
        let segments: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
        Self::from_segments(host, &segments)
    }

    /// Mirrors such as `gitclone.com/github.com/owner/repo` embed the upstream host
    /// as the first path segment.
    fn from_segments(host: String, segments: &[&str]) -> Option<Self> {
        let (host, rest) = match segments {
            [embedded, rest @ ..] if rest.len() >= 2 && embedded.contains('.') => {
                (embedded.to_ascii_lowercase(), rest)
            }
            _ => (host, segments),
        };
        if rest.len() < 2 {
            return None;
        }
        let repo = strip_git_suffix(rest[rest.len() - 1]);
        let owner = rest[..rest.len() - 1].join("/");
        if repo.is_empty() || owner.is_empty() {
            return None;
        }
        Some(Self {
            host,
            owner,
            repo: repo.to_string(),
        })
    }

    fn from_local_path(path: &Path) -> Option<Self> {
        let repo = path.file_name()?.to_string_lossy().to_string();
        let owner = path
            .parent()
            .map(|parent| parent.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        Some(Self {
            host: "file".to_string(),
            owner,
            repo: strip_git_suffix(&repo).to_string(),
        })
    }
}

/// Decides whether two remote addresses name the same project.
#[derive(Debug, Clone)]
pub struct RemoteMatcher {
    canonical_host: String,
    mirror_hosts: Vec<String>,
    aliases: Vec<Vec<String>>,
}

impl Default for RemoteMatcher {
    fn default() -> Self {
        Self {
            canonical_host: "github.com".to_string(),
            mirror_hosts: Vec::new(),
            aliases: Vec::new(),
        }
    }
}

impl RemoteMatcher {
    pub fn new(canonical_host: &str, mirror_hosts: Vec<String>, aliases: Vec<Vec<String>>) -> Self {
        Self {
            canonical_host: canonical_host.to_ascii_lowercase(),
            mirror_hosts: mirror_hosts
                .into_iter()
                .map(|host| host.trim().to_ascii_lowercase())
                .filter(|host| !host.is_empty())
                .collect(),
            aliases,
        }
    }

    pub fn from_config(config: &LauncherConfig) -> Self {
        let mut mirrors = config.mirror_hosts.clone();
        if let Some(host) = Url::parse(&config.git_mirror_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
        {
            mirrors.push(host);
        }
        Self::new("github.com", mirrors, config.repo_aliases.clone())
    }

    fn normalize_host(&self, host: &str) -> String {
        let host = host.to_ascii_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
        if self.mirror_hosts.iter().any(|mirror| *mirror == host) {
            self.canonical_host.clone()
        } else {
            host
        }
    }

    fn repo_names_match(&self, left: &str, right: &str) -> bool {
        if left == right {
            return true;
        }
        self.aliases.iter().any(|group| {
            group.iter().any(|name| name == left) && group.iter().any(|name| name == right)
        })
    }

    pub fn equivalent_identities(&self, left: &RemoteIdentity, right: &RemoteIdentity) -> bool {
        self.normalize_host(&left.host) == self.normalize_host(&right.host)
            && left.owner.eq_ignore_ascii_case(&right.owner)
            && self.repo_names_match(&left.repo, &right.repo)
    }

    /// Unparseable remotes only match when the raw strings are identical.
    pub fn equivalent(&self, left: &str, right: &str) -> bool {
        match (RemoteIdentity::parse(left), RemoteIdentity::parse(right)) {
            (Some(left), Some(right)) => self.equivalent_identities(&left, &right),
            _ => left.trim() == right.trim(),
        }
    }
}

/// Rewrites a `https://github.com/...` address onto a mirror base.
pub fn mirror_url_for(remote: &str, mirror_base: &str) -> Option<String> {
    let rest = remote.trim().strip_prefix("https://github.com/")?;
    Some(format!("{}/{}", mirror_base.trim_end_matches('/'), rest))
}
