use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::errors::Result;

pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension("tmp");
    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp_path, path)?;
    Ok(())
}

pub fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];

    loop {
        let bytes = file.read(&mut buffer)?;
        if bytes == 0 {
            break;
        }
        hasher.update(&buffer[..bytes]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Joins an archive entry name onto `base`, refusing anything that escapes it.
pub fn safe_archive_path(base: &Path, name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    let mut out = PathBuf::from(base);
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

/// Extracts every safe entry of a zip archive into `dest`, returning the file count.
pub fn extract_zip(archive_path: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    fs::create_dir_all(dest)?;

    let mut extracted = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().replace('\\', "/");
        let Some(out_path) = safe_archive_path(dest, &name) else {
            tracing::warn!("skipping unsafe archive entry {}", name);
            continue;
        };

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out_file = File::create(&out_path)?;
            io::copy(&mut entry, &mut out_file)?;
            extracted += 1;
        }
    }

    Ok(extracted)
}

/// Copies `src` into `dst` recursively, skipping top-level entries named in `skip`.
pub fn copy_dir_recursive(src: &Path, dst: &Path, skip: &[&OsStr]) -> io::Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if skip.iter().any(|item| *item == name.as_os_str()) {
            continue;
        }
        copied += copy_entry(&entry.path(), &dst.join(&name))?;
    }
    Ok(copied)
}

/// Copies a file, directory or link to `to`. Dangling links are skipped.
pub fn copy_entry(from: &Path, to: &Path) -> io::Result<u64> {
    let kind = fs::symlink_metadata(from)?.file_type();
    if kind.is_symlink() {
        return match fs::metadata(from) {
            Ok(resolved) => copy_link(from, to, &resolved),
            Err(_) => {
                tracing::warn!("skipping dangling link {}", from.display());
                Ok(0)
            }
        };
    }
    if kind.is_dir() {
        return copy_dir_recursive(from, to, &[]);
    }
    fs::copy(from, to)?;
    Ok(1)
}

/// Recreates the link itself so relative links such as a venv's `lib64 -> lib` keep working.
#[cfg(unix)]
fn copy_link(from: &Path, to: &Path, _resolved: &fs::Metadata) -> io::Result<u64> {
    std::os::unix::fs::symlink(fs::read_link(from)?, to)?;
    Ok(1)
}

#[cfg(not(unix))]
fn copy_link(from: &Path, to: &Path, resolved: &fs::Metadata) -> io::Result<u64> {
    if resolved.is_dir() {
        return copy_dir_recursive(from, to, &[]);
    }
    fs::copy(from, to)?;
    Ok(1)
}

/// Removes whatever sits at `path` without following links. Missing paths are fine.
pub fn remove_entry(path: &Path) -> io::Result<()> {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return Ok(());
    };
    if metadata.is_dir() {
        return fs::remove_dir_all(path);
    }
    match fs::remove_file(path) {
        Err(_) if metadata.file_type().is_symlink() => fs::remove_dir(path),
        result => result,
    }
}

/// Git packs and some installers leave read-only files that block deletion on Windows.
pub fn clear_readonly(path: &Path) {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return;
    };
    if metadata.is_dir() {
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                clear_readonly(&entry.path());
            }
        }
    }
    let mut permissions = metadata.permissions();
    if permissions.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        let _ = fs::set_permissions(path, permissions);
    }
}

/// Removes a directory, retrying a fixed number of times to ride out transient locks.
pub fn remove_dir_with_retry(path: &Path, attempts: u32, backoff: Duration) -> bool {
    for attempt in 1..=attempts.max(1) {
        if !path.exists() {
            return true;
        }
        match fs::remove_dir_all(path) {
            Ok(()) => return true,
            Err(err) => {
                tracing::warn!(
                    "failed to remove {} (attempt {}/{}): {}",
                    path.display(),
                    attempt,
                    attempts,
                    err
                );
                clear_readonly(path);
                thread::sleep(backoff);
            }
        }
    }
    !path.exists()
}

pub fn timestamped_backup_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let name = path
        .file_name()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_else(|| "backup".to_string());
    let stamp = now.format("%Y%m%d_%H%M%S");
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut candidate = parent.join(format!("{name}_backup_{stamp}"));
    let mut counter = 1;
    while candidate.exists() {
        candidate = parent.join(format!("{name}_backup_{stamp}_{counter}"));
        counter += 1;
    }
    candidate
}

/// Moves `path` aside to a timestamped sibling instead of deleting it.
pub fn backup_rename(path: &Path) -> io::Result<PathBuf> {
    let target = timestamped_backup_path(path, Utc::now());
    fs::rename(path, &target)?;
    tracing::info!("moved {} to {}", path.display(), target.display());
    Ok(target)
}

/// Clears the way for a fresh directory at `path`: delete with retries, else rename aside.
pub fn clear_path(path: &Path) -> bool {
    if !path.exists() {
        return true;
    }
    if path.is_file() {
        return fs::remove_file(path).is_ok() || backup_rename(path).is_ok();
    }
    if remove_dir_with_retry(path, 3, Duration::from_millis(500)) {
        return true;
    }
    match backup_rename(path) {
        Ok(_) => true,
        Err(err) => {
            tracing::error!("unable to clear {}: {}", path.display(), err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bootstrap-file-{label}-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create temp directory");
        dir
    }

    #[test]
    fn rejects_archive_entries_that_escape_the_base() {
        let base = Path::new("/srv/install");
        assert_eq!(
            safe_archive_path(base, "./lib/site.py"),
            Some(base.join("lib").join("site.py"))
        );
        assert_eq!(safe_archive_path(base, "../evil.dll"), None);
        assert_eq!(safe_archive_path(base, "/etc/passwd"), None);
    }

    #[test]
    fn backup_names_carry_timestamp_and_avoid_collisions() {
        let root = temp_dir("backup-name");
        let target = root.join("app");
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();

        let first = timestamped_backup_path(&target, now);
        assert_eq!(first, root.join("app_backup_20240506_070809"));

        fs::create_dir_all(&first).expect("occupy first candidate");
        let second = timestamped_backup_path(&target, now);
        assert_eq!(second, root.join("app_backup_20240506_070809_1"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn copies_tree_but_skips_named_entries() {
        let root = temp_dir("copy");
        let src = root.join("src");
        fs::create_dir_all(src.join("nested")).expect("create nested");
        fs::create_dir_all(src.join("backup")).expect("create skipped dir");
        fs::write(src.join("a.txt"), b"alpha").expect("write a");
        fs::write(src.join("nested").join("b.txt"), b"beta").expect("write b");
        fs::write(src.join("backup").join("old.txt"), b"old").expect("write skipped");

        let dst = root.join("dst");
        let copied = copy_dir_recursive(&src, &dst, &[OsStr::new("backup")]).expect("copy tree");

        assert_eq!(copied, 2);
        assert_eq!(fs::read(dst.join("nested").join("b.txt")).expect("read b"), b"beta");
        assert!(!dst.join("backup").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn clear_path_removes_directory_with_readonly_files() {
        let root = temp_dir("clear");
        let target = root.join("stale");
        fs::create_dir_all(&target).expect("create stale dir");
        let locked = target.join("pack.idx");
        fs::write(&locked, b"x").expect("write file");
        let mut permissions = fs::metadata(&locked).expect("metadata").permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&locked, permissions).expect("mark read-only");

        assert!(clear_path(&target));
        assert!(!target.exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn write_atomic_replaces_content() {
        let root = temp_dir("atomic");
        let path = root.join("state.json");
        write_atomic(&path, b"{\"a\":1}").expect("first write");
        write_atomic(&path, b"{\"a\":2}").expect("second write");
        assert_eq!(fs::read(&path).expect("read back"), b"{\"a\":2}");
        assert!(!path.with_extension("tmp").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn copy_keeps_directory_links_and_skips_dangling_ones() {
        use std::os::unix::fs::symlink;

        let root = temp_dir("links");
        let src = root.join("venv");
        fs::create_dir_all(src.join("lib").join("site-packages")).expect("create lib");
        fs::write(src.join("lib").join("site-packages").join("mod.py"), b"x = 1").expect("write module");
        symlink("lib", src.join("lib64")).expect("link lib64");
        symlink("missing", src.join("broken")).expect("link dangling");

        let dst = root.join("copy");
        copy_dir_recursive(&src, &dst, &[]).expect("copy venv");

        assert!(fs::symlink_metadata(dst.join("lib64"))
            .expect("lib64 copied")
            .file_type()
            .is_symlink());
        assert_eq!(
            fs::read(dst.join("lib64").join("site-packages").join("mod.py")).expect("read through link"),
            b"x = 1"
        );
        assert!(fs::symlink_metadata(dst.join("broken")).is_err());

        remove_entry(&dst.join("lib64")).expect("remove link");
        assert!(dst.join("lib").join("site-packages").join("mod.py").exists());
        let _ = fs::remove_dir_all(root);
    }
}
