//! Lazily walks a directory tree, yielding every entry depth-first with
//! its full path and `stat` information, skipping anything matching an
//! exclude fragment.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gletscher_core::catalog::Stat;

pub struct ScannedEntry {
    pub path: PathBuf,
    pub stat: Stat,
    /// Present only for symlinks.
    pub link_target: Option<Vec<u8>>,
}

/// Recursively scan `root`, skipping any entry whose path contains one of
/// `excludes` as a substring. Directories are yielded before their
/// children; symlinks are yielded as-is, never followed.
///
/// A single unreadable entry (permission denied, dangling mount, a race
/// with something deleting the tree under us) is logged and skipped —
/// it does not abort the rest of the walk. Only a failure to read `root`
/// itself is fatal, since there's nothing left to scan past that.
pub fn scan(root: &Path, excludes: &[String]) -> Result<Vec<ScannedEntry>> {
    let mut out = Vec::new();
    scan_into(root, excludes, &mut out);
    if out.is_empty() {
        // Confirm root itself was actually reachable, rather than silently
        // returning nothing for a typo'd path.
        std::fs::symlink_metadata(root).with_context(|| format!("stat {}", root.display()))?;
    }
    Ok(out)
}

fn scan_into(path: &Path, excludes: &[String], out: &mut Vec<ScannedEntry>) {
    let rendered = path.to_string_lossy();
    if excludes.iter().any(|pattern| rendered.contains(pattern.as_str())) {
        return;
    }

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("skipping {}: {}", path.display(), e);
            return;
        }
    };
    let stat = Stat::from_metadata(&metadata);

    if stat.is_link() {
        match std::fs::read_link(path) {
            Ok(target) => out.push(ScannedEntry {
                path: path.to_path_buf(),
                stat,
                link_target: Some(path_to_bytes(&target)),
            }),
            Err(e) => log::warn!("skipping link {}: {}", path.display(), e),
        }
        return;
    }

    out.push(ScannedEntry {
        path: path.to_path_buf(),
        stat,
        link_target: None,
    });

    if stat.is_directory() {
        let entries = match std::fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("skipping directory {}: {}", path.display(), e);
                return;
            }
        };
        let mut children: Vec<PathBuf> = Vec::new();
        for entry in entries {
            match entry {
                Ok(entry) => children.push(entry.path()),
                Err(e) => log::warn!("skipping entry in {}: {}", path.display(), e),
            }
        }
        children.sort();
        for child in children {
            scan_into(&child, excludes, out);
        }
    }
}

fn path_to_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_nested_directories_and_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"world").unwrap();

        let entries = scan(dir.path(), &[]).unwrap();
        let names: Vec<_> = entries
            .iter()
            .map(|e| e.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.contains(&"a.txt".to_string()));
        assert!(names.contains(&"sub".to_string()));
        assert!(names.contains(&"b.txt".to_string()));
    }

    #[test]
    fn excludes_matching_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("skip.tmp"), b"x").unwrap();

        let entries = scan(dir.path(), &[".tmp".to_string()]).unwrap();
        let names: Vec<_> = entries
            .iter()
            .map(|e| e.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.contains(&"keep.txt".to_string()));
        assert!(!names.contains(&"skip.tmp".to_string()));
    }
}
