use crate::types::FileStat;
use crate::{Error, Result};
use globset::{Glob, GlobBuilder, GlobMatcher};
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// One compiled include/exclude pattern. Patterns without a `/` match the
/// base name of any path component; the rest match the path from the scan
/// root, written with a leading `/`.
#[derive(Debug, Clone)]
struct Pattern {
    matcher: GlobMatcher,
    base_name: bool,
    literal_prefix: PathBuf,
}

impl Pattern {
    fn compile(pattern: &str) -> Result<Self> {
        let base_name = !pattern.contains('/');
        let glob = if base_name {
            Glob::new(pattern)
        } else {
            let anchored = if pattern.starts_with('/') {
                pattern.trim_end_matches('/').to_string()
            } else {
                format!("/{}", pattern.trim_end_matches('/'))
            };
            GlobBuilder::new(&anchored).literal_separator(true).build()
        }
        .map_err(|e| Error::Config(format!("invalid pattern '{}': {}", pattern, e)))?;

        let literal_prefix = if base_name {
            PathBuf::new()
        } else {
            Path::new(glob.glob())
                .components()
                .take_while(|c| !is_glob_component(c))
                .collect()
        };

        Ok(Self {
            matcher: glob.compile_matcher(),
            base_name,
            literal_prefix,
        })
    }

    /// True if `path` or one of its ancestors matches.
    fn matches(&self, path: &Path) -> bool {
        path.ancestors()
            .filter(|p| p.parent().is_some())
            .any(|p| {
                if self.base_name {
                    p.file_name().is_some_and(|name| self.matcher.is_match(name))
                } else {
                    self.matcher.is_match(p)
                }
            })
    }

    /// True if something below `dir` could match.
    fn could_match_below(&self, dir: &Path) -> bool {
        self.base_name
            || self.literal_prefix.starts_with(dir)
            || dir.starts_with(&self.literal_prefix)
    }
}

fn is_glob_component(component: &Component<'_>) -> bool {
    component
        .as_os_str()
        .to_string_lossy()
        .contains(['*', '?', '[', '{'])
}

/// Include/exclude glob sets. Exclude wins when both match; an empty
/// include set includes everything.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
}

impl ScanFilter {
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self> {
        Ok(Self {
            includes: includes.iter().map(|p| Pattern::compile(p)).collect::<Result<_>>()?,
            excludes: excludes.iter().map(|p| Pattern::compile(p)).collect::<Result<_>>()?,
        })
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        self.excludes.iter().any(|p| p.matches(path))
    }

    pub fn is_included(&self, path: &Path) -> bool {
        !self.is_excluded(path)
            && (self.includes.is_empty() || self.includes.iter().any(|p| p.matches(path)))
    }

    /// True for directories leading to an anchored include, such as `/home`
    /// and `/home/user` for `/home/user/**`. They are kept so their stat
    /// can be restored.
    fn leads_to_include(&self, dir: &Path) -> bool {
        !self.is_excluded(dir)
            && self
                .includes
                .iter()
                .any(|p| !p.base_name && p.literal_prefix.starts_with(dir))
    }

    fn should_descend(&self, dir: &Path) -> bool {
        !self.is_excluded(dir)
            && (self.includes.is_empty()
                || self
                    .includes
                    .iter()
                    .any(|p| p.matches(dir) || p.could_match_below(dir)))
    }
}

#[derive(Debug, Clone)]
pub struct ScanEntry {
    /// Location on disk.
    pub path: PathBuf,
    /// Path relative to the scan root, with a leading `/`.
    pub relative: PathBuf,
    pub stat: FileStat,
    pub symlink_target: Option<PathBuf>,
}

impl ScanEntry {
    pub fn relative_bytes(&self) -> Vec<u8> {
        path_bytes(&self.relative)
    }
}

#[cfg(unix)]
pub fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
pub fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().replace('\\', "/").into_bytes()
}

pub fn stat_from_metadata(metadata: &Metadata) -> FileStat {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        FileStat {
            size: metadata.len(),
            mtime_ns: metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec(),
            ctime_ns: metadata.ctime() * 1_000_000_000 + metadata.ctime_nsec(),
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            dev: metadata.dev(),
            ino: metadata.ino(),
            nlink: metadata.nlink(),
        }
    }

    #[cfg(not(unix))]
    {
        let file_type = metadata.file_type();
        let mode = if file_type.is_dir() {
            0o040755
        } else if file_type.is_symlink() {
            0o120777
        } else {
            0o100644
        };
        let mtime_ns = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        FileStat {
            size: metadata.len(),
            mtime_ns,
            mode,
            nlink: 1,
            ..Default::default()
        }
    }
}

/// Lazily walks a root directory. Each call to `scan` starts a fresh walk.
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    filter: ScanFilter,
}

impl Scanner {
    pub fn new<P: AsRef<Path>>(root: P, filter: ScanFilter) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            filter,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative(&self, path: &Path) -> PathBuf {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        Path::new("/").join(rel)
    }

    /// Directories that cannot be read are logged and skipped.
    pub fn scan(&self) -> impl Iterator<Item = ScanEntry> + '_ {
        WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || self.filter.should_descend(&self.relative(entry.path()))
            })
            .filter_map(move |entry| match entry {
                Ok(entry) => self.to_scan_entry(entry),
                Err(e) => {
                    warn!(
                        path = ?e.path().map(Path::display).map(|d| d.to_string()),
                        error = %e,
                        "Skipping unreadable entry"
                    );
                    None
                }
            })
    }

    fn to_scan_entry(&self, entry: DirEntry) -> Option<ScanEntry> {
        if entry.depth() == 0 {
            return None;
        }
        let relative = self.relative(entry.path());
        let kept = self.filter.is_included(&relative)
            || (entry.file_type().is_dir() && self.filter.leads_to_include(&relative));
        if !kept {
            return None;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Skipping entry without metadata");
                return None;
            }
        };
        let symlink_target = if entry.file_type().is_symlink() {
            std::fs::read_link(entry.path()).ok()
        } else {
            None
        };

        debug!(path = %relative.display(), "Scanned");
        Some(ScanEntry {
            path: entry.into_path(),
            relative,
            stat: stat_from_metadata(&metadata),
            symlink_target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, rel.as_bytes()).unwrap();
    }

    fn files(scanner: &Scanner) -> Vec<String> {
        scanner
            .scan()
            .filter(|e| e.stat.is_file())
            .map(|e| e.relative.display().to_string())
            .collect()
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for rel in [
            "home/a.txt",
            "home/b.tmp",
            "home/user/c.txt",
            "home/user/deep/d.tmp",
            "homework/e.txt",
            "etc/f.conf",
            "top.txt",
        ] {
            touch(dir.path(), rel);
        }
        dir
    }

    #[test]
    fn test_include_home_exclude_tmp() {
        let dir = tree();
        let filter = ScanFilter::new(&["/home".to_string()], &["*.tmp".to_string()]).unwrap();
        let scanner = Scanner::new(dir.path(), filter);
        assert_eq!(files(&scanner), vec!["/home/a.txt", "/home/user/c.txt"]);
    }

    #[test]
    fn test_directories_above_an_include_are_kept() {
        let dir = tree();
        let filter = ScanFilter::new(&["/home/user/**".to_string()], &[]).unwrap();
        let scanner = Scanner::new(dir.path(), filter);
        let dirs: Vec<String> = scanner
            .scan()
            .filter(|e| e.stat.is_dir())
            .map(|e| e.relative.display().to_string())
            .collect();
        assert_eq!(dirs, vec!["/home", "/home/user", "/home/user/deep"]);
        assert_eq!(
            files(&scanner),
            vec!["/home/user/c.txt", "/home/user/deep/d.tmp"]
        );
    }

    #[test]
    fn test_no_patterns_yields_everything() {
        let dir = tree();
        let scanner = Scanner::new(dir.path(), ScanFilter::default());
        assert_eq!(files(&scanner).len(), 7);
        assert!(scanner.scan().any(|e| e.stat.is_dir() && e.relative == Path::new("/home")));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let dir = tree();
        let filter =
            ScanFilter::new(&["*.txt".to_string()], &["/home/user".to_string()]).unwrap();
        let scanner = Scanner::new(dir.path(), filter);
        assert_eq!(
            files(&scanner),
            vec!["/home/a.txt", "/homework/e.txt", "/top.txt"]
        );
    }

    #[test]
    fn test_bare_pattern_matches_directory_names_at_any_depth() {
        let dir = tree();
        let filter = ScanFilter::new(&[], &["user".to_string()]).unwrap();
        let scanner = Scanner::new(dir.path(), filter);
        assert!(files(&scanner).iter().all(|p| !p.contains("/user/")));
    }

    #[test]
    fn test_scan_is_restartable() {
        let dir = tree();
        let scanner = Scanner::new(dir.path(), ScanFilter::default());
        assert_eq!(files(&scanner), files(&scanner));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        assert!(matches!(
            ScanFilter::new(&["a[".to_string()], &[]),
            Err(Error::Config(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_directory_does_not_abort_scan() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tree();
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("secret.txt"), b"x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        let scanner = Scanner::new(dir.path(), ScanFilter::default());
        let found = files(&scanner);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert!(found.contains(&"/top.txt".to_string()));
        assert!(found.contains(&"/home/user/c.txt".to_string()));
    }
}
