//! Safety validation for materializing untrusted archives during restore.
//!
//! The remote runner applies these checks before any extracted member is
//! written to disk. Every entry must resolve inside the destination root,
//! must not pass through a symlinked directory delivered earlier in the same
//! archive, and must be a regular file or plain directory. A single bad
//! entry fails the whole restore.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    HardLink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
            EntryKind::Symlink => "symlink",
            EntryKind::HardLink => "hard link",
            EntryKind::CharDevice => "character device",
            EntryKind::BlockDevice => "block device",
            EntryKind::Fifo => "fifo",
            EntryKind::Socket => "socket",
        }
    }
}

/// One member of an archive, as seen before extraction.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
}

impl ArchiveEntry {
    pub fn new(path: impl Into<PathBuf>, kind: EntryKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveViolation {
    #[error("entry '{}' has an absolute path", path.display())]
    AbsolutePath { path: PathBuf },
    #[error("entry '{}' escapes the destination root", path.display())]
    PathEscape { path: PathBuf },
    #[error("entry '{}' passes through '{}', which is a symlink from this archive", path.display(), ancestor.display())]
    SymlinkAncestor { path: PathBuf, ancestor: PathBuf },
    #[error("entry '{}' is a {}; only regular files and directories are allowed", path.display(), kind.as_str())]
    ForbiddenKind { path: PathBuf, kind: EntryKind },
}

/// Stateful validator for one archive. Entries must be checked in archive
/// order so that symlinks planted at intermediate directories are known
/// before anything beneath them is considered.
pub struct ArchiveGuard {
    dest_root: PathBuf,
    /// Relative paths of symlink entries seen so far.
    symlinks: HashSet<PathBuf>,
}

impl ArchiveGuard {
    pub fn new(dest_root: impl Into<PathBuf>) -> Self {
        Self {
            dest_root: dest_root.into(),
            symlinks: HashSet::new(),
        }
    }

    /// Validate one entry, returning the safe on-disk destination path.
    ///
    /// Symlink entries are rejected but still recorded, so a later entry
    /// beneath one is caught even if a caller chose to skip rather than
    /// abort on the first rejection.
    pub fn check(&mut self, entry: &ArchiveEntry) -> Result<PathBuf, ArchiveViolation> {
        let relative = normalize(&entry.path)?;

        for ancestor in relative.ancestors().skip(1) {
            if !ancestor.as_os_str().is_empty() && self.symlinks.contains(ancestor) {
                return Err(ArchiveViolation::SymlinkAncestor {
                    path: entry.path.clone(),
                    ancestor: ancestor.to_path_buf(),
                });
            }
        }

        match entry.kind {
            EntryKind::File | EntryKind::Directory => Ok(self.dest_root.join(relative)),
            EntryKind::Symlink => {
                self.symlinks.insert(relative);
                Err(ArchiveViolation::ForbiddenKind {
                    path: entry.path.clone(),
                    kind: entry.kind,
                })
            }
            kind => Err(ArchiveViolation::ForbiddenKind {
                path: entry.path.clone(),
                kind,
            }),
        }
    }
}

/// Validate a whole archive against a destination root. The first violation
/// fails the archive; there is no partial acceptance.
pub fn validate_archive(
    dest_root: impl Into<PathBuf>,
    entries: &[ArchiveEntry],
) -> Result<Vec<PathBuf>, ArchiveViolation> {
    let mut guard = ArchiveGuard::new(dest_root);
    let mut resolved = Vec::with_capacity(entries.len());
    for entry in entries {
        resolved.push(guard.check(entry)?);
    }
    Ok(resolved)
}

/// Lexically resolve an entry path. `.` is dropped, `..` pops; popping past
/// the root or starting absolute is a violation.
fn normalize(path: &Path) -> Result<PathBuf, ArchiveViolation> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(ArchiveViolation::PathEscape {
                        path: path.to_path_buf(),
                    });
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveViolation::AbsolutePath {
                    path: path.to_path_buf(),
                });
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str) -> ArchiveEntry {
        ArchiveEntry::new(path, EntryKind::File)
    }

    fn dir(path: &str) -> ArchiveEntry {
        ArchiveEntry::new(path, EntryKind::Directory)
    }

    #[test]
    fn benign_entries_resolve_under_root() {
        let entries = vec![dir("data"), file("data/db.sqlite3"), file("config.toml")];
        let resolved = validate_archive("/srv/restore", &entries).unwrap();
        assert_eq!(resolved[1], PathBuf::from("/srv/restore/data/db.sqlite3"));
    }

    #[test]
    fn traversal_is_rejected() {
        let err = validate_archive("/srv/restore", &[file("../../etc/passwd")]).unwrap_err();
        assert!(matches!(err, ArchiveViolation::PathEscape { .. }));
    }

    #[test]
    fn interior_dotdot_that_stays_inside_is_allowed() {
        let resolved = validate_archive("/srv/restore", &[file("a/../b.txt")]).unwrap();
        assert_eq!(resolved[0], PathBuf::from("/srv/restore/b.txt"));
    }

    #[test]
    fn absolute_path_is_rejected() {
        let err = validate_archive("/srv/restore", &[file("/etc/passwd")]).unwrap_err();
        assert!(matches!(err, ArchiveViolation::AbsolutePath { .. }));
    }

    #[test]
    fn symlink_entry_is_rejected() {
        let err =
            validate_archive("/srv/restore", &[ArchiveEntry::new("data", EntryKind::Symlink)])
                .unwrap_err();
        assert!(matches!(
            err,
            ArchiveViolation::ForbiddenKind {
                kind: EntryKind::Symlink,
                ..
            }
        ));
    }

    #[test]
    fn entry_under_planted_symlink_is_rejected() {
        let mut guard = ArchiveGuard::new("/srv/restore");

        // The symlink itself is rejected, but the guard remembers it.
        assert!(guard
            .check(&ArchiveEntry::new("data", EntryKind::Symlink))
            .is_err());

        let err = guard.check(&file("data/secrets.txt")).unwrap_err();
        match err {
            ArchiveViolation::SymlinkAncestor { ancestor, .. } => {
                assert_eq!(ancestor, PathBuf::from("data"));
            }
            other => panic!("expected SymlinkAncestor, got {other:?}"),
        }
    }

    #[test]
    fn deep_descendant_of_symlink_is_rejected() {
        let mut guard = ArchiveGuard::new("/srv/restore");
        let _ = guard.check(&ArchiveEntry::new("a/b", EntryKind::Symlink));
        assert!(matches!(
            guard.check(&file("a/b/c/d.txt")),
            Err(ArchiveViolation::SymlinkAncestor { .. })
        ));
    }

    #[test]
    fn device_nodes_and_fifos_are_rejected() {
        for kind in [
            EntryKind::CharDevice,
            EntryKind::BlockDevice,
            EntryKind::Fifo,
            EntryKind::Socket,
            EntryKind::HardLink,
        ] {
            let err = validate_archive("/srv/restore", &[ArchiveEntry::new("dev/x", kind)])
                .unwrap_err();
            assert!(matches!(err, ArchiveViolation::ForbiddenKind { .. }));
        }
    }

    #[test]
    fn one_bad_entry_fails_the_whole_archive() {
        let mut entries: Vec<ArchiveEntry> = (0..99).map(|i| file(&format!("f{i}.txt"))).collect();
        entries.push(ArchiveEntry::new("dev/null", EntryKind::CharDevice));
        assert!(validate_archive("/srv/restore", &entries).is_err());
    }
}
