use anyhow::{anyhow, Result};
use filetime::FileTime;
use std::fs::Metadata;
use std::path::Path;

use crate::protocol::PERM_MASK;

/// Transfer-level descriptor of one file or directory.
///
/// `name` is a base name only. `size` is 0 for directories. Times carry
/// whole seconds; the wire format has no room for more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    name: String,
    size: u64,
    mode: u32,
    is_dir: bool,
    mtime: FileTime,
    atime: FileTime,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, size: u64, mode: u32, mtime: FileTime, atime: FileTime) -> Self {
        Self {
            name: name.into(),
            size,
            mode: mode & PERM_MASK,
            is_dir: false,
            mtime: whole_seconds(mtime),
            atime: whole_seconds(atime),
        }
    }

    pub fn new_dir(name: impl Into<String>, mode: u32, mtime: FileTime, atime: FileTime) -> Self {
        Self {
            is_dir: true,
            ..Self::new(name, 0, mode, mtime, atime)
        }
    }

    /// Build from local metadata; `name` overrides the path's own base name when given
    pub fn from_metadata(path: &Path, name: Option<&str>, meta: &Metadata) -> Result<Self> {
        let name = match name {
            Some(n) => n.to_string(),
            None => base_name(path)?,
        };
        let mtime = FileTime::from_last_modification_time(meta);
        let atime = FileTime::from_last_access_time(meta);
        let mode = mode_of(meta);
        if meta.is_dir() {
            Ok(Self::new_dir(name, mode, mtime, atime))
        } else {
            Ok(Self::new(name, meta.len(), mode, mtime, atime))
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        if self.is_dir {
            0
        } else {
            self.size
        }
    }

    /// Permission bits, without the directory flag
    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn mtime(&self) -> FileTime {
        self.mtime
    }

    pub fn atime(&self) -> FileTime {
        self.atime
    }
}

/// Accept filter: `(parent directory, entry) -> keep?`. Rejecting a
/// directory rejects everything beneath it. An error aborts the transfer.
pub type AcceptFn<'a> = dyn FnMut(&Path, &FileInfo) -> Result<bool> + 'a;

/// Filter used when the caller supplies none
pub fn accept_any(_parent: &Path, _info: &FileInfo) -> Result<bool> {
    Ok(true)
}

fn whole_seconds(t: FileTime) -> FileTime {
    FileTime::from_unix_time(t.unix_seconds(), 0)
}

/// Base name of a local path as UTF-8; wire names are text
pub fn base_name(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("path has no file name: {}", path.display()))?;
    name.to_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("file name is not valid UTF-8: {}", path.display()))
}

#[cfg(unix)]
fn mode_of(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & PERM_MASK
}

#[cfg(not(unix))]
fn mode_of(meta: &Metadata) -> u32 {
    let base = if meta.is_dir() { 0o755 } else { 0o644 };
    if meta.permissions().readonly() {
        base & !0o222
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_subsecond_times_are_dropped() {
        let info = FileInfo::new(
            "a.txt",
            3,
            0o100644,
            FileTime::from_unix_time(1_700_000_000, 999),
            FileTime::from_unix_time(1_700_000_100, 5),
        );
        assert_eq!(info.mtime(), FileTime::from_unix_time(1_700_000_000, 0));
        assert_eq!(info.atime().nanoseconds(), 0);
        assert_eq!(info.mode(), 0o644);
    }

    #[test]
    fn test_directory_size_is_zero() {
        let t = FileTime::from_unix_time(0, 0);
        let info = FileInfo::new_dir("d", 0o755, t, t);
        assert!(info.is_dir());
        assert_eq!(info.size(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_from_metadata() {
        use std::os::unix::fs::PermissionsExt;
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.bin");
        fs::write(&path, b"hello").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();
        let mtime = FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_times(&path, mtime, mtime).unwrap();

        let meta = fs::metadata(&path).unwrap();
        let info = FileInfo::from_metadata(&path, None, &meta).unwrap();
        assert_eq!(info.name(), "data.bin");
        assert_eq!(info.size(), 5);
        assert_eq!(info.mode(), 0o640);
        assert_eq!(info.mtime(), mtime);
        assert!(!info.is_dir());
    }
}
