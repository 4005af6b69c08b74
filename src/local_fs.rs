//! Local filesystem helpers used when writing received files and directories

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;

use crate::protocol_core::TimeHeader;

/// Owner bits added while a directory is being filled
const OWNER_RWX: u32 = 0o700;

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("failed to create directory {}", path.display()))?;
    }
    Ok(())
}

/// Create one directory level, writable by us until its final mode is applied.
/// An existing directory is reused.
pub fn create_dir(path: &Path, mode: u32) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists && path.is_dir() => {}
        Err(e) => {
            return Err(e).with_context(|| format!("failed to create directory {}", path.display()))
        }
    }
    set_mode(path, mode | OWNER_RWX)
}

/// Create or truncate a file for writing
pub fn create_file(path: &Path, mode: u32) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    options
        .open(path)
        .with_context(|| format!("failed to create file {}", path.display()))
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to chmod {:o} {}", mode, path.display()))
}

#[cfg(not(unix))]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

pub fn set_times(path: &Path, time: &TimeHeader) -> Result<()> {
    filetime::set_file_times(path, time.atime, time.mtime)
        .with_context(|| format!("failed to set times on {}", path.display()))
}

/// Apply mode, then times. Both are attempted even if the first fails.
pub fn apply_metadata(path: &Path, mode: u32, time: Option<&TimeHeader>) -> Result<()> {
    let mode_result = set_mode(path, mode);
    let time_result = match time {
        Some(t) => set_times(path, t),
        None => Ok(()),
    };
    match (mode_result, time_result) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Err(mode_err), Err(time_err)) => Err(anyhow!("{:#}; {:#}", mode_err, time_err)),
    }
}
