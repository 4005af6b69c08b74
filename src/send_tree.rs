//! Local tree walk feeding a `SourceProtocol`
//!
//! The walk is depth first in file-name order. Directories that were
//! started are kept on a stack; whenever the next entry sits higher in the
//! tree, one end-directory is sent per level left.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::file_info::{AcceptFn, FileInfo};
use crate::logger::{Logger, TransferStats};
use crate::source::SourceProtocol;

/// Send `root` (itself a directory) and everything below it that `accept` lets through
pub fn send_tree<R: Read, W: Write>(
    proto: &mut SourceProtocol<R, W>,
    root: &Path,
    accept: &mut AcceptFn<'_>,
    logger: &dyn Logger,
    stats: &mut TransferStats,
) -> Result<()> {
    let mut open: Vec<PathBuf> = Vec::new();
    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;

        while open.len() > entry.depth() {
            close_dir(proto, &mut open, logger, stats)?;
        }

        let path = entry.path();
        let file_type = entry.file_type();
        if !file_type.is_dir() && !file_type.is_file() {
            warn!(path = %path.display(), "not a regular file or directory, skipping");
            logger.skipped(path);
            stats.add_skipped();
            continue;
        }

        let meta = entry
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let info = FileInfo::from_metadata(path, None, &meta)?;
        let parent = path.parent().unwrap_or(root);
        let accepted = accept(parent, &info)
            .with_context(|| format!("accept filter failed on {}", path.display()))?;
        if !accepted {
            debug!(path = %path.display(), "rejected by filter");
            logger.skipped(path);
            stats.add_skipped();
            if file_type.is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        if file_type.is_dir() {
            proto
                .start_directory(&info)
                .with_context(|| format!("failed to send directory {}", path.display()))?;
            open.push(path.to_path_buf());
        } else {
            let body = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
            proto
                .write_file(&info, body)
                .with_context(|| format!("failed to send {}", path.display()))?;
            logger.file_done(path, info.size());
            stats.add_file(info.size());
        }
        report_warnings(proto, logger, stats);
    }

    while !open.is_empty() {
        close_dir(proto, &mut open, logger, stats)?;
    }
    Ok(())
}

fn close_dir<R: Read, W: Write>(
    proto: &mut SourceProtocol<R, W>,
    open: &mut Vec<PathBuf>,
    logger: &dyn Logger,
    stats: &mut TransferStats,
) -> Result<()> {
    let Some(dir) = open.pop() else {
        return Ok(());
    };
    proto
        .end_directory()
        .with_context(|| format!("failed to end directory {}", dir.display()))?;
    logger.dir_done(&dir);
    stats.add_dir();
    report_warnings(proto, logger, stats);
    Ok(())
}

pub(crate) fn report_warnings<R: Read, W: Write>(
    proto: &mut SourceProtocol<R, W>,
    logger: &dyn Logger,
    stats: &mut TransferStats,
) {
    for warning in proto.take_warnings() {
        logger.warning(&warning);
        stats.add_warning(warning);
    }
}
