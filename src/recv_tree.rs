//! Rebuild a directory tree from a `SinkProtocol` message stream

use anyhow::{Context, Result};
use filetime::FileTime;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::ScpError;
use crate::file_info::{AcceptFn, FileInfo};
use crate::local_fs;
use crate::logger::{Logger, TransferStats};
use crate::protocol_core::{FileHeader, Message, TimeHeader};
use crate::sink::SinkProtocol;

/// One open start-directory
struct DirFrame {
    path: PathBuf,
    mode: u32,
    time: Option<TimeHeader>,
    /// Inside a rejected subtree; nothing is written for it
    skipped: bool,
}

/// Consume the stream until it ends, writing accepted entries under `dest`.
///
/// With `elide_root` the first start-directory stands for `dest` itself: it
/// is not created, not filter-evaluated, and its mode and times land on
/// `dest` when its end arrives.
pub fn receive_tree<R: Read, W: Write>(
    proto: &mut SinkProtocol<R, W>,
    dest: &Path,
    elide_root: bool,
    accept: &mut AcceptFn<'_>,
    logger: &dyn Logger,
    stats: &mut TransferStats,
) -> Result<()> {
    let mut frames: Vec<DirFrame> = Vec::new();
    // index of the frame whose subtree is being discarded
    let mut skip_root: Option<usize> = None;
    let mut pending_time: Option<TimeHeader> = None;
    let mut root_pending = elide_root;

    while let Some(message) = proto.read_header_or_reply()? {
        report_warnings(proto, logger, stats);
        let cur_dir = frames.last().map_or(dest, |f| f.path.as_path());

        match message {
            Message::Time(t) => pending_time = Some(t),
            Message::StartDirectory(h) => {
                let time = pending_time.take();
                if root_pending {
                    root_pending = false;
                    debug!(name = %h.name, dest = %dest.display(), "remote root maps onto destination");
                    frames.push(DirFrame {
                        path: dest.to_path_buf(),
                        mode: h.mode,
                        time,
                        skipped: false,
                    });
                    continue;
                }
                let path = cur_dir.join(&h.name);
                let skipped = if skip_root.is_some() {
                    true
                } else {
                    let info = header_info(&h.name, 0, h.mode, true, time.as_ref());
                    let accepted = accept(cur_dir, &info)
                        .with_context(|| format!("accept filter failed on {}", path.display()))?;
                    if accepted {
                        local_fs::create_dir(&path, h.mode)?;
                    } else {
                        debug!(path = %path.display(), "directory rejected, skipping subtree");
                        logger.skipped(&path);
                        stats.add_skipped();
                        skip_root = Some(frames.len());
                    }
                    !accepted
                };
                frames.push(DirFrame {
                    path,
                    mode: h.mode,
                    time,
                    skipped,
                });
            }
            Message::EndDirectory => {
                pending_time = None;
                let frame = frames.pop().ok_or(ScpError::UnbalancedEnd)?;
                if frame.skipped {
                    if skip_root == Some(frames.len()) {
                        skip_root = None;
                    }
                } else {
                    finish_dir(&frame, logger, stats)?;
                }
            }
            Message::File(h) => {
                let time = pending_time.take();
                let path = cur_dir.join(&h.name);
                if skip_root.is_some() {
                    proto.copy_file_body_to(&h, &mut io::sink())?;
                    continue;
                }
                let info = header_info(&h.name, h.size, h.mode, false, time.as_ref());
                let accepted = accept(cur_dir, &info)
                    .with_context(|| format!("accept filter failed on {}", path.display()))?;
                if accepted {
                    let bytes = receive_into_file(proto, &path, &h, time.as_ref())?;
                    logger.file_done(&path, bytes);
                    stats.add_file(bytes);
                } else {
                    debug!(path = %path.display(), "file rejected, draining body");
                    proto.copy_file_body_to(&h, &mut io::sink())?;
                    logger.skipped(&path);
                    stats.add_skipped();
                }
            }
            Message::Reply(_) => {}
        }
    }
    report_warnings(proto, logger, stats);

    if !frames.is_empty() {
        warn!(open = frames.len(), "stream ended inside open directories");
        while let Some(frame) = frames.pop() {
            if !frame.skipped {
                finish_dir(&frame, logger, stats)?;
            }
        }
    }
    Ok(())
}

/// Create `path`, stream the announced body into it, then apply mode and times
pub(crate) fn receive_into_file<R: Read, W: Write>(
    proto: &mut SinkProtocol<R, W>,
    path: &Path,
    header: &FileHeader,
    time: Option<&TimeHeader>,
) -> Result<u64> {
    let mut file = local_fs::create_file(path, header.mode)?;
    let bytes = proto
        .copy_file_body_to(header, &mut file)
        .with_context(|| format!("failed to receive {}", path.display()))?;
    drop(file);
    local_fs::apply_metadata(path, header.mode, time)?;
    Ok(bytes)
}

pub(crate) fn report_warnings<R: Read, W: Write>(
    proto: &mut SinkProtocol<R, W>,
    logger: &dyn Logger,
    stats: &mut TransferStats,
) {
    for warning in proto.take_warnings() {
        logger.warning(&warning);
        stats.add_warning(warning);
    }
}

fn finish_dir(frame: &DirFrame, logger: &dyn Logger, stats: &mut TransferStats) -> Result<()> {
    local_fs::apply_metadata(&frame.path, frame.mode, frame.time.as_ref())?;
    logger.dir_done(&frame.path);
    stats.add_dir();
    Ok(())
}

fn header_info(name: &str, size: u64, mode: u32, is_dir: bool, time: Option<&TimeHeader>) -> FileInfo {
    let (mtime, atime) = time.map_or((FileTime::zero(), FileTime::zero()), |t| (t.mtime, t.atime));
    if is_dir {
        FileInfo::new_dir(name, mode, mtime, atime)
    } else {
        FileInfo::new(name, size, mode, mtime, atime)
    }
}
