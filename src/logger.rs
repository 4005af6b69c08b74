use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use crate::session::Direction;

/// Transfer observer. Every hook defaults to doing nothing.
pub trait Logger: Send + Sync {
    fn start(&self, _direction: Direction, _remote: &str, _local: &Path) {}
    fn file_done(&self, _path: &Path, _bytes: u64) {}
    fn dir_done(&self, _path: &Path) {}
    /// Entry rejected by the accept filter (or not transferable)
    fn skipped(&self, _path: &Path) {}
    /// Non-fatal message reported by the remote scp
    fn warning(&self, _message: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn start(&self, direction: Direction, remote: &str, local: &Path) {
        self.line(&format!(
            "START dir={} remote={} local={}",
            direction,
            remote,
            local.display()
        ));
    }
    fn file_done(&self, path: &Path, bytes: u64) {
        self.line(&format!("FILE path={} bytes={}", path.display(), bytes));
    }
    fn dir_done(&self, path: &Path) {
        self.line(&format!("DIR path={}", path.display()));
    }
    fn skipped(&self, path: &Path) {
        self.line(&format!("SKIP path={}", path.display()));
    }
    fn warning(&self, message: &str) {
        self.line(&format!("WARN msg={}", message));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} msg={}", context, msg));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}

/// Running totals for one top-level transfer
#[derive(Debug, Clone)]
pub struct TransferStats {
    pub files: u64,
    pub bytes: u64,
    pub dirs: u64,
    pub skipped: u64,
    pub warnings: Vec<String>,
    started: Instant,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            files: 0,
            bytes: 0,
            dirs: 0,
            skipped: 0,
            warnings: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn add_file(&mut self, bytes: u64) {
        self.files += 1;
        self.bytes += bytes;
    }

    pub fn add_dir(&mut self) {
        self.dirs += 1;
    }

    pub fn add_skipped(&mut self) {
        self.skipped += 1;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
