//! Public transfer operations

use anyhow::{bail, Context, Result};
use filetime::FileTime;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::cancel::CancelToken;
use crate::config::ScpConfig;
use crate::file_info::{accept_any, AcceptFn, FileInfo};
use crate::local_fs;
use crate::logger::{Logger, NoopLogger, TransferStats};
use crate::protocol_core::{FileHeader, TimeHeader};
use crate::recv_tree::{self, receive_into_file, receive_tree};
use crate::send_tree::{self, send_tree};
use crate::session::{Direction, ScpSession, SessionOptions};
use crate::shell::remote_base_name;
use crate::sink::SinkProtocol;
use crate::source::SourceProtocol;
use crate::transport::{RemoteReader, RemoteShell, RemoteWriter};

type RemoteSource = SourceProtocol<RemoteReader, RemoteWriter>;
type RemoteSink = SinkProtocol<RemoteReader, RemoteWriter>;

/// SCP client over a remote shell.
///
/// Each operation opens its own session and closes it before returning.
pub struct Scp<S: RemoteShell> {
    shell: S,
    config: ScpConfig,
    cancel: CancelToken,
    logger: Arc<dyn Logger>,
}

impl<S: RemoteShell> Scp<S> {
    pub fn new(shell: S) -> Self {
        Self {
            shell,
            config: ScpConfig::default(),
            cancel: CancelToken::new(),
            logger: Arc::new(NoopLogger),
        }
    }

    pub fn with_config(mut self, config: ScpConfig) -> Self {
        self.config = config;
        self
    }

    /// Firing `cancel` aborts whatever transfer is running and every later one
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &ScpConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Copy one remote file into `dest` and describe what was received
    pub fn receive<D: Write + ?Sized>(&self, src: &str, dest: &mut D) -> Result<FileInfo> {
        let name = remote_base_name(src);
        self.sink_session(src, Path::new("-"), false, |proto, stats| {
            let (time, header) = read_file_headers(proto, self.config.preserve)?;
            let bytes = proto
                .copy_file_body_to(&header, dest)
                .context("failed to copy file")?;
            stats.add_file(bytes);
            let (mtime, atime) = times_or_zero(time.as_ref());
            Ok(FileInfo::new(name, header.size, header.mode, mtime, atime))
        })
        .with_context(|| format!("failed to receive {}", src))
    }

    /// Copy one remote file to a local path. If `dest` is an existing
    /// directory the file lands inside it under the remote base name.
    pub fn receive_file(&self, src: &str, dest: &Path) -> Result<()> {
        let target = match fs::metadata(dest) {
            Ok(meta) if meta.is_dir() => dest.join(remote_base_name(src)),
            Ok(_) => dest.to_path_buf(),
            Err(e) if e.kind() == ErrorKind::NotFound => dest.to_path_buf(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to stat destination {}", dest.display()))
            }
        };

        self.sink_session(src, &target, false, |proto, stats| {
            let (time, header) = read_file_headers(proto, self.config.preserve)?;
            let bytes = receive_into_file(proto, &target, &header, time.as_ref())?;
            self.logger.file_done(&target, bytes);
            stats.add_file(bytes);
            Ok(())
        })
        .with_context(|| format!("failed to receive {} to {}", src, target.display()))
    }

    /// Copy a remote directory tree to `dest`.
    ///
    /// A missing `dest` is created and becomes the copy of `src`; an existing
    /// directory gets the copy nested under the remote base name.
    pub fn receive_dir(&self, src: &str, dest: &Path, accept: Option<&mut AcceptFn<'_>>) -> Result<()> {
        let elide_root = match fs::metadata(dest) {
            Ok(meta) if meta.is_dir() => false,
            Ok(_) => bail!("destination {} exists and is not a directory", dest.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                local_fs::ensure_dir_exists(dest)?;
                true
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to stat destination {}", dest.display()))
            }
        };

        let mut default_accept = accept_any;
        let accept: &mut AcceptFn<'_> = match accept {
            Some(f) => f,
            None => &mut default_accept,
        };
        self.sink_session(src, dest, true, |proto, stats| {
            receive_tree(proto, dest, elide_root, accept, &*self.logger, stats)
        })
        .with_context(|| format!("failed to receive directory {} to {}", src, dest.display()))
    }

    /// Copy `body` to the remote path `dest`, described by `info`.
    /// `body` must yield exactly `info.size()` bytes and is dropped afterwards.
    ///
    /// An existing remote directory `dest` receives the file as
    /// `dest/<info.name()>`; any other `dest` is the final file path and
    /// `info.name()` is only carried in the header.
    pub fn send<B: Read>(&self, info: &FileInfo, body: B, dest: &str) -> Result<()> {
        if info.is_dir() {
            bail!("cannot send directory {} as a file", info.name());
        }
        self.source_session(dest, Path::new(info.name()), false, |proto, stats| {
            proto.write_file(info, body).context("failed to copy file")?;
            stats.add_file(info.size());
            Ok(())
        })
        .with_context(|| format!("failed to send {} to {}", info.name(), dest))
    }

    /// Copy one local file to the remote path `dest`
    pub fn send_file(&self, src: &Path, dest: &str) -> Result<()> {
        let meta = fs::metadata(src).with_context(|| format!("failed to stat source file {}", src.display()))?;
        if !meta.is_file() {
            bail!("source {} is not a regular file", src.display());
        }
        let info = FileInfo::from_metadata(src, None, &meta)?;
        let body = File::open(src).with_context(|| format!("failed to open source file {}", src.display()))?;
        self.source_session(dest, src, false, |proto, stats| {
            proto.write_file(&info, body).context("failed to copy file")?;
            self.logger.file_done(src, info.size());
            stats.add_file(info.size());
            Ok(())
        })
        .with_context(|| format!("failed to send {} to {}", src.display(), dest))
    }

    /// Copy a local directory tree to the remote path `dest`.
    ///
    /// Filtering happens before anything is read: rejected files are never
    /// opened and rejected directories are not descended into.
    pub fn send_dir(&self, src: &Path, dest: &str, accept: Option<&mut AcceptFn<'_>>) -> Result<()> {
        let root: PathBuf = fs::canonicalize(src)
            .with_context(|| format!("failed to resolve source directory {}", src.display()))?;
        if !root.is_dir() {
            bail!("source {} is not a directory", src.display());
        }

        let mut default_accept = accept_any;
        let accept: &mut AcceptFn<'_> = match accept {
            Some(f) => f,
            None => &mut default_accept,
        };
        self.source_session(dest, &root, true, |proto, stats| {
            send_tree(proto, &root, accept, &*self.logger, stats)
        })
        .with_context(|| format!("failed to send directory {} to {}", src.display(), dest))
    }

    fn source_session<T>(
        &self,
        remote: &str,
        local: &Path,
        recursive: bool,
        f: impl FnOnce(&mut RemoteSource, &mut TransferStats) -> Result<T>,
    ) -> Result<T> {
        let buffer_size = self.config.effective_buffer_size();
        let preserve = self.config.preserve;
        self.transfer(Direction::Send, remote, local, recursive, |reader, writer, stats| {
            let mut proto = SourceProtocol::new(reader, writer, buffer_size, preserve)
                .context("remote scp did not become ready")?;
            let result = f(&mut proto, stats);
            send_tree::report_warnings(&mut proto, &*self.logger, stats);
            result
        })
    }

    fn sink_session<T>(
        &self,
        remote: &str,
        local: &Path,
        recursive: bool,
        f: impl FnOnce(&mut RemoteSink, &mut TransferStats) -> Result<T>,
    ) -> Result<T> {
        let buffer_size = self.config.effective_buffer_size();
        self.transfer(Direction::Receive, remote, local, recursive, |reader, writer, stats| {
            let mut proto = SinkProtocol::new(reader, writer, buffer_size)
                .context("failed to signal remote scp")?;
            let result = f(&mut proto, stats);
            recv_tree::report_warnings(&mut proto, &*self.logger, stats);
            result
        })
    }

    fn transfer<T>(
        &self,
        direction: Direction,
        remote: &str,
        local: &Path,
        recursive: bool,
        body: impl FnOnce(RemoteReader, RemoteWriter, &mut TransferStats) -> Result<T>,
    ) -> Result<T> {
        self.logger.start(direction, remote, local);
        let mut stats = TransferStats::new();
        let options = SessionOptions {
            preserve: self.config.preserve,
            recursive,
            ..SessionOptions::new(direction)
        };

        let result = ScpSession::open(&self.shell, &self.config.scp_path, &options, remote)
            .with_context(|| format!("failed to open session for {}", remote))
            .and_then(|session| session.run(&self.cancel, |reader, writer| body(reader, writer, &mut stats)));

        match &result {
            Ok(_) => {
                info!(
                    %direction,
                    remote,
                    files = stats.files,
                    bytes = stats.bytes,
                    warnings = stats.warnings.len(),
                    "scp transfer finished"
                );
                self.logger.done(stats.files, stats.bytes, stats.elapsed_secs());
            }
            Err(e) => self.logger.error(&direction.to_string(), &format!("{:#}", e)),
        }
        result
    }
}

fn read_file_headers(proto: &mut RemoteSink, preserve: bool) -> Result<(Option<TimeHeader>, FileHeader)> {
    let time = if preserve {
        Some(proto.expect_time().context("failed to read scp message header")?)
    } else {
        None
    };
    let header = proto.expect_file().context("failed to read scp message header")?;
    Ok((time, header))
}

fn times_or_zero(time: Option<&TimeHeader>) -> (FileTime, FileTime) {
    time.map_or((FileTime::zero(), FileTime::zero()), |t| (t.mtime, t.atime))
}
