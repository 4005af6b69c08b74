//! Secure-shell capability consumed by the session layer.
//!
//! The crate never authenticates or encrypts anything itself. It asks a
//! `RemoteShell` for a fresh command channel, starts the remote scp on it and
//! talks over the channel's stdin/stdout.

use parking_lot::Mutex;
use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::debug;

pub type RemoteReader = Box<dyn Read + Send>;
pub type RemoteWriter = Box<dyn Write + Send>;

/// Source of command channels to one remote host
pub trait RemoteShell {
    fn open_session(&self) -> io::Result<Box<dyn RemoteSession>>;
}

/// One command execution on the remote host.
///
/// All methods take `&self` so a watcher thread can `close()` while another
/// thread is blocked reading `stdout()`.
pub trait RemoteSession: Send + Sync {
    fn start(&self, command: &str) -> io::Result<()>;
    /// Remote stdin. Available once, after `start`.
    fn stdin(&self) -> io::Result<RemoteWriter>;
    /// Remote stdout. Available once, after `start`.
    fn stdout(&self) -> io::Result<RemoteReader>;
    /// Block until the remote command exits; a non-zero exit is an error
    fn wait(&self) -> io::Result<()>;
    /// Tear the channel down, unblocking pending reads and writes
    fn close(&self) -> io::Result<()>;
}

impl<T: RemoteShell + ?Sized> RemoteShell for &T {
    fn open_session(&self) -> io::Result<Box<dyn RemoteSession>> {
        (**self).open_session()
    }
}

/// Runs each command through a local program, e.g. `ssh -T host <cmd>`
/// or `sh -c <cmd>`.
#[derive(Debug, Clone)]
pub struct ProcessShell {
    program: OsString,
    args: Vec<OsString>,
}

impl ProcessShell {
    pub fn new(program: impl Into<OsString>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Commands run on this machine through `sh -c`
    pub fn local() -> Self {
        Self::new("sh", ["-c"])
    }

    /// Commands run on `host` through the system ssh client
    pub fn ssh(host: &str) -> Self {
        Self::new("ssh", ["-T", host])
    }

    /// Replace the program, keeping the arguments (e.g. a specific ssh binary)
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }
}

impl RemoteShell for ProcessShell {
    fn open_session(&self) -> io::Result<Box<dyn RemoteSession>> {
        Ok(Box::new(ProcessSession {
            program: self.program.clone(),
            args: self.args.clone(),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

struct ProcessSession {
    program: OsString,
    args: Vec<OsString>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<ChildStdout>>,
    closed: AtomicBool,
}

const WAIT_POLL: Duration = Duration::from_millis(10);

impl RemoteSession for ProcessSession {
    fn start(&self, command: &str) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }
        let mut slot = self.child.lock();
        if slot.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "command already started"));
        }
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("failed to spawn {}: {}", self.program.to_string_lossy(), e),
                )
            })?;
        debug!(program = %self.program.to_string_lossy(), pid = child.id(), "spawned remote command");
        *self.stdin.lock() = child.stdin.take();
        *self.stdout.lock() = child.stdout.take();
        *slot = Some(child);
        Ok(())
    }

    fn stdin(&self) -> io::Result<RemoteWriter> {
        self.stdin
            .lock()
            .take()
            .map(|s| Box::new(s) as RemoteWriter)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stdin not available"))
    }

    fn stdout(&self) -> io::Result<RemoteReader> {
        self.stdout
            .lock()
            .take()
            .map(|s| Box::new(s) as RemoteReader)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stdout not available"))
    }

    fn wait(&self) -> io::Result<()> {
        loop {
            {
                let mut slot = self.child.lock();
                let child = match slot.as_mut() {
                    Some(child) => child,
                    None if self.closed.load(Ordering::SeqCst) => return Err(closed_error()),
                    None => {
                        return Err(io::Error::new(io::ErrorKind::NotConnected, "command not started"))
                    }
                };
                if let Some(status) = child.try_wait()? {
                    return if status.success() {
                        Ok(())
                    } else {
                        Err(io::Error::new(
                            io::ErrorKind::Other,
                            format!("remote command failed: {}", status),
                        ))
                    };
                }
            }
            thread::sleep(WAIT_POLL);
        }
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stdin.lock().take();
        self.stdout.lock().take();
        let Some(mut child) = self.child.lock().take() else {
            return Ok(());
        };
        if child.try_wait()?.is_none() {
            child.kill()?;
        }
        child.wait()?;
        Ok(())
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "session closed")
}
