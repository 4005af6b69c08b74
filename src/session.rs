//! One remote scp execution: command line, lifecycle and cancellation.

use anyhow::Context;
use crossbeam_channel::{bounded, select};
use parking_lot::Mutex;
use std::fmt;
use std::thread;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{ScpError, ScpResult};
use crate::protocol::flag;
use crate::shell::{clean_remote_path, escape_shell_arg};
use crate::transport::{RemoteReader, RemoteSession, RemoteShell, RemoteWriter};

/// Which way file data flows, seen from this side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We supply data; the remote runs `scp -t`
    Send,
    /// We accept data; the remote runs `scp -f`
    Receive,
}

impl Direction {
    fn flag(self) -> char {
        match self {
            Direction::Send => flag::TO,
            Direction::Receive => flag::FROM,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => write!(f, "send"),
            Direction::Receive => write!(f, "receive"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub direction: Direction,
    pub preserve: bool,
    pub recursive: bool,
    /// The remote path is asserted to be a directory
    pub target_is_dir: bool,
}

impl SessionOptions {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            preserve: true,
            recursive: false,
            target_is_dir: false,
        }
    }

    pub fn flags(&self) -> String {
        let mut flags = String::from("-");
        flags.push(self.direction.flag());
        if self.preserve {
            flags.push(flag::PRESERVE);
        }
        if self.recursive {
            flags.push(flag::RECURSIVE);
        }
        if self.target_is_dir {
            flags.push(flag::TARGET_IS_DIR);
        }
        flags
    }
}

/// `<scp> -<flags> <escaped path>`
pub fn command_line(scp_path: &str, options: &SessionOptions, remote_path: &str) -> String {
    format!(
        "{} {} {}",
        scp_path,
        options.flags(),
        escape_shell_arg(&clean_remote_path(remote_path))
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Closed,
}

pub struct ScpSession {
    remote: Box<dyn RemoteSession>,
    state: Mutex<SessionState>,
    command: String,
}

impl ScpSession {
    pub fn open<S: RemoteShell + ?Sized>(
        shell: &S,
        scp_path: &str,
        options: &SessionOptions,
        remote_path: &str,
    ) -> ScpResult<Self> {
        let remote = shell.open_session()?;
        Ok(Self {
            remote,
            state: Mutex::new(SessionState::Created),
            command: command_line(scp_path, options, remote_path),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Start the remote command and hand out its streams
    pub fn start(&self) -> ScpResult<(RemoteReader, RemoteWriter)> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Created => {}
            SessionState::Started => {
                return Err(ScpError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "session already started",
                )))
            }
            SessionState::Closed => return Err(ScpError::Closed),
        }
        self.remote.start(&self.command)?;
        *state = SessionState::Started;
        drop(state);
        info!(command = %self.command, "remote scp started");
        let stdout = self.remote.stdout()?;
        let stdin = self.remote.stdin()?;
        Ok((stdout, stdin))
    }

    /// Wait for the remote command to exit
    pub fn wait(&self) -> ScpResult<()> {
        match self.state() {
            SessionState::Created => Err(ScpError::NotStarted),
            SessionState::Closed => Err(ScpError::Closed),
            SessionState::Started => Ok(self.remote.wait()?),
        }
    }

    /// Close the session; later calls do nothing
    pub fn close(&self) -> ScpResult<()> {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return Ok(());
            }
            *state = SessionState::Closed;
        }
        self.remote.close()?;
        Ok(())
    }

    fn close_quietly(&self) {
        if let Err(e) = self.close() {
            debug!(error = %e, command = %self.command, "error closing scp session");
        }
    }

    /// Start the session, run `handler` on its streams, wait for the remote
    /// to exit and tear it down.
    ///
    /// Until the remote has exited a watcher thread closes the session as
    /// soon as `cancel` fires, which makes any blocked read, write or wait
    /// fail. The session is closed on every exit path.
    pub fn run<T, F>(self, cancel: &CancelToken, handler: F) -> anyhow::Result<T>
    where
        F: FnOnce(RemoteReader, RemoteWriter) -> anyhow::Result<T>,
    {
        if cancel.is_cancelled() {
            self.close_quietly();
            return Err(ScpError::Cancelled.into());
        }
        let (reader, writer) = match self.start() {
            Ok(streams) => streams,
            Err(e) => {
                self.close_quietly();
                return Err(e).with_context(|| format!("failed to start `{}`", self.command));
            }
        };

        let (done_tx, done_rx) = bounded::<()>(0);
        let session = &self;
        let outcome = thread::scope(|scope| {
            scope.spawn(move || {
                select! {
                    recv(cancel.signal()) -> _ => {
                        debug!(command = %session.command, "cancelled, closing scp session");
                        session.close_quietly();
                    }
                    recv(done_rx) -> _ => {}
                }
            });
            let outcome = handler(reader, writer).and_then(|value| {
                if cancel.is_cancelled() {
                    return Err(ScpError::Cancelled.into());
                }
                self.wait()
                    .map(|()| value)
                    .with_context(|| format!("remote `{}` did not finish cleanly", self.command))
            });
            drop(done_tx);
            outcome
        });

        let result = match outcome {
            Ok(_) if cancel.is_cancelled() => Err(ScpError::Cancelled.into()),
            Err(e) if cancel.is_cancelled() && !is_cancelled(&e) => Err(e.context(ScpError::Cancelled)),
            other => other,
        };
        self.close_quietly();
        result
    }
}

fn is_cancelled(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<ScpError>(), Some(ScpError::Cancelled))
}
