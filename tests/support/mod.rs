//! In-process stand-in for a remote host: each session runs an emulated
//! `scp -t` / `scp -f` on a thread, talking over in-memory pipes and
//! working directly on the paths named in the command line.

#![allow(dead_code)]

use filetime::FileTime;
use parking_lot::{Condvar, Mutex};
use scp_wire::transport::{RemoteReader, RemoteSession, RemoteShell, RemoteWriter};
use std::collections::VecDeque;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const PIPE_CAPACITY: usize = 16 * 1024;

struct PipeState {
    buf: VecDeque<u8>,
    writer_closed: bool,
    reader_closed: bool,
    aborted: bool,
}

struct Pipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl Pipe {
    fn abort(&self) {
        self.state.lock().aborted = true;
        self.ready.notify_all();
    }
}

fn pipe() -> (PipeWriter, PipeReader, Arc<Pipe>) {
    let pipe = Arc::new(Pipe {
        state: Mutex::new(PipeState {
            buf: VecDeque::new(),
            writer_closed: false,
            reader_closed: false,
            aborted: false,
        }),
        ready: Condvar::new(),
    });
    (PipeWriter(pipe.clone()), PipeReader(pipe.clone()), pipe)
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "session closed")
}

pub struct PipeWriter(Arc<Pipe>);

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut s = self.0.state.lock();
        loop {
            if s.aborted {
                return Err(aborted());
            }
            if s.reader_closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader closed"));
            }
            if s.buf.len() < PIPE_CAPACITY {
                break;
            }
            self.0.ready.wait(&mut s);
        }
        let n = data.len().min(PIPE_CAPACITY - s.buf.len());
        s.buf.extend(&data[..n]);
        self.0.ready.notify_all();
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.0.state.lock().writer_closed = true;
        self.0.ready.notify_all();
    }
}

pub struct PipeReader(Arc<Pipe>);

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut s = self.0.state.lock();
        loop {
            if s.aborted {
                return Err(aborted());
            }
            if !s.buf.is_empty() {
                break;
            }
            if s.writer_closed {
                return Ok(0);
            }
            self.0.ready.wait(&mut s);
        }
        let n = out.len().min(s.buf.len());
        for (dst, b) in out.iter_mut().zip(s.buf.drain(..n)) {
            *dst = b;
        }
        self.0.ready.notify_all();
        Ok(n)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.0.state.lock().reader_closed = true;
        self.0.ready.notify_all();
    }
}

/// Misbehavior injected into the emulated remote, keyed by entry name
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// `scp -t`: answer this file's body with a warning instead of OK
    pub warn_after_file: Option<String>,
    /// `scp -t`: answer this file's header with a fatal error and stop
    pub fatal_on_file: Option<String>,
    /// `scp -f`: send a warning line just before this entry's headers
    pub warn_before_entry: Option<String>,
    /// Either side: stop talking once this file comes up
    pub stall_on_file: Option<String>,
}

#[derive(Clone, Default)]
pub struct LoopbackShell {
    faults: Faults,
    commands: Arc<Mutex<Vec<String>>>,
    stalled: Arc<AtomicBool>,
}

impl LoopbackShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: Faults) -> Self {
        Self {
            faults,
            ..Self::default()
        }
    }

    /// Every command line started so far
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// True once the emulated remote hit `stall_on_file`
    pub fn stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }
}

impl RemoteShell for LoopbackShell {
    fn open_session(&self) -> io::Result<Box<dyn RemoteSession>> {
        Ok(Box::new(LoopbackSession {
            shell: self.clone(),
            to_remote: Mutex::new(None),
            from_remote: Mutex::new(None),
            pipes: Mutex::new(Vec::new()),
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LoopbackSession {
    shell: LoopbackShell,
    to_remote: Mutex<Option<PipeWriter>>,
    from_remote: Mutex<Option<PipeReader>>,
    pipes: Mutex<Vec<Arc<Pipe>>>,
    remote: Mutex<Option<JoinHandle<io::Result<()>>>>,
    closed: AtomicBool,
}

impl RemoteSession for LoopbackSession {
    fn start(&self, command: &str) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(aborted());
        }
        self.shell.commands.lock().push(command.to_string());
        let parsed = parse_command(command)?;

        let (client_w, remote_r, up) = pipe();
        let (remote_w, client_r, down) = pipe();
        *self.pipes.lock() = vec![up, down];
        *self.to_remote.lock() = Some(client_w);
        *self.from_remote.lock() = Some(client_r);

        let mut remote = EmulatedScp {
            reader: BufReader::new(remote_r),
            writer: remote_w,
            faults: self.shell.faults.clone(),
            stalled: self.shell.stalled.clone(),
            preserve: parsed.preserve,
        };
        let handle = thread::spawn(move || {
            if parsed.to {
                remote.sink(&parsed.path)
            } else {
                remote.source(&parsed.path, parsed.recursive)
            }
        });
        *self.remote.lock() = Some(handle);
        Ok(())
    }

    fn stdin(&self) -> io::Result<RemoteWriter> {
        self.to_remote
            .lock()
            .take()
            .map(|w| Box::new(w) as RemoteWriter)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stdin not available"))
    }

    fn stdout(&self) -> io::Result<RemoteReader> {
        self.from_remote
            .lock()
            .take()
            .map(|r| Box::new(r) as RemoteReader)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stdout not available"))
    }

    fn wait(&self) -> io::Result<()> {
        let handle = self
            .remote
            .lock()
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not started"))?;
        handle
            .join()
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "emulated scp panicked")))
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for pipe in self.pipes.lock().iter() {
            pipe.abort();
        }
        self.to_remote.lock().take();
        self.from_remote.lock().take();
        Ok(())
    }
}

struct ParsedCommand {
    to: bool,
    preserve: bool,
    recursive: bool,
    path: PathBuf,
}

fn parse_command(command: &str) -> io::Result<ParsedCommand> {
    let bad = || io::Error::new(io::ErrorKind::InvalidInput, format!("bad command {:?}", command));
    let mut parts = command.splitn(3, ' ');
    let _program = parts.next().ok_or_else(bad)?;
    let flags = parts.next().ok_or_else(bad)?;
    let arg = parts.next().ok_or_else(bad)?;
    let to = flags.contains('t');
    if to == flags.contains('f') {
        return Err(bad());
    }
    Ok(ParsedCommand {
        to,
        preserve: flags.contains('p'),
        recursive: flags.contains('r'),
        path: PathBuf::from(unquote(arg)),
    })
}

fn unquote(arg: &str) -> String {
    let mut out = String::new();
    let mut quoted = false;
    let mut chars = arg.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => quoted = !quoted,
            '\\' if !quoted => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            c => out.push(c),
        }
    }
    out
}

fn protocol_error(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

type Times = (FileTime, FileTime);

struct EmulatedScp {
    reader: BufReader<PipeReader>,
    writer: PipeWriter,
    faults: Faults,
    stalled: Arc<AtomicBool>,
    preserve: bool,
}

impl EmulatedScp {
    fn ok(&mut self) -> io::Result<()> {
        self.writer.write_all(&[0])
    }

    fn warn(&mut self, msg: &str) -> io::Result<()> {
        self.writer.write_all(&[1])?;
        writeln!(self.writer, "{}", msg)
    }

    fn fatal(&mut self, msg: &str) -> io::Result<()> {
        self.writer.write_all(&[2])?;
        writeln!(self.writer, "{}", msg)
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = Vec::new();
        if self.reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    /// Go quiet until the client side closes or the session is torn down
    fn stall(&mut self) -> io::Result<()> {
        self.stalled.store(true, Ordering::SeqCst);
        let mut buf = [0u8; 64];
        while self.reader.read(&mut buf)? > 0 {}
        Ok(())
    }

    fn await_ack(&mut self) -> io::Result<()> {
        let mut b = [0u8; 1];
        self.reader.read_exact(&mut b)?;
        match b[0] {
            0 => Ok(()),
            1 => self.read_line().map(|_| ()),
            2 => {
                let line = self.read_line()?.unwrap_or_default();
                Err(protocol_error(line))
            }
            other => Err(protocol_error(format!("bad ack byte {}", other))),
        }
    }

    /// `scp -t <target>`
    fn sink(&mut self, target: &Path) -> io::Result<()> {
        let target_is_dir = target.is_dir();
        let mut stack: Vec<(PathBuf, u32, Option<Times>)> = Vec::new();
        let mut time: Option<Times> = None;
        self.ok()?;

        loop {
            let Some(line) = self.read_line()? else {
                return Ok(());
            };
            if line.is_empty() {
                return Err(protocol_error("empty header line"));
            }
            let (kind, rest) = line.split_at(1);
            match kind {
                "T" => {
                    time = Some(parse_time(rest)?);
                    self.ok()?;
                }
                "C" => {
                    let (mode, size, name) = parse_entry(rest)?;
                    let path = match stack.last() {
                        Some((dir, _, _)) => dir.join(&name),
                        None if target_is_dir => target.join(&name),
                        None => target.to_path_buf(),
                    };
                    if self.faults.fatal_on_file.as_deref() == Some(name.as_str()) {
                        return self.fatal(&format!("scp: {}: Permission denied", path.display()));
                    }
                    if self.faults.stall_on_file.as_deref() == Some(name.as_str()) {
                        return self.stall();
                    }
                    self.ok()?;

                    let mut file = fs::File::create(&path)?;
                    let copied = io::copy(&mut (&mut self.reader).take(size), &mut file)?;
                    drop(file);
                    if copied != size {
                        return Err(protocol_error("short file body"));
                    }
                    self.await_ack()?;
                    fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
                    if let Some((mtime, atime)) = time.take() {
                        filetime::set_file_times(&path, atime, mtime)?;
                    }
                    if self.faults.warn_after_file.as_deref() == Some(name.as_str()) {
                        self.warn(&format!("scp: {}: set times: Operation not permitted", path.display()))?;
                    } else {
                        self.ok()?;
                    }
                }
                "D" => {
                    let (mode, _, name) = parse_entry(rest)?;
                    let path = match stack.last() {
                        Some((dir, _, _)) => dir.join(&name),
                        None if target_is_dir => target.join(&name),
                        None => target.to_path_buf(),
                    };
                    if !path.is_dir() {
                        fs::create_dir(&path)?;
                    }
                    fs::set_permissions(&path, fs::Permissions::from_mode(mode | 0o700))?;
                    stack.push((path, mode, time.take()));
                    self.ok()?;
                }
                "E" => {
                    let (path, mode, times) = stack.pop().ok_or_else(|| protocol_error("unbalanced E"))?;
                    fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
                    if let Some((mtime, atime)) = times {
                        filetime::set_file_times(&path, atime, mtime)?;
                    }
                    self.ok()?;
                }
                _ => return Err(protocol_error(format!("unexpected line {:?}", line))),
            }
        }
    }

    /// `scp -f <target>`
    fn source(&mut self, target: &Path, recursive: bool) -> io::Result<()> {
        let mut go = [0u8; 1];
        if self.reader.read(&mut go)? == 0 {
            return Ok(());
        }
        let meta = match fs::metadata(target) {
            Ok(meta) => meta,
            Err(_) => {
                return self.warn(&format!("scp: {}: No such file or directory", target.display()));
            }
        };
        if meta.is_dir() {
            if !recursive {
                return self.warn(&format!("scp: {}: not a regular file", target.display()));
            }
            self.send_dir(target)
        } else {
            self.send_file(target)
        }
    }

    fn send_times(&mut self, meta: &fs::Metadata) -> io::Result<()> {
        if !self.preserve {
            return Ok(());
        }
        let mtime = FileTime::from_last_modification_time(meta);
        let atime = FileTime::from_last_access_time(meta);
        writeln!(self.writer, "T{} 0 {} 0", mtime.unix_seconds(), atime.unix_seconds())?;
        self.await_ack()
    }

    fn before_entry(&mut self, name: &str) -> io::Result<()> {
        if self.faults.warn_before_entry.as_deref() == Some(name) {
            self.warn(&format!("scp: {}: skipped by remote", name))?;
        }
        Ok(())
    }

    fn send_file(&mut self, path: &Path) -> io::Result<()> {
        let name = entry_name(path);
        self.before_entry(&name)?;
        if self.faults.stall_on_file.as_deref() == Some(name.as_str()) {
            return self.stall();
        }
        let meta = fs::metadata(path)?;
        self.send_times(&meta)?;
        writeln!(
            self.writer,
            "C{:04o} {} {}",
            meta.permissions().mode() & 0o777,
            meta.len(),
            name
        )?;
        self.await_ack()?;
        io::copy(&mut fs::File::open(path)?, &mut self.writer)?;
        self.ok()?;
        self.await_ack()
    }

    fn send_dir(&mut self, path: &Path) -> io::Result<()> {
        let name = entry_name(path);
        self.before_entry(&name)?;
        let meta = fs::metadata(path)?;
        self.send_times(&meta)?;
        writeln!(self.writer, "D{:04o} 0 {}", meta.permissions().mode() & 0o777, name)?;
        self.await_ack()?;

        let mut entries = fs::read_dir(path)?.collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.send_dir(&entry.path())?;
            } else if file_type.is_file() {
                self.send_file(&entry.path())?;
            }
        }

        writeln!(self.writer, "E")?;
        self.await_ack()
    }
}

fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string())
}

fn parse_time(rest: &str) -> io::Result<Times> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() != 4 {
        return Err(protocol_error(format!("bad time header {:?}", rest)));
    }
    let secs = |s: &str| s.parse::<i64>().map_err(|e| protocol_error(e.to_string()));
    Ok((
        FileTime::from_unix_time(secs(fields[0])?, 0),
        FileTime::from_unix_time(secs(fields[2])?, 0),
    ))
}

fn parse_entry(rest: &str) -> io::Result<(u32, u64, String)> {
    let mut parts = rest.splitn(3, ' ');
    let (Some(mode), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(protocol_error(format!("bad entry header {:?}", rest)));
    };
    let mode = u32::from_str_radix(mode, 8).map_err(|e| protocol_error(e.to_string()))?;
    let size = size.parse::<u64>().map_err(|e| protocol_error(e.to_string()))?;
    Ok((mode, size, name.to_string()))
}
