//! Source role: supplies file data to a remote `scp -t`.
//!
//! Every header is followed by exactly one reply read before anything else
//! is written. A file body is followed by a zero byte from us and one more
//! reply from the remote.

use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use tracing::{debug, warn};

use crate::error::{ScpError, ScpResult};
use crate::file_info::FileInfo;
use crate::protocol_core::{
    read_reply, write_message, write_reply, DirHeader, FileHeader, Message, Reply, TimeHeader,
};

pub struct SourceProtocol<R: Read, W: Write> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
    preserve: bool,
    depth: usize,
    warnings: Vec<String>,
}

impl<R: Read, W: Write> SourceProtocol<R, W> {
    /// Wrap the remote streams and wait for the remote's ready reply
    pub fn new(reader: R, writer: W, buffer_size: usize, preserve: bool) -> ScpResult<Self> {
        let mut proto = Self {
            reader: BufReader::with_capacity(buffer_size, reader),
            writer: BufWriter::with_capacity(buffer_size, writer),
            preserve,
            depth: 0,
            warnings: Vec::new(),
        };
        proto.await_reply()?;
        Ok(proto)
    }

    /// Send one file: optional time header, file header, exactly
    /// `info.size()` bytes of `body`, then the trailing ack exchange.
    ///
    /// `body` is dropped (closed) when this returns, on success or failure.
    pub fn write_file<S: Read>(&mut self, info: &FileInfo, mut body: S) -> ScpResult<()> {
        if self.preserve {
            self.send_time(info)?;
        }
        let header = FileHeader {
            mode: info.mode(),
            size: info.size(),
            name: info.name().to_string(),
        };
        self.send_header(&Message::File(header))?;

        let expected = info.size();
        let copied = copy_body(&mut body, &mut self.writer, expected)?;
        if copied < expected {
            return Err(ScpError::ShortBody {
                expected,
                actual: copied,
            });
        }
        if has_more(&mut body)? {
            return Err(ScpError::LongBody { expected });
        }
        drop(body);

        write_reply(&mut self.writer, &Reply::Ok)?;
        self.writer.flush()?;
        self.await_reply()
    }

    pub fn start_directory(&mut self, info: &FileInfo) -> ScpResult<()> {
        if self.preserve {
            self.send_time(info)?;
        }
        let header = DirHeader {
            mode: info.mode(),
            name: info.name().to_string(),
        };
        self.send_header(&Message::StartDirectory(header))?;
        self.depth += 1;
        Ok(())
    }

    pub fn end_directory(&mut self) -> ScpResult<()> {
        if self.depth == 0 {
            return Err(ScpError::UnbalancedEnd);
        }
        self.send_header(&Message::EndDirectory)?;
        self.depth -= 1;
        Ok(())
    }

    /// Number of directories started and not yet ended
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Warning texts received since the last call
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Flush and hand back the underlying streams
    pub fn into_inner(self) -> ScpResult<(R, W)> {
        let writer = self
            .writer
            .into_inner()
            .map_err(|e| ScpError::Io(e.into_error()))?;
        Ok((self.reader.into_inner(), writer))
    }

    fn send_time(&mut self, info: &FileInfo) -> ScpResult<()> {
        self.send_header(&Message::Time(TimeHeader {
            mtime: info.mtime(),
            atime: info.atime(),
        }))
    }

    fn send_header(&mut self, message: &Message) -> ScpResult<()> {
        debug!(kind = message.kind(), "scp header out: {}", message.describe());
        write_message(&mut self.writer, message)?;
        self.writer.flush()?;
        self.await_reply()
    }

    fn await_reply(&mut self) -> ScpResult<()> {
        match read_reply(&mut self.reader)? {
            Reply::Ok => Ok(()),
            Reply::Warning(text) => {
                warn!(message = %text, "remote scp warning");
                self.warnings.push(text);
                Ok(())
            }
            Reply::Fatal(text) => Err(ScpError::RemoteFatal(text)),
        }
    }
}

// Reads from `body` are local, writes go to the remote; keep the two apart
// so a failing local read is not mistaken for a transport failure.
fn copy_body<S: Read, W: Write>(body: &mut S, out: &mut W, expected: u64) -> ScpResult<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut copied = 0u64;
    while copied < expected {
        let want = (expected - copied).min(buf.len() as u64) as usize;
        let n = match body.read(&mut buf[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(ScpError::Io(io::Error::new(
                    e.kind(),
                    format!("reading local file body: {}", e),
                )))
            }
        };
        out.write_all(&buf[..n])?;
        copied += n as u64;
    }
    Ok(copied)
}

fn has_more<S: Read>(body: &mut S) -> ScpResult<bool> {
    let mut extra = [0u8; 1];
    loop {
        match body.read(&mut extra) {
            Ok(n) => return Ok(n > 0),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
