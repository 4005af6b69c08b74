//! Sink role: accepts file data from a remote `scp -f`.

use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use tracing::{debug, warn};

use crate::error::{ScpError, ScpResult};
use crate::protocol_core::{read_message, read_reply, write_reply, FileHeader, Message, Reply, TimeHeader};

pub struct SinkProtocol<R: Read, W: Write> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
    warnings: Vec<String>,
}

impl<R: Read, W: Write> SinkProtocol<R, W> {
    /// Wrap the remote streams and send the OK byte that starts the remote sending
    pub fn new(reader: R, writer: W, buffer_size: usize) -> ScpResult<Self> {
        let mut proto = Self {
            reader: BufReader::with_capacity(buffer_size, reader),
            writer: BufWriter::with_capacity(buffer_size, writer),
            warnings: Vec::new(),
        };
        proto.ack()?;
        Ok(proto)
    }

    /// Next header or reply; `None` at a clean end of stream.
    ///
    /// Headers are acknowledged before returning. Replies are not.
    pub fn read_header_or_reply(&mut self) -> ScpResult<Option<Message>> {
        let message = read_message(&mut self.reader)?;
        match &message {
            Some(Message::Reply(Reply::Warning(text))) => {
                warn!(message = %text, "remote scp warning");
                self.warnings.push(text.clone());
            }
            Some(Message::Reply(_)) => {}
            Some(header) => {
                debug!(kind = header.kind(), "scp header in: {}", header.describe());
                self.ack()?;
            }
            None => debug!("scp stream ended"),
        }
        Ok(message)
    }

    pub fn expect_time(&mut self) -> ScpResult<TimeHeader> {
        match self.read_header_or_reply()? {
            Some(Message::Time(t)) => Ok(t),
            other => Err(mismatch("time", other)),
        }
    }

    pub fn expect_file(&mut self) -> ScpResult<FileHeader> {
        match self.read_header_or_reply()? {
            Some(Message::File(h)) => Ok(h),
            other => Err(mismatch("file", other)),
        }
    }

    /// Stream exactly `header.size` body bytes into `dest`, then exchange the trailing ack.
    ///
    /// Use `std::io::sink()` as `dest` to drain a body that is not wanted.
    pub fn copy_file_body_to<D: Write + ?Sized>(&mut self, header: &FileHeader, dest: &mut D) -> ScpResult<u64> {
        let mut remaining = header.size;
        while remaining > 0 {
            let buf = self.reader.fill_buf()?;
            if buf.is_empty() {
                return Err(ScpError::ShortBody {
                    expected: header.size,
                    actual: header.size - remaining,
                });
            }
            let n = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
            dest.write_all(&buf[..n]).map_err(ScpError::Destination)?;
            self.reader.consume(n);
            remaining -= n as u64;
        }

        match read_reply(&mut self.reader)? {
            Reply::Ok => {}
            Reply::Warning(text) => {
                warn!(file = %header.name, message = %text, "remote scp warning after file body");
                self.warnings.push(text);
            }
            Reply::Fatal(text) => return Err(ScpError::RemoteFatal(text)),
        }
        self.ack()?;
        Ok(header.size)
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    pub fn into_inner(self) -> ScpResult<(R, W)> {
        let writer = self
            .writer
            .into_inner()
            .map_err(|e| ScpError::Io(e.into_error()))?;
        Ok((self.reader.into_inner(), writer))
    }

    fn ack(&mut self) -> ScpResult<()> {
        write_reply(&mut self.writer, &Reply::Ok)?;
        self.writer.flush()?;
        Ok(())
    }
}

fn mismatch(expected: &'static str, got: Option<Message>) -> ScpError {
    match got {
        Some(message) => ScpError::UnexpectedMessage {
            expected,
            actual: message.describe(),
        },
        None => ScpError::UnexpectedEof(match expected {
            "time" => "waiting for time header",
            _ => "waiting for file header",
        }),
    }
}
