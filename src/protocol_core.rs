//! SCP control message codec
//!
//! Every header is one text line introduced by a type byte. Replies are a
//! single byte, followed by a text line for warnings and fatal errors.
//! There is no length prefix: the only framing is the newline, plus the
//! `size` field of a C header announcing how many raw body bytes follow.

use filetime::FileTime;
use std::io::{BufRead, Read, Write};

use crate::error::{ScpError, ScpResult};
use crate::protocol::{msg, reply, MAX_LINE_LENGTH, MODE_MASK};

/// `T<mtime> 0 <atime> 0`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeHeader {
    pub mtime: FileTime,
    pub atime: FileTime,
}

/// `C<mode> <size> <name>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub mode: u32,
    pub size: u64,
    pub name: String,
}

/// `D<mode> 0 <name>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirHeader {
    pub mode: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Warning(String),
    Fatal(String),
}

/// One logical unit of the control stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Time(TimeHeader),
    File(FileHeader),
    StartDirectory(DirHeader),
    EndDirectory,
    Reply(Reply),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Time(_) => "time",
            Message::File(_) => "file",
            Message::StartDirectory(_) => "start-directory",
            Message::EndDirectory => "end-directory",
            Message::Reply(Reply::Ok) => "ok",
            Message::Reply(Reply::Warning(_)) => "warning",
            Message::Reply(Reply::Fatal(_)) => "fatal",
        }
    }

    /// Kind plus the payload that matters when reporting a mismatch
    pub fn describe(&self) -> String {
        match self {
            Message::File(h) => format!("file {:?}", h.name),
            Message::StartDirectory(h) => format!("start-directory {:?}", h.name),
            Message::Reply(Reply::Warning(text)) => format!("warning: {}", text),
            Message::Reply(Reply::Fatal(text)) => format!("fatal: {}", text),
            other => other.kind().to_string(),
        }
    }
}

/// Encode a header or reply into its wire bytes
pub fn build_message(message: &Message) -> ScpResult<Vec<u8>> {
    let bytes = match message {
        Message::Time(t) => format!(
            "{}{} 0 {} 0\n",
            msg::TIME as char,
            t.mtime.unix_seconds(),
            t.atime.unix_seconds()
        )
        .into_bytes(),
        Message::File(h) => {
            check_name("file", &h.name)?;
            format!(
                "{}{:04o} {} {}\n",
                msg::COPY_FILE as char,
                h.mode & MODE_MASK,
                h.size,
                h.name
            )
            .into_bytes()
        }
        Message::StartDirectory(h) => {
            check_name("start-directory", &h.name)?;
            format!(
                "{}{:04o} 0 {}\n",
                msg::START_DIRECTORY as char,
                h.mode & MODE_MASK,
                h.name
            )
            .into_bytes()
        }
        Message::EndDirectory => vec![msg::END_DIRECTORY, b'\n'],
        Message::Reply(r) => build_reply(r),
    };
    Ok(bytes)
}

pub fn build_reply(r: &Reply) -> Vec<u8> {
    match r {
        Reply::Ok => vec![reply::OK],
        Reply::Warning(text) => reply_with_text(reply::WARNING, text),
        Reply::Fatal(text) => reply_with_text(reply::FATAL, text),
    }
}

fn reply_with_text(code: u8, text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 2);
    out.push(code);
    out.extend(text.bytes().filter(|b| *b != b'\n'));
    out.push(b'\n');
    out
}

pub fn write_message<W: Write + ?Sized>(w: &mut W, message: &Message) -> ScpResult<()> {
    w.write_all(&build_message(message)?)?;
    Ok(())
}

pub fn write_reply<W: Write + ?Sized>(w: &mut W, r: &Reply) -> ScpResult<()> {
    w.write_all(&build_reply(r))?;
    Ok(())
}

/// Read the next header.
///
/// Returns `Ok(None)` only when the stream ends cleanly before a type byte.
/// A fatal reply becomes `Err(RemoteFatal)`; OK and warning replies are
/// returned as `Message::Reply` so callers can tell them from headers.
pub fn read_message<R: BufRead + ?Sized>(r: &mut R) -> ScpResult<Option<Message>> {
    let Some(type_byte) = read_type_byte(r)? else {
        return Ok(None);
    };
    match type_byte {
        reply::OK => Ok(Some(Message::Reply(Reply::Ok))),
        reply::WARNING => {
            let text = read_text_line(r, "reading warning message")?;
            Ok(Some(Message::Reply(Reply::Warning(text))))
        }
        reply::FATAL => {
            let text = read_text_line(r, "reading fatal message")?;
            Err(ScpError::RemoteFatal(text))
        }
        msg::TIME | msg::COPY_FILE | msg::START_DIRECTORY | msg::END_DIRECTORY => {
            let line = read_line(r, "reading header line")?;
            let line = String::from_utf8(line).map_err(|e| ScpError::MalformedHeader {
                kind: kind_of(type_byte),
                line: String::from_utf8_lossy(e.as_bytes()).into_owned(),
            })?;
            parse_header_line(type_byte, &line).map(Some)
        }
        other => Err(ScpError::UnknownMessageType(other)),
    }
}

/// Read one reply byte (and its text line for warnings and fatal errors)
pub fn read_reply<R: BufRead + ?Sized>(r: &mut R) -> ScpResult<Reply> {
    let type_byte = read_type_byte(r)?.ok_or(ScpError::UnexpectedEof("waiting for reply"))?;
    match type_byte {
        reply::OK => Ok(Reply::Ok),
        reply::WARNING => Ok(Reply::Warning(read_text_line(r, "reading warning message")?)),
        reply::FATAL => Ok(Reply::Fatal(read_text_line(r, "reading fatal message")?)),
        other => Err(ScpError::UnknownMessageType(other)),
    }
}

/// Parse a header line without its type byte and trailing newline
pub fn parse_header_line(type_byte: u8, line: &str) -> ScpResult<Message> {
    let kind = kind_of(type_byte);
    let malformed = || ScpError::MalformedHeader {
        kind,
        line: format!("{}{}", type_byte as char, line),
    };
    match type_byte {
        msg::TIME => {
            let fields: Vec<&str> = line.split(' ').collect();
            if fields.len() != 4 {
                return Err(malformed());
            }
            let mtime: i64 = fields[0].parse().map_err(|_| malformed())?;
            let _: u32 = fields[1].parse().map_err(|_| malformed())?;
            let atime: i64 = fields[2].parse().map_err(|_| malformed())?;
            let _: u32 = fields[3].parse().map_err(|_| malformed())?;
            Ok(Message::Time(TimeHeader {
                mtime: FileTime::from_unix_time(mtime, 0),
                atime: FileTime::from_unix_time(atime, 0),
            }))
        }
        msg::COPY_FILE | msg::START_DIRECTORY => {
            let mut parts = line.splitn(3, ' ');
            let (Some(mode), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
                return Err(malformed());
            };
            if mode.is_empty() || !mode.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
                return Err(malformed());
            }
            let mode = u32::from_str_radix(mode, 8).map_err(|_| malformed())? & MODE_MASK;
            let size: u64 = size.parse().map_err(|_| malformed())?;
            check_name(kind, name)?;
            let name = name.to_string();
            if type_byte == msg::COPY_FILE {
                Ok(Message::File(FileHeader { mode, size, name }))
            } else {
                Ok(Message::StartDirectory(DirHeader { mode, name }))
            }
        }
        msg::END_DIRECTORY => {
            if !line.is_empty() {
                return Err(malformed());
            }
            Ok(Message::EndDirectory)
        }
        other => Err(ScpError::UnknownMessageType(other)),
    }
}

// Names travel as single path components; anything else could escape the target
fn check_name(kind: &'static str, name: &str) -> ScpResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\n') {
        return Err(ScpError::MalformedHeader {
            kind,
            line: name.to_string(),
        });
    }
    Ok(())
}

fn kind_of(type_byte: u8) -> &'static str {
    match type_byte {
        msg::TIME => "time",
        msg::COPY_FILE => "file",
        msg::START_DIRECTORY => "start-directory",
        msg::END_DIRECTORY => "end-directory",
        _ => "unknown",
    }
}

fn read_type_byte<R: BufRead + ?Sized>(r: &mut R) -> ScpResult<Option<u8>> {
    let buf = r.fill_buf()?;
    let Some(&b) = buf.first() else {
        return Ok(None);
    };
    r.consume(1);
    Ok(Some(b))
}

fn read_line<R: BufRead + ?Sized>(r: &mut R, context: &'static str) -> ScpResult<Vec<u8>> {
    let mut buf = Vec::new();
    let limit = MAX_LINE_LENGTH as u64 + 1;
    let n = Read::take(&mut *r, limit).read_until(b'\n', &mut buf)?;
    if buf.last() != Some(&b'\n') {
        if n as u64 >= limit {
            return Err(ScpError::LineTooLong(MAX_LINE_LENGTH));
        }
        return Err(ScpError::UnexpectedEof(context));
    }
    buf.pop();
    Ok(buf)
}

fn read_text_line<R: BufRead + ?Sized>(r: &mut R, context: &'static str) -> ScpResult<String> {
    let line = read_line(r, context)?;
    Ok(String::from_utf8_lossy(&line).into_owned())
}
