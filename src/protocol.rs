//! Shared protocol constants for the SCP control stream

// Message type bytes (first byte of every header line)
pub mod msg {
    pub const TIME: u8 = b'T';
    pub const COPY_FILE: u8 = b'C';
    pub const START_DIRECTORY: u8 = b'D';
    pub const END_DIRECTORY: u8 = b'E';
}

// Reply bytes. OK is a bare byte; WARNING and FATAL are followed by a text line.
pub mod reply {
    pub const OK: u8 = 0x00;
    pub const WARNING: u8 = 0x01;
    pub const FATAL: u8 = 0x02;
}

// Remote command flags
pub mod flag {
    pub const FROM: char = 'f';
    pub const TO: char = 't';
    pub const PRESERVE: char = 'p';
    pub const RECURSIVE: char = 'r';
    pub const TARGET_IS_DIR: char = 'd';
}

/// Permission bits carried in C/D headers
pub const PERM_MASK: u32 = 0o777;

/// Bits accepted when parsing a mode field (setuid/setgid/sticky included)
pub const MODE_MASK: u32 = 0o7777;

// Maximum header line length (64KB) - prevents unbounded buffer growth
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Default remote scp binary
pub const DEFAULT_SCP_PATH: &str = "scp";

// Default buffered stream size around the remote pipes (64KB)
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
pub const MIN_BUFFER_SIZE: usize = 4 * 1024;
