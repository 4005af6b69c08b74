//! scp-wire: SCP client speaking the legacy scp control protocol
//!
//! Drives a remote `scp -t` / `scp -f` over any command channel that
//! provides stdin and stdout, without a local scp binary.

pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod file_info;
pub mod local_fs;
pub mod logger;
pub mod protocol;
pub mod protocol_core;
pub mod recv_tree;
pub mod send_tree;
pub mod session;
pub mod shell;
pub mod sink;
pub mod source;
pub mod transport;
pub mod url;

pub use cancel::CancelToken;
pub use client::Scp;
pub use config::ScpConfig;
pub use error::{ScpError, ScpResult};
pub use file_info::{accept_any, AcceptFn, FileInfo};
pub use logger::{Logger, NoopLogger, TextLogger, TransferStats};
pub use transport::{ProcessShell, RemoteSession, RemoteShell};
