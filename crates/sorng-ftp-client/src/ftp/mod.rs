//! # FTP client core
//!
//! RFC 959 client with the extensions most servers speak:
//! - **RFC 2389**: FEAT negotiation
//! - **RFC 3659**: MLSD/MLST, SIZE, MDTM, REST
//! - **RFC 2428**: EPSV
//!
//! Architecture:
//! - `types`: config, replies, commands, listing entries
//! - `error`: FTP-specific error type
//! - `protocol`: reply framing, reply-code interpretation, payload parsers
//! - `connection`: transport trait and the TCP implementation
//! - `queue`: one-in-flight command queue with promote-to-front
//! - `handshake`: login state machine (USER/PASS/FEAT/TYPE)
//! - `parser`: Unix, MS-DOS and MLSD listing lines
//! - `transfer`: passive data connections, completion latches, abort
//! - `session`: per-connection task driving the control channel
//! - `client`: public handle (connect, cwd, pwd, site, abort, ...)
//! - `directory`: list, mlsd, mkdir, rmdir, delete, rename, size, mdtm
//! - `file_ops`: get, put, append

pub mod types;
pub mod error;
pub mod protocol;
pub mod connection;
pub mod queue;
pub mod handshake;
pub mod parser;
pub mod transfer;
pub mod session;
pub mod client;
pub mod directory;
pub mod file_ops;

pub use types::*;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use client::FtpClient;
pub use connection::{Connection, TcpTransport, Transport};
pub use parser::{ListingContext, ListingParser};
pub use protocol::ResponseParser;
pub use transfer::{DataTransfer, ListStream};
