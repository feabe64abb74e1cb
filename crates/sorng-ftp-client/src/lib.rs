//! # sorng-ftp-client
//!
//! Asynchronous FTP client core (RFC 959 with the FEAT, SIZE, MDTM, REST,
//! EPSV and MLSD/MLST extensions). See [`ftp`] for the module map.

pub mod ftp;

pub use ftp::client::FtpClient;
pub use ftp::error::{FtpError, FtpErrorKind, FtpResult};
pub use ftp::types::*;
