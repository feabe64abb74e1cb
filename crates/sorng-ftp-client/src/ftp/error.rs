//! FTP-specific error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised FTP error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP reply code that triggered the error, if any.
    pub code: Option<u16>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FtpErrorKind {
    /// TCP / DNS resolution failure on the control connection.
    ConnectionFailed,
    /// Control connection closed or reset underneath a pending operation.
    Disconnected,
    /// Wrong username/password, or a password the server asked for is missing.
    AuthFailed,
    /// Server returned a 4xx/5xx for a command.
    CommandRejected,
    /// Data channel could not be established or was torn down.
    DataChannelFailed,
    /// Transfer aborted or incomplete on the server side.
    TransferFailed,
    /// Positive reply with a code the command does not accept.
    UnexpectedReply,
    /// Malformed reply payload (PASV, EPSV, 257, SIZE, MDTM, listing line).
    ParseError,
    /// An I/O error on a socket or local stream.
    IoError,
    /// Control or data connect deadline exceeded.
    Timeout,
    /// Command issued while the session is not logged in.
    InvalidState,
    /// Extension not advertised by the server's FEAT reply.
    Unsupported,
    /// Permission denied on the server.
    PermissionDenied,
    /// File/directory not found on the server.
    NotFound,
    /// Disk quota exceeded.
    QuotaExceeded,
    /// Config / parameter validation error.
    InvalidConfig,
}

pub type FtpResult<T> = Result<T, FtpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            session_id: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ConnectionFailed, msg)
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Disconnected, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AuthFailed, msg)
    }

    pub fn command_rejected(code: u16, msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::CommandRejected, msg).with_code(code)
    }

    pub fn unexpected_reply(code: u16, msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::UnexpectedReply, msg).with_code(code)
    }

    pub fn data_channel(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::DataChannelFailed, msg)
    }

    pub fn parse_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ParseError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::IoError, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, msg)
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidState, msg)
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Unsupported, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    /// Classify a 4xx/5xx reply code into the most appropriate error kind.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let kind = match code {
            421 => FtpErrorKind::Disconnected,
            425 | 426 => FtpErrorKind::DataChannelFailed,
            430 | 530 => FtpErrorKind::AuthFailed,
            450 | 550 => {
                let lower = text.to_lowercase();
                if lower.contains("permission") || lower.contains("denied") {
                    FtpErrorKind::PermissionDenied
                } else if lower.contains("not found") || lower.contains("no such") {
                    FtpErrorKind::NotFound
                } else if lower.contains("quota") {
                    FtpErrorKind::QuotaExceeded
                } else {
                    FtpErrorKind::CommandRejected
                }
            }
            451 | 452 | 552 => FtpErrorKind::TransferFailed,
            _ => FtpErrorKind::CommandRejected,
        };
        let message = if text.is_empty() {
            reply_description(code).unwrap_or("Unknown error").to_string()
        } else {
            text.to_string()
        };
        Self {
            kind,
            message,
            code: Some(code),
            session_id: None,
        }
    }

    // ── Category predicates ──────────────────────────────────────

    /// The server answered with a negative or unexpected reply.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self.kind,
            FtpErrorKind::AuthFailed
                | FtpErrorKind::CommandRejected
                | FtpErrorKind::DataChannelFailed
                | FtpErrorKind::TransferFailed
                | FtpErrorKind::UnexpectedReply
                | FtpErrorKind::PermissionDenied
                | FtpErrorKind::NotFound
                | FtpErrorKind::QuotaExceeded
        ) || (self.kind == FtpErrorKind::Disconnected && self.code.is_some())
    }

    /// A socket failed underneath the session.
    pub fn is_transport(&self) -> bool {
        matches!(
            self.kind,
            FtpErrorKind::ConnectionFailed | FtpErrorKind::IoError
        ) || (self.kind == FtpErrorKind::Disconnected && self.code.is_none())
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == FtpErrorKind::Timeout
    }

    pub fn is_parse(&self) -> bool {
        self.kind == FtpErrorKind::ParseError
    }
}

/// Canonical RFC 959 wording for the negative reply codes.
pub fn reply_description(code: u16) -> Option<&'static str> {
    let text = match code {
        421 => "Service not available, closing control connection",
        425 => "Can't open data connection",
        426 => "Connection closed; transfer aborted",
        450 => "Requested file action not taken / File unavailable (e.g., file busy)",
        451 => "Requested action aborted: local error in processing",
        452 => "Requested action not taken / Insufficient storage space in system",
        500 => "Syntax error / Command unrecognized",
        501 => "Syntax error in parameters or arguments",
        502 => "Command not implemented",
        503 => "Bad sequence of commands",
        504 => "Command not implemented for that parameter",
        530 => "Not logged in",
        532 => "Need account for storing files",
        550 => "Requested action not taken / File unavailable (e.g., file not found, no access)",
        551 => "Requested action aborted: page type unknown",
        552 => "Requested file action aborted / Exceeded storage allocation (for current directory or dataset)",
        553 => "Requested action not taken / File name not allowed",
        _ => return None,
    };
    Some(text)
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)
        } else {
            write!(f, "[FTP {:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(format!("I/O timeout: {}", e))
        } else {
            Self::io_error(e.to_string())
        }
    }
}

impl From<FtpError> for String {
    fn from(e: FtpError) -> String {
        e.message
    }
}
