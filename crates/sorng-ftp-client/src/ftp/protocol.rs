//! Control-channel codec (RFC 959 §4.2).
//!
//! Handles:
//! - Splitting an arbitrarily chunked byte stream into complete replies
//! - Single-line and multi-line replies (`NNN-` ... `NNN `)
//! - Interpreting a reply's code into a completion payload or an error

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{Completion, PassiveEndpoint, Reply, ReplyPayload};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr};

lazy_static! {
    /// A terminating reply line: three digits and a space at the start of the
    /// buffer or right after a newline, through the end of that line.
    static ref RE_REPLY_END: BytesRegex =
        BytesRegex::new(r"(?-u)(?:^|\r?\n)([0-9]{3}) [^\r\n]*\r?\n").unwrap();
    static ref RE_PASV: Regex =
        Regex::new(r"(\d+),(\d+),(\d+),(\d+),(-?\d+),(-?\d+)").unwrap();
    static ref RE_EPSV: Regex = Regex::new(r"\|\|\|(\d+)\|").unwrap();
    static ref RE_MDTM: Regex =
        Regex::new(r"^(\d{4})(\d{2})(\d{2})(\d{2})(\d{2})(\d{2})(?:\.\d+)?$").unwrap();
}

// ─── Reply framing ───────────────────────────────────────────────────

/// Upper bound on buffered bytes of an unfinished reply.
pub const DEFAULT_MAX_PENDING: usize = 1024 * 1024;

/// Incremental reply parser.
///
/// Bytes are buffered undecoded; only a complete reply is turned into text,
/// so chunk boundaries (including inside multi-byte characters) never matter.
#[derive(Debug)]
pub struct ResponseParser {
    buffer: Vec<u8>,
    max_pending: usize,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_PENDING)
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_pending,
        }
    }

    /// Append `input` and return every reply it completes, in order.
    pub fn feed(&mut self, input: &[u8]) -> Vec<Reply> {
        self.buffer.extend_from_slice(input);
        let mut replies = Vec::new();

        while let Some(caps) = RE_REPLY_END.captures(&self.buffer) {
            let (end, code) = match (caps.get(0), caps.get(1)) {
                (Some(whole), Some(code)) => (whole.end(), parse_code(code.as_bytes())),
                _ => break,
            };
            let consumed: Vec<u8> = self.buffer.drain(..end).collect();
            replies.push(build_reply(code, &consumed));
        }

        replies
    }

    /// Bytes received that do not yet form a complete reply.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Error once the unfinished reply has outgrown the limit; the stream
    /// cannot be resynchronised after that.
    pub fn check_limit(&self) -> FtpResult<()> {
        if self.buffer.len() > self.max_pending {
            return Err(FtpError::parse_error(format!(
                "Reply exceeds {} bytes without a terminating line",
                self.max_pending
            )));
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

fn parse_code(digits: &[u8]) -> u16 {
    digits
        .iter()
        .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0'))
}

fn build_reply(code: u16, consumed: &[u8]) -> Reply {
    let raw = String::from_utf8_lossy(consumed);
    let prefix_space = format!("{} ", code);
    let prefix_dash = format!("{}-", code);

    let stripped: Vec<&str> = raw
        .split('\n')
        .map(|line| {
            line.strip_prefix(prefix_space.as_str())
                .or_else(|| line.strip_prefix(prefix_dash.as_str()))
                .unwrap_or(line)
        })
        .collect();
    let line_count = raw.trim().lines().count();

    Reply {
        code,
        text: stripped.join("\n").trim().to_string(),
        multi_line: line_count > 1,
    }
}

// ─── Reply interpretation ────────────────────────────────────────────

/// What a reply means for the command currently in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpretation {
    /// 1xx: the command stays in flight and waits for its terminal reply.
    Preliminary,
    /// Terminal reply.
    Final(FtpResult<Completion>),
}

/// Map a reply to its outcome, grouped by the code's second digit.
pub fn interpret(reply: &Reply) -> Interpretation {
    let code = reply.code;
    match code / 100 {
        1 => return Interpretation::Preliminary,
        4 | 5 => return Interpretation::Final(Err(FtpError::from_reply(code, &reply.text))),
        _ => {}
    }

    let payload = match (code / 10) % 10 {
        0 if code == 200 => Ok(ReplyPayload::None),
        1 if (211..=215).contains(&code) => Ok(ReplyPayload::Text(reply.text.clone())),
        2 => match code {
            221 | 225 | 226 => Ok(ReplyPayload::None),
            227 => parse_pasv(&reply.text).map(ReplyPayload::Passive),
            229 => parse_epsv(&reply.text).map(ReplyPayload::Passive),
            _ => Err(unexpected(reply)),
        },
        3 => match code {
            331 => Ok(ReplyPayload::NeedPassword(true)),
            230 => Ok(ReplyPayload::NeedPassword(false)),
            _ => Err(unexpected(reply)),
        },
        5 => match code {
            257 => parse_quoted_path(&reply.text).map(ReplyPayload::Path),
            250 | 350 => Ok(ReplyPayload::None),
            _ => Err(unexpected(reply)),
        },
        _ => Err(unexpected(reply)),
    };

    Interpretation::Final(payload.map(|payload| Completion {
        code,
        text: reply.text.clone(),
        payload,
    }))
}

fn unexpected(reply: &Reply) -> FtpError {
    FtpError::unexpected_reply(reply.code, reply.text.clone())
}

// ─── Payload parsers ─────────────────────────────────────────────────

/// Parse `h1,h2,h3,h4,p1,p2` from a 227 reply.
///
/// Some servers send negative port bytes; the combined port is range checked.
pub fn parse_pasv(text: &str) -> FtpResult<PassiveEndpoint> {
    let caps = RE_PASV
        .captures(text)
        .ok_or_else(|| FtpError::parse_error(format!("Cannot parse PASV reply: {}", text)))?;

    let mut octets = [0u8; 4];
    for (i, octet) in octets.iter_mut().enumerate() {
        *octet = caps[i + 1]
            .parse::<u8>()
            .map_err(|_| FtpError::parse_error(format!("PASV address out of range: {}", text)))?;
    }
    let hi: i64 = caps[5]
        .parse()
        .map_err(|_| FtpError::parse_error(format!("Bad PASV port: {}", text)))?;
    let lo: i64 = caps[6]
        .parse()
        .map_err(|_| FtpError::parse_error(format!("Bad PASV port: {}", text)))?;
    let port = u16::try_from(hi * 256 + lo)
        .map_err(|_| FtpError::parse_error(format!("PASV port out of range: {}", text)))?;

    Ok(PassiveEndpoint {
        ip: Some(IpAddr::V4(Ipv4Addr::from(octets))),
        port,
    })
}

/// Parse `(|||port|)` from a 229 reply.
pub fn parse_epsv(text: &str) -> FtpResult<PassiveEndpoint> {
    let caps = RE_EPSV
        .captures(text)
        .ok_or_else(|| FtpError::parse_error(format!("Cannot parse EPSV reply: {}", text)))?;
    let port = caps[1]
        .parse::<u16>()
        .map_err(|_| FtpError::parse_error(format!("EPSV port out of range: {}", text)))?;
    Ok(PassiveEndpoint { ip: None, port })
}

/// Extract the quoted path of a 257 reply; `""` inside the quotes is a literal quote.
pub fn parse_quoted_path(text: &str) -> FtpResult<String> {
    let start = text
        .find('"')
        .ok_or_else(|| FtpError::parse_error(format!("No quoted path in reply: {}", text)))?;

    let mut path = String::new();
    let mut chars = text[start + 1..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                path.push('"');
            } else {
                return Ok(path);
            }
        } else {
            path.push(c);
        }
    }
    Err(FtpError::parse_error(format!("Unterminated quoted path: {}", text)))
}

/// Parse an MDTM timestamp (`YYYYMMDDHHMMSS[.fff]`, UTC). Fractions are dropped.
pub fn parse_mdtm(text: &str) -> FtpResult<DateTime<Utc>> {
    let text = text.trim();
    let invalid = || FtpError::parse_error(format!("Invalid date/time format from server: {}", text));
    let caps = RE_MDTM.captures(text).ok_or_else(invalid)?;
    let stamp = format!(
        "{}-{}-{} {}:{}:{}",
        &caps[1], &caps[2], &caps[3], &caps[4], &caps[5], &caps[6]
    );
    let naive = NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S").map_err(|_| invalid())?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Parse a SIZE reply body.
pub fn parse_size(text: &str) -> FtpResult<u64> {
    text.trim()
        .parse::<u64>()
        .map_err(|_| FtpError::parse_error(format!("Invalid SIZE reply: {}", text)))
}
