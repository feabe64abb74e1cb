//! Shared types for the FTP client crate.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

// ─── Connection / Session ────────────────────────────────────────────

/// How the data channel is negotiated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PassiveMode {
    /// `PASV` (RFC 959), IPv4 address and port in the reply.
    Passive,
    /// `EPSV` (RFC 2428), port only; the control peer address is reused.
    ExtendedPassive,
}

impl Default for PassiveMode {
    fn default() -> Self {
        Self::Passive
    }
}

/// Thresholds for inferring the year of "recent" Unix listing dates.
///
/// `ls -l` prints `Mon DD HH:MM` without a year for recent files. The year is
/// taken from the local clock and pulled back one year when the result lands
/// too far in the future or too far in the past.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DateHeuristics {
    #[serde(default = "default_future_skew")]
    pub future_skew_ms: i64,
    #[serde(default = "default_past_skew")]
    pub past_skew_ms: i64,
}

/// 28 hours.
pub const DEFAULT_FUTURE_SKEW_MS: i64 = 100_800_000;
/// 186 days.
pub const DEFAULT_PAST_SKEW_MS: i64 = 16_070_400_000;

fn default_future_skew() -> i64 {
    DEFAULT_FUTURE_SKEW_MS
}
fn default_past_skew() -> i64 {
    DEFAULT_PAST_SKEW_MS
}

impl Default for DateHeuristics {
    fn default() -> Self {
        Self {
            future_skew_ms: DEFAULT_FUTURE_SKEW_MS,
            past_skew_ms: DEFAULT_PAST_SKEW_MS,
        }
    }
}

/// Configuration for a single FTP connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    /// `None` makes a 331 reply to USER fail the login.
    #[serde(default = "default_password")]
    pub password: Option<String>,
    /// Deadline for the TCP connect plus the login handshake.
    #[serde(default = "default_timeout")]
    pub connect_timeout_ms: u64,
    /// Deadline for each passive data connect attempt.
    #[serde(default = "default_timeout")]
    pub data_timeout_ms: u64,
    /// Idle NOOP interval (0 = disabled).
    #[serde(default = "default_timeout")]
    pub keepalive_interval_ms: u64,
    #[serde(default)]
    pub passive_mode: PassiveMode,
    /// Fail listings on lines no parser recognises instead of passing them through.
    #[serde(default)]
    pub strict_listing: bool,
    #[serde(default)]
    pub date_heuristics: DateHeuristics,
    /// Most bytes buffered for one unfinished control reply before the
    /// session is failed.
    #[serde(default = "default_max_reply_bytes")]
    pub max_reply_bytes: usize,
}

fn default_port() -> u16 {
    21
}
fn default_user() -> String {
    "anonymous".into()
}
fn default_password() -> Option<String> {
    Some("anonymous@".into())
}
fn default_timeout() -> u64 {
    10_000
}
fn default_max_reply_bytes() -> usize {
    1024 * 1024
}

impl Default for FtpConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            user: default_user(),
            password: default_password(),
            connect_timeout_ms: default_timeout(),
            data_timeout_ms: default_timeout(),
            keepalive_interval_ms: default_timeout(),
            passive_mode: PassiveMode::Passive,
            strict_listing: false,
            date_heuristics: DateHeuristics::default(),
            max_reply_bytes: default_max_reply_bytes(),
        }
    }
}

impl FtpConnectionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_millis(self.data_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_ms > 0).then(|| Duration::from_millis(self.keepalive_interval_ms))
    }
}

/// Lifecycle of the control connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// Socket open, greeting not yet received.
    Unauthenticated,
    /// Greeting received; USER sent, reply not yet in.
    Connected,
    /// USER/PASS exchange in progress.
    Authenticating,
    /// Logged in; commands may be issued.
    Authorized,
    Closed,
}

/// Events reported by a session outside of any single command.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Server greeting text (220).
    Greeting(String),
    /// Login, FEAT and `TYPE I` finished.
    Ready,
    /// Transport failure while no operation was pending.
    Error(crate::ftp::error::FtpError),
    /// The server closed the control connection.
    End,
    Closed { had_error: bool },
}

// ─── Control channel ─────────────────────────────────────────────────

/// One complete server reply, possibly assembled from several lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub code: u16,
    /// Reply text with the leading `NNN ` / `NNN-` of every line removed, trimmed.
    pub text: String,
    pub multi_line: bool,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            multi_line: false,
        }
    }

    /// Positive-preliminary reply (1xx).
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Transient or permanent negative reply (4xx/5xx).
    pub fn is_negative(&self) -> bool {
        self.code >= 400
    }
}

/// A command line for the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: String,
    pub argument: Option<String>,
}

impl Command {
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            argument: None,
        }
    }

    pub fn with_arg(verb: impl Into<String>, argument: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            argument: Some(argument.into()),
        }
    }

    /// Bytes to write, CRLF terminated.
    pub fn to_wire(&self) -> Vec<u8> {
        match &self.argument {
            Some(arg) => format!("{} {}\r\n", self.verb, arg).into_bytes(),
            None => format!("{}\r\n", self.verb).into_bytes(),
        }
    }

    pub fn is(&self, verb: &str) -> bool {
        self.verb.eq_ignore_ascii_case(verb)
    }
}

/// Log-safe rendering; the PASS argument is masked.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.argument {
            Some(_) if self.is("PASS") => write!(f, "{} ****", self.verb),
            Some(arg) => write!(f, "{} {}", self.verb, arg),
            None => write!(f, "{}", self.verb),
        }
    }
}

/// Where the server listens for a passive data connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassiveEndpoint {
    /// `None` for EPSV replies, which only carry a port.
    pub ip: Option<IpAddr>,
    pub port: u16,
}

impl PassiveEndpoint {
    /// Resolve against the control connection's peer when no IP was given.
    pub fn socket_addr(&self, control_peer: Option<IpAddr>) -> Option<SocketAddr> {
        self.ip
            .or(control_peer)
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

/// What a successful terminal reply carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPayload {
    None,
    Text(String),
    /// `true` after USER when a password must follow (331), `false` when logged in (230).
    NeedPassword(bool),
    /// Path from a 257 reply with doubled quotes collapsed.
    Path(String),
    Passive(PassiveEndpoint),
}

/// Successful completion of one queued command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub code: u16,
    pub text: String,
    pub payload: ReplyPayload,
}

impl Completion {
    pub fn text_payload(&self) -> &str {
        match &self.payload {
            ReplyPayload::Text(t) | ReplyPayload::Path(t) => t,
            _ => &self.text,
        }
    }
}

/// How a data transfer ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferOutcome {
    Completed,
    /// ABOR was requested while the data channel was open.
    Aborted,
}

// ─── Server Capabilities ─────────────────────────────────────────────

/// Parsed FEAT reply: uppercase keyword → optional parameter string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFeatures {
    pub entries: BTreeMap<String, Option<String>>,
}

impl ServerFeatures {
    /// Build from the text of a 211 FEAT reply (code prefixes already removed).
    ///
    /// The first line ("Features:") and the last ("End") are framing.
    pub fn from_feat_text(text: &str) -> Self {
        let mut lines: Vec<&str> = text.split('\n').collect();
        if !lines.is_empty() {
            lines.remove(0);
        }
        lines.pop();

        let mut entries = BTreeMap::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, param) = match line.split_once(' ') {
                Some((k, p)) => (k, Some(p.trim().to_string()).filter(|p| !p.is_empty())),
                None => (line, None),
            };
            entries.insert(key.to_ascii_uppercase(), param);
        }
        Self { entries }
    }

    pub fn supports(&self, keyword: &str) -> bool {
        self.entries.contains_key(&keyword.to_ascii_uppercase())
    }

    pub fn param(&self, keyword: &str) -> Option<&str> {
        self.entries
            .get(&keyword.to_ascii_uppercase())
            .and_then(|p| p.as_deref())
    }

    /// MLSD is defined together with MLST; servers advertise one or both.
    pub fn supports_mlsd(&self) -> bool {
        self.supports("MLST") || self.supports("MLSD")
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Directory Listing ───────────────────────────────────────────────

/// Type of a remote filesystem entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

impl EntryKind {
    /// Type character of a Unix permission string.
    pub fn from_type_char(c: char) -> Self {
        match c {
            '-' => Self::File,
            'd' => Self::Directory,
            'l' => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    pub fn type_char(&self) -> char {
        match self {
            Self::File => '-',
            Self::Directory => 'd',
            Self::Symlink => 'l',
            Self::Unknown => '?',
        }
    }
}

/// Permission letters per class with dashes removed, e.g. `"rwx"`, `"rx"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rights {
    pub user: String,
    pub group: String,
    pub other: String,
}

impl Rights {
    /// Re-encode as the 9-character `ls -l` mode string.
    pub fn to_mode_string(&self, sticky: bool) -> String {
        let mut out = String::with_capacity(9);
        out.push_str(&encode_triplet(&self.user));
        out.push_str(&encode_triplet(&self.group));
        if sticky {
            let mut other = encode_triplet(&self.other);
            let exec = if self.other.contains('x') { 't' } else { 'T' };
            other.replace_range(2..3, &exec.to_string());
            out.push_str(&other);
        } else {
            out.push_str(&encode_triplet(&self.other));
        }
        out
    }
}

fn encode_triplet(letters: &str) -> String {
    let r = if letters.contains('r') { 'r' } else { '-' };
    let w = if letters.contains('w') { 'w' } else { '-' };
    let x = letters
        .chars()
        .find(|c| matches!(c, 'x' | 's' | 'S' | 't' | 'T'))
        .unwrap_or('-');
    [r, w, x].iter().collect()
}

/// Listing timestamp; `ls -l` omits the time for entries older than six months.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ListingTime {
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl ListingTime {
    pub fn date(&self) -> NaiveDate {
        match self {
            Self::Date(d) => *d,
            Self::DateTime(dt) => dt.date(),
        }
    }

    /// Midnight for date-only values.
    pub fn naive(&self) -> NaiveDateTime {
        match self {
            Self::Date(d) => d.and_hms_opt(0, 0, 0).unwrap_or_default(),
            Self::DateTime(dt) => *dt,
        }
    }
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// One structured directory entry (LIST or MLSD).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingEntry {
    pub kind: EntryKind,
    pub name: String,
    /// Set for every symlink, empty when the server omitted ` -> target`.
    pub target: Option<String>,
    pub sticky: bool,
    /// `+` suffix on the permission string.
    pub acl: bool,
    pub rights: Option<Rights>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub size: u64,
    pub modified: Option<ListingTime>,
    /// MLSD fact map, lowercase keys.
    #[serde(default)]
    pub facts: HashMap<String, String>,
}

impl ListingEntry {
    pub fn new(kind: EntryKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            target: None,
            sticky: false,
            acl: false,
            rights: None,
            owner: None,
            group: None,
            size: 0,
            modified: None,
            facts: HashMap::new(),
        }
    }

    /// Render back to an `ls -l` line. `None` when the entry lacks the
    /// Unix-only parts (rights, owner, group, date).
    pub fn to_unix_line(&self) -> Option<String> {
        let rights = self.rights.as_ref()?;
        let owner = self.owner.as_deref()?;
        let group = self.group.as_deref()?;
        let modified = self.modified?;
        let date = modified.date();
        let month = MONTHS[date.month0() as usize];
        let stamp = match modified {
            ListingTime::DateTime(dt) => {
                format!("{} {:>2} {:02}:{:02}", month, date.day(), dt.hour(), dt.minute())
            }
            ListingTime::Date(_) => format!("{} {:>2}  {}", month, date.day(), date.year()),
        };
        let name = match (&self.kind, &self.target) {
            (EntryKind::Symlink, Some(target)) => format!("{} -> {}", self.name, target),
            _ => self.name.clone(),
        };
        Some(format!(
            "{}{}{} 1 {} {} {} {} {}",
            self.kind.type_char(),
            rights.to_mode_string(self.sticky),
            if self.acl { "+" } else { "" },
            owner,
            group,
            self.size,
            stamp,
            name
        ))
    }
}

/// A listing line: structured when a format matched, raw otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ListItem {
    Entry(ListingEntry),
    Raw(String),
}

impl ListItem {
    pub fn entry(&self) -> Option<&ListingEntry> {
        match self {
            Self::Entry(e) => Some(e),
            Self::Raw(_) => None,
        }
    }
}
