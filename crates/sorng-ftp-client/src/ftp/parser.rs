//! LIST / MLSD line parser.
//!
//! Supports three formats:
//! 1. **Unix-style** (`ls -l`): `-rwxr-xr-x 1 owner group 1234 Jan  1 12:00 file.txt`
//! 2. **MS-DOS/IIS-style**: `01-01-26  12:00AM       1234 file.txt`
//! 3. **MLSD facts** (RFC 3659): `type=file;size=1234;modify=20260101120000; file.txt`
//!
//! Unix is tried first, then MS-DOS. MLSD facts are only recognised when the
//! caller is reading an MLSD listing. A `total N` header yields nothing; any
//! other unrecognised line is passed through raw.

use crate::ftp::types::{
    DateHeuristics, EntryKind, ListItem, ListingEntry, ListingTime, Rights,
};
use chrono::{Datelike, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::HashMap;

lazy_static! {
    static ref RE_UNIX: Regex = Regex::new(
        r"(?x)
        ^(?P<type>[-ld])
        (?P<perm>(?:[-r][-w][-xsStT]){3})
        (?P<acl>\+)?\s+
        (?P<links>\d+)\s+
        (?P<owner>\S+)\s+
        (?P<group>\S+)\s+
        (?P<size>\d+)\s+
        (?:
            (?P<month1>\w{3})\s+(?P<day1>\d{1,2})\s+(?P<hour>\d{1,2}):(?P<minute>\d{2})
          | (?P<month2>\w{3})\s+(?P<day2>\d{1,2})\s+(?P<year>\d{4})
        )\s+
        (?P<name>.+)$
        "
    )
    .unwrap();
    static ref RE_MSDOS: Regex = Regex::new(
        r"(?x)
        ^(?P<month>\d{2})[-/](?P<day>\d{2})[-/](?P<year>\d{2,4})\s+
        (?P<hour>\d{2}):(?P<minute>\d{2})\s?(?P<ampm>[AaPp][Mm]?)\s+
        (?:(?P<size>\d+)|(?P<dir><DIR>))\s+
        (?P<name>.+)$
        "
    )
    .unwrap();
    static ref RE_TOTAL: Regex = Regex::new(r"^total\b").unwrap();
}

/// Which listing command produced the lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListingContext {
    #[default]
    List,
    Mlsd,
}

/// Stateless listing-line parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListingParser {
    heuristics: DateHeuristics,
}

impl ListingParser {
    pub fn new(heuristics: DateHeuristics) -> Self {
        Self { heuristics }
    }

    /// Parse one LIST line against the local clock.
    pub fn parse_line(&self, line: &str) -> Option<ListItem> {
        self.parse_line_at(line, ListingContext::List, Local::now().naive_local())
    }

    /// Parse one line, resolving year-less dates relative to `now`.
    pub fn parse_line_at(
        &self,
        line: &str,
        context: ListingContext,
        now: NaiveDateTime,
    ) -> Option<ListItem> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }

        if let Some(caps) = RE_UNIX.captures(line) {
            if let Some(entry) = self.unix_entry(&caps, now) {
                return Some(ListItem::Entry(entry));
            }
        } else if let Some(caps) = RE_MSDOS.captures(line) {
            if let Some(entry) = msdos_entry(&caps) {
                return Some(ListItem::Entry(entry));
            }
        } else if context == ListingContext::Mlsd {
            if let Some(entry) = parse_mlsd_entry(line) {
                return Some(ListItem::Entry(entry));
            }
        }

        if RE_TOTAL.is_match(line) {
            return None;
        }
        Some(ListItem::Raw(line.to_string()))
    }

    fn unix_entry(&self, caps: &Captures<'_>, now: NaiveDateTime) -> Option<ListingEntry> {
        let kind = EntryKind::from_type_char(caps["type"].chars().next()?);
        let (rights, sticky) = parse_rights(&caps["perm"]);
        let size = caps["size"].parse::<u64>().ok()?;

        let modified = if let Some(year) = caps.name("year") {
            let month = month_number(&caps["month2"])?;
            let day = caps["day2"].parse().ok()?;
            ListingTime::Date(NaiveDate::from_ymd_opt(year.as_str().parse().ok()?, month, day)?)
        } else {
            let month = month_number(&caps["month1"])?;
            let day: u32 = caps["day1"].parse().ok()?;
            let time = NaiveTime::from_hms_opt(
                caps["hour"].parse().ok()?,
                caps["minute"].parse().ok()?,
                0,
            )?;
            ListingTime::DateTime(infer_recent_date(month, day, time, now, &self.heuristics)?)
        };

        let raw_name = &caps["name"];
        let (name, target) = if kind == EntryKind::Symlink {
            match raw_name.split_once(" -> ") {
                Some((name, target)) => (name.to_string(), Some(target.to_string())),
                None => (raw_name.to_string(), Some(String::new())),
            }
        } else {
            (raw_name.to_string(), None)
        };

        Some(ListingEntry {
            kind,
            name,
            target,
            sticky,
            acl: caps.name("acl").is_some(),
            rights: Some(rights),
            owner: Some(caps["owner"].to_string()),
            group: Some(caps["group"].to_string()),
            size,
            modified: Some(modified),
            facts: HashMap::new(),
        })
    }
}

/// Parse one LIST line with default heuristics against the local clock.
pub fn parse_list_entry(line: &str) -> Option<ListItem> {
    ListingParser::default().parse_line(line)
}

/// Split a whole LIST body into items.
pub fn parse_listing(raw: &str) -> Vec<ListItem> {
    let parser = ListingParser::default();
    raw.lines().filter_map(|l| parser.parse_line(l)).collect()
}

// ─── Unix helpers ────────────────────────────────────────────────────

/// Split a 9-character mode string into per-class letters.
///
/// Dashes are dropped. A trailing `t` on the "other" class means sticky plus
/// execute, a trailing `T` sticky without execute.
fn parse_rights(perm: &str) -> (Rights, bool) {
    let letters = |s: &str| s.chars().filter(|c| *c != '-').collect::<String>();
    let user = letters(&perm[0..3]);
    let group = letters(&perm[3..6]);
    let mut other = letters(&perm[6..9]);

    let mut sticky = false;
    if other.ends_with('t') {
        other.pop();
        other.push('x');
        sticky = true;
    } else if other.ends_with('T') {
        other.pop();
        sticky = true;
    }

    (Rights { user, group, other }, sticky)
}

fn month_number(name: &str) -> Option<u32> {
    let month = match name.to_ascii_lowercase().as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// Place a year-less `Mon DD HH:MM` stamp in a year.
///
/// Start from `now`'s year; more than `future_skew_ms` ahead of `now` or more
/// than `past_skew_ms` behind it means the previous year.
fn infer_recent_date(
    month: u32,
    day: u32,
    time: NaiveTime,
    now: NaiveDateTime,
    heuristics: &DateHeuristics,
) -> Option<NaiveDateTime> {
    let at_year = |year: i32| NaiveDate::from_ymd_opt(year, month, day).map(|d| d.and_time(time));
    let year = now.year();
    // Feb 29 only exists in leap years; fall back to the closest earlier one.
    let earlier = || (1..=8).find_map(|back| at_year(year - back));

    let mut stamp = match at_year(year) {
        Some(s) => s,
        None => return earlier(),
    };
    if stamp - now > skew(heuristics.future_skew_ms) {
        stamp = earlier()?;
    }
    if now - stamp > skew(heuristics.past_skew_ms) {
        stamp = earlier()?;
    }
    Some(stamp)
}

fn skew(ms: i64) -> Duration {
    const CENTURY_MS: i64 = 100 * 366 * 86_400_000;
    Duration::milliseconds(ms.clamp(-CENTURY_MS, CENTURY_MS))
}

// ─── MS-DOS helpers ──────────────────────────────────────────────────

fn msdos_entry(caps: &Captures<'_>) -> Option<ListingEntry> {
    let year_raw = &caps["year"];
    let mut year: i32 = year_raw.parse().ok()?;
    if year_raw.len() == 2 {
        year += if year < 70 { 2000 } else { 1900 };
    }

    let mut hour: u32 = caps["hour"].parse().ok()?;
    let pm = caps["ampm"].starts_with(['P', 'p']);
    if pm && hour < 12 {
        hour += 12;
    } else if !pm && hour == 12 {
        hour = 0;
    }

    let date = NaiveDate::from_ymd_opt(year, caps["month"].parse().ok()?, caps["day"].parse().ok()?)?;
    let stamp = date.and_time(NaiveTime::from_hms_opt(hour, caps["minute"].parse().ok()?, 0)?);

    let (kind, size) = match caps.name("size") {
        Some(size) => (EntryKind::File, size.as_str().parse().ok()?),
        None => (EntryKind::Directory, 0),
    };

    let mut entry = ListingEntry::new(kind, &caps["name"]);
    entry.size = size;
    entry.modified = Some(ListingTime::DateTime(stamp));
    Some(entry)
}

// ─── MLSD parser ─────────────────────────────────────────────────────

/// Parse an MLSD/MLST fact line: `fact1=val1;fact2=val2; pathname`.
///
/// Facts never contain spaces, so the first space starts the pathname.
pub fn parse_mlsd_entry(line: &str) -> Option<ListingEntry> {
    let (facts_str, name) = line.split_once(' ')?;
    if name.is_empty() || !facts_str.contains('=') {
        return None;
    }

    let mut facts: HashMap<String, String> = HashMap::new();
    for segment in facts_str.split(';') {
        if let Some((k, v)) = segment.split_once('=') {
            facts.insert(k.trim().to_lowercase(), v.to_string());
        }
    }

    let kind = match facts.get("type").map(|s| s.to_lowercase()).as_deref() {
        Some("dir") | Some("cdir") | Some("pdir") => EntryKind::Directory,
        Some("file") => EntryKind::File,
        Some("os.unix=symlink") | Some("os.unix=slink") => EntryKind::Symlink,
        _ => EntryKind::Unknown,
    };

    let mut entry = ListingEntry::new(kind, name);
    entry.size = facts
        .get("size")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    entry.modified = facts
        .get("modify")
        .and_then(|v| parse_mlsd_time(v))
        .map(ListingTime::DateTime);
    if let Some((rights, sticky)) = facts.get("unix.mode").and_then(|m| rights_from_octal(m)) {
        entry.rights = Some(rights);
        entry.sticky = sticky;
    }
    entry.owner = facts.get("unix.owner").cloned();
    entry.group = facts.get("unix.group").cloned();
    if kind == EntryKind::Symlink {
        entry.target = Some(String::new());
    }
    entry.facts = facts;
    Some(entry)
}

/// `YYYYMMDDHHmmSS[.fraction]`, fraction dropped.
fn parse_mlsd_time(s: &str) -> Option<NaiveDateTime> {
    let base = s.get(..14)?;
    NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S").ok()
}

/// Decode `unix.mode` (e.g. `0755`, `1777`).
fn rights_from_octal(mode: &str) -> Option<(Rights, bool)> {
    let bits = u32::from_str_radix(mode.trim(), 8).ok()?;
    let class = |shift: u32| {
        let b = (bits >> shift) & 0o7;
        let mut s = String::new();
        if b & 4 != 0 {
            s.push('r');
        }
        if b & 2 != 0 {
            s.push('w');
        }
        if b & 1 != 0 {
            s.push('x');
        }
        s
    };
    Some((
        Rights {
            user: class(6),
            group: class(3),
            other: class(0),
        },
        bits & 0o1000 != 0,
    ))
}
