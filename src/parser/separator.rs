//! Message boundary recognition for the two flat-file dialects.
//!
//! - **mbox**: every message starts with an envelope line
//!   `From <return-path> <weekday> <month> <day> <time> [tz] <year>`.
//! - **MMDF**: every message is wrapped in a `\x01\x01\x01\x01` sentinel line
//!   at both ends. The sentinel carries no metadata.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};

use crate::error::{MboxError, Result};

/// The MMDF sentinel line, terminator included.
pub const MMDF_SEP: &[u8] = b"\x01\x01\x01\x01\n";

/// Prefix of every mbox envelope line.
pub const FROM_PREFIX: &[u8] = b"From ";

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAYS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Flat-file mailbox dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Mbox,
    Mmdf,
}

impl Dialect {
    /// Whether `line` opens a message in this dialect.
    pub fn is_separator(self, line: &[u8]) -> bool {
        match self {
            Dialect::Mbox => parse_from_line(line).is_some(),
            Dialect::Mmdf => line == MMDF_SEP,
        }
    }

    /// Cheap prefix test used when validating a known position
    /// (content-length checks, append points, splice verification).
    pub fn looks_like_separator(self, line: &[u8]) -> bool {
        match self {
            Dialect::Mbox => line.starts_with(FROM_PREFIX),
            Dialect::Mmdf => line == MMDF_SEP,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Dialect::Mbox => "mbox",
            Dialect::Mmdf => "mmdf",
        }
    }

    /// Guess the dialect of an existing file from its first line.
    ///
    /// An empty file is reported as `default`, since either dialect may
    /// start from nothing.
    pub fn detect(path: &Path, default: Dialect) -> Result<Dialect> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MboxError::FileNotFound(path.to_path_buf())
            } else {
                MboxError::io(path, e)
            }
        })?;
        let mut reader = BufReader::new(file);
        let mut first = Vec::with_capacity(128);
        reader
            .read_until(b'\n', &mut first)
            .map_err(|e| MboxError::io(path, e))?;

        if first.is_empty() {
            Ok(default)
        } else if first.starts_with(FROM_PREFIX) {
            Ok(Dialect::Mbox)
        } else if first == MMDF_SEP {
            Ok(Dialect::Mmdf)
        } else {
            Err(MboxError::InvalidMailbox(path.to_path_buf()))
        }
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mbox" => Ok(Dialect::Mbox),
            "mmdf" => Ok(Dialect::Mmdf),
            other => Err(format!("unknown mailbox dialect '{other}'")),
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata carried by an mbox envelope line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromLine {
    /// Envelope sender, if the line has one.
    pub return_path: Option<String>,
    /// Delivery time. The line is written in local time; this is UTC.
    pub received: DateTime<Utc>,
}

/// Parse an mbox envelope line. Returns `None` if `line` is not one.
///
/// Lenient in the same places real-world writers are sloppy: the return path
/// may be missing or quoted, seconds are optional, up to two timezone tokens
/// may sit between the time and the year, and two-digit years are accepted.
pub fn parse_from_line(line: &[u8]) -> Option<FromLine> {
    let rest = line.strip_prefix(FROM_PREFIX)?;
    let text = String::from_utf8_lossy(rest);
    let mut s = text.trim_end_matches(&['\r', '\n'][..]).trim_start();

    let mut return_path = None;
    if !starts_with_weekday(s) {
        let (addr, after) = split_return_path(s);
        if !addr.is_empty() {
            return_path = Some(addr.to_string());
        }
        s = after.trim_start();
        if !starts_with_weekday(s) {
            return None;
        }
    }

    let mut tokens = s.split_whitespace().skip(1).peekable();

    let month = month_number(tokens.next()?)?;
    let day: u32 = tokens.next()?.parse().ok()?;
    let (hour, minute, second) = parse_clock(tokens.next()?)?;

    // Optional timezone tokens: "PST", "+0100", "MET DST".
    let mut skipped = 0;
    while skipped < 2 {
        match tokens.peek() {
            Some(tok) if starts_like_zone(tok, skipped) => {
                tokens.next();
                skipped += 1;
            }
            _ => break,
        }
    }

    let year = expand_year(leading_number(tokens.next()?)?);

    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;
    let received = match Local.from_local_datetime(&naive).earliest() {
        Some(local) => local.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&naive),
    };

    Some(FromLine {
        return_path,
        received,
    })
}

/// Format an mbox envelope line for `sender` received at `when`.
pub fn format_from_line(sender: &str, when: DateTime<Utc>) -> String {
    let local = when.with_timezone(&Local);
    format!("From {} {}\n", sender, local.format("%a %b %e %H:%M:%S %Y"))
}

fn starts_with_weekday(s: &str) -> bool {
    let Some(word) = s.get(..3) else {
        return false;
    };
    let followed_by_space = s[3..].starts_with(|c: char| c == ' ' || c == '\t');
    followed_by_space && WEEKDAYS.contains(&word.to_ascii_lowercase().as_str())
}

/// Split off the return-path token, honouring double quotes.
fn split_return_path(s: &str) -> (&str, &str) {
    let mut quoted = false;
    let mut escaped = false;
    for (i, ch) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ' ' | '\t' if !quoted => return (&s[..i], &s[i..]),
            _ => {}
        }
    }
    (s, "")
}

fn month_number(tok: &str) -> Option<u32> {
    let lower = tok.get(..3)?.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == lower)
        .map(|i| i as u32 + 1)
}

fn parse_clock(tok: &str) -> Option<(u32, u32, u32)> {
    let mut parts = tok.split(':');
    let hour = parts.next()?.parse().ok()?;
    let minute = parts.next()?.parse().ok()?;
    let second = match parts.next() {
        Some(sec) => sec.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((hour, minute, second))
}

/// The first zone token may be alphabetic or a signed offset, the second only alphabetic.
fn starts_like_zone(tok: &str, already_skipped: usize) -> bool {
    let Some(first) = tok.chars().next() else {
        return false;
    };
    first.is_ascii_alphabetic() || (already_skipped == 0 && (first == '+' || first == '-'))
}

fn leading_number(tok: &str) -> Option<i32> {
    let end = tok
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(tok.len());
    tok[..end].parse().ok()
}

fn expand_year(year: i32) -> i32 {
    match year {
        y if y >= 1900 => y,
        y if y < 70 => 2000 + y,
        y => 1900 + y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_plain_envelope_line() {
        let from = parse_from_line(b"From user@example.com Thu Jan  4 10:00:00 2024\n").unwrap();
        assert_eq!(from.return_path.as_deref(), Some("user@example.com"));
        let local = from.received.with_timezone(&Local);
        assert_eq!(local.year(), 2024);
        assert_eq!(local.month(), 1);
        assert_eq!(local.day(), 4);
        assert_eq!(local.hour(), 10);
    }

    #[test]
    fn test_envelope_line_variants() {
        assert!(parse_from_line(b"From Thu Jan 04 10:00:00 2024\n")
            .unwrap()
            .return_path
            .is_none());
        assert!(parse_from_line(b"From a@b Wed Aug  2 00:39:12 MET DST 1995\n").is_some());
        assert!(parse_from_line(b"From a@b Mon Feb 12 10:00 +0100 2024\r\n").is_some());
        assert_eq!(
            parse_from_line(b"From a@b Mon Feb 12 10:00:00 99\n")
                .unwrap()
                .received
                .with_timezone(&Local)
                .year(),
            1999
        );

        let quoted = parse_from_line(b"From \"john doe\"@x.org Tue Mar  5 08:01:02 2024\n").unwrap();
        assert_eq!(quoted.return_path.as_deref(), Some("\"john doe\"@x.org"));
    }

    #[test]
    fn test_not_envelope_lines() {
        assert!(parse_from_line(b"From the perspective of the user\n").is_none());
        assert!(parse_from_line(b">From user@example.com Thu Jan 04 10:00:00 2024\n").is_none());
        assert!(parse_from_line(b"from user@example.com Thu Jan 04 10:00:00 2024\n").is_none());
        assert!(parse_from_line(b"From a@b Thu Foo 04 10:00:00 2024\n").is_none());
        assert!(parse_from_line(b"From a@b Thu Jan 32 10:00:00 2024\n").is_none());
    }

    #[test]
    fn test_dialect_separators() {
        let from = b"From a@b Thu Jan 04 10:00:00 2024\n";
        assert!(Dialect::Mbox.is_separator(from));
        assert!(!Dialect::Mmdf.is_separator(from));
        assert!(Dialect::Mmdf.is_separator(MMDF_SEP));
        assert!(!Dialect::Mmdf.is_separator(b"\x01\x01\x01\x01\r\n"));
        assert!(Dialect::Mbox.looks_like_separator(b"From anything\n"));
    }

    #[test]
    fn test_format_from_line_roundtrips() {
        let when = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 0).unwrap();
        let line = format_from_line("me@example.com", when);
        let parsed = parse_from_line(line.as_bytes()).unwrap();
        assert_eq!(parsed.return_path.as_deref(), Some("me@example.com"));
        assert_eq!(parsed.received, when);
    }

    #[test]
    fn test_dialect_from_str() {
        assert_eq!("MMDF".parse::<Dialect>().unwrap(), Dialect::Mmdf);
        assert!("maildir".parse::<Dialect>().is_err());
    }

    #[test]
    fn test_detect() {
        let dir = tempfile::tempdir().unwrap();
        let mbox = dir.path().join("a");
        std::fs::write(&mbox, b"From a@b Thu Jan 04 10:00:00 2024\n\n").unwrap();
        assert_eq!(Dialect::detect(&mbox, Dialect::Mmdf).unwrap(), Dialect::Mbox);

        let mmdf = dir.path().join("b");
        std::fs::write(&mmdf, MMDF_SEP).unwrap();
        assert_eq!(Dialect::detect(&mmdf, Dialect::Mbox).unwrap(), Dialect::Mmdf);

        let empty = dir.path().join("c");
        std::fs::write(&empty, b"").unwrap();
        assert_eq!(Dialect::detect(&empty, Dialect::Mmdf).unwrap(), Dialect::Mmdf);

        let junk = dir.path().join("d");
        std::fs::write(&junk, b"hello\n").unwrap();
        assert!(matches!(
            Dialect::detect(&junk, Dialect::Mbox),
            Err(MboxError::InvalidMailbox(_))
        ));
    }
}
