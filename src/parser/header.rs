//! RFC 5322 header block parsing: the envelope collaborator of the mailbox parser.
//!
//! The mailbox parser only needs to know where the header ends, what length
//! the header claims for the body, and enough structure to recognise the same
//! message again after a re-parse. [`EnvelopeParser`] is the seam; the default
//! [`HeaderParser`] handles folding, RFC 2047 encoded-words and dates.

use std::io::BufRead;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::model::address::EmailAddress;
use crate::model::envelope::{BodyShape, Envelope, MediaType, Parameter, TransferEncoding};
use crate::model::message::{ContentLength, MessageFlags};

/// Everything learned from one header block.
#[derive(Debug, Clone)]
pub struct ParsedHeader {
    pub envelope: Envelope,
    pub body: BodyShape,
    /// `MIME-Version` was present.
    pub mime: bool,
    /// `Content-Length` hint. Not trusted until the parser verifies it.
    pub content_length: ContentLength,
    /// `Lines` hint, zero when absent.
    pub lines: u64,
    /// On-disk flags from `Status` / `X-Status`.
    pub flags: MessageFlags,
    /// Bytes belonging to the header block, terminating blank line included.
    pub consumed: u64,
}

impl Default for ParsedHeader {
    fn default() -> Self {
        Self {
            envelope: Envelope::default(),
            body: BodyShape::default(),
            mime: false,
            content_length: ContentLength::Unknown,
            lines: 0,
            flags: MessageFlags::default(),
            consumed: 0,
        }
    }
}

/// Parses the header block at the current stream position.
///
/// Implementations may read past the end of the header; the caller
/// repositions the stream at `start + consumed` afterwards.
pub trait EnvelopeParser {
    fn parse_header(&self, reader: &mut dyn BufRead) -> std::io::Result<ParsedHeader>;
}

/// Default envelope parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderParser;

impl EnvelopeParser for HeaderParser {
    fn parse_header(&self, reader: &mut dyn BufRead) -> std::io::Result<ParsedHeader> {
        let (raw, consumed) = read_header_block(reader)?;
        let mut parsed = parse_header_bytes(&raw);
        parsed.consumed = consumed;
        Ok(parsed)
    }
}

/// Collect header lines up to the first blank line.
///
/// A line that is neither a header field, a continuation, nor a quoted
/// `>From ` line also ends the header, but is not counted as consumed.
fn read_header_block(reader: &mut dyn BufRead) -> std::io::Result<(Vec<u8>, u64)> {
    let mut raw = Vec::with_capacity(2048);
    let mut line = Vec::with_capacity(256);
    let mut consumed: u64 = 0;

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        if line == b"\n" || line == b"\r\n" {
            consumed += n as u64;
            break;
        }
        let continuation = line[0] == b' ' || line[0] == b'\t';
        if !continuation && !is_field_line(&line) && !line.starts_with(b">From ") {
            debug!("header ended without a blank line");
            break;
        }
        consumed += n as u64;
        raw.extend_from_slice(&line);
    }

    Ok((raw, consumed))
}

/// `name:` with a non-empty name made of printable, non-space characters.
fn is_field_line(line: &[u8]) -> bool {
    match line.iter().position(|&b| b == b':') {
        Some(0) | None => false,
        Some(colon) => line[..colon].iter().all(|&b| b.is_ascii_graphic()),
    }
}

/// Build a [`ParsedHeader`] from raw header bytes (no envelope line).
pub fn parse_header_bytes(raw: &[u8]) -> ParsedHeader {
    let text = decode_header_bytes(raw);
    let headers = unfold_headers(&text);
    let get = |name: &str| get_header(&headers, name);
    let addresses = |name: &str| {
        get(name)
            .map(|v| EmailAddress::parse_list(&decode_encoded_words(v)))
            .unwrap_or_default()
    };

    let envelope = Envelope {
        message_id: get("message-id").map(extract_angle_bracket),
        subject: get("subject").map(decode_encoded_words),
        references: get("references")
            .map(extract_all_angle_brackets)
            .unwrap_or_default(),
        from: addresses("from"),
        sender: addresses("sender"),
        reply_to: addresses("reply-to"),
        to: addresses("to"),
        cc: addresses("cc"),
        return_path: addresses("return-path"),
        date_sent: get("date").and_then(parse_date),
    };

    let mut body = get("content-type")
        .map(parse_content_type)
        .unwrap_or_default();
    if let Some(cte) = get("content-transfer-encoding") {
        body.encoding = TransferEncoding::from_name(cte);
    }
    body.description = get("content-description").map(decode_encoded_words);

    let content_length = match get("content-length").map(|v| v.trim().parse::<u64>()) {
        Some(Ok(n)) => ContentLength::Known(n),
        Some(Err(_)) => {
            debug!("ignoring malformed Content-Length");
            ContentLength::Unknown
        }
        None => ContentLength::Unknown,
    };

    let lines = get("lines")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0);

    let mut flags = MessageFlags::default();
    if let Some(status) = get("status") {
        flags.read = status.contains('R');
        flags.old = status.contains('O');
    }
    if let Some(xstatus) = get("x-status") {
        flags.replied = xstatus.contains('A');
        flags.flagged = xstatus.contains('F');
    }

    ParsedHeader {
        envelope,
        body,
        mime: get("mime-version").is_some(),
        content_length,
        lines,
        flags,
        consumed: 0,
    }
}

/// Decode raw header bytes: UTF-8 when valid, Windows-1252 otherwise.
fn decode_header_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Join continuation lines. Returns `(lowercase_name, value)` pairs in order.
fn unfold_headers(text: &str) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = out.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            out.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }
    out
}

/// First value for a header name.
fn get_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Split `type/subtype; attr=value; ...` into a [`BodyShape`].
fn parse_content_type(value: &str) -> BodyShape {
    let mut parts = split_params(value).into_iter();
    let mime = parts.next().unwrap_or_default().to_ascii_lowercase();
    let (top, sub) = mime.split_once('/').unwrap_or((mime.as_str(), ""));

    let parameters = parts
        .filter_map(|p| {
            let (attr, val) = p.split_once('=')?;
            Some(Parameter {
                attribute: attr.trim().to_ascii_lowercase(),
                value: val.trim().trim_matches('"').to_string(),
            })
        })
        .collect();

    BodyShape {
        media_type: MediaType::from_name(top.trim()),
        subtype: sub.trim().to_string(),
        parameters,
        ..BodyShape::default()
    }
}

/// Split on `;` outside double quotes.
fn split_params(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in value.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            ';' if !quoted => parts.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Decode RFC 2047 encoded-words.
///
/// Whitespace between two adjacent encoded-words is dropped (RFC 2047 §6.2).
/// A token that fails to decode is kept verbatim.
pub fn decode_encoded_words(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    let mut after_word = false;

    while let Some(start) = rest.find("=?") {
        let gap = &rest[..start];
        if !(after_word && gap.trim().is_empty()) {
            out.push_str(gap);
        }
        match decode_one_word(&rest[start + 2..]) {
            Some((text, used)) => {
                out.push_str(&text);
                rest = &rest[start + 2 + used..];
                after_word = true;
            }
            None => {
                out.push_str("=?");
                rest = &rest[start + 2..];
                after_word = false;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Decode `charset?enc?text?=`. Returns the text and the bytes used.
fn decode_one_word(s: &str) -> Option<(String, usize)> {
    let mut fields = s.splitn(3, '?');
    let charset = fields.next()?;
    let encoding = fields.next()?;
    let tail = fields.next()?;
    let end = tail.find("?=")?;
    let payload = &tail[..end];
    let used = charset.len() + encoding.len() + 2 + end + 2;

    let bytes = match encoding {
        "B" | "b" => decode_base64(payload)?,
        "Q" | "q" => decode_q(payload),
        _ => return None,
    };

    // RFC 2231 language suffix: charset*lang
    let charset = charset.split('*').next().unwrap_or(charset);
    let text = match encoding_rs::Encoding::for_label(charset.as_bytes()) {
        Some(enc) => enc.decode(&bytes).0.into_owned(),
        None => {
            warn!(charset = charset, "Unknown charset, falling back to UTF-8 lossy");
            String::from_utf8_lossy(&bytes).into_owned()
        }
    };
    Some((text, used))
}

fn decode_base64(input: &str) -> Option<Vec<u8>> {
    fn value(c: u8) -> Option<u32> {
        Some(match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a' + 26,
            b'0'..=b'9' => c - b'0' + 52,
            b'+' => 62,
            b'/' => 63,
            _ => return None,
        } as u32)
    }

    let mut out = Vec::with_capacity(input.len() * 3 / 4);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for &c in input.as_bytes() {
        if c == b'=' {
            break;
        }
        if c.is_ascii_whitespace() {
            continue;
        }
        acc = (acc << 6) | value(c)?;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }
    Some(out)
}

/// Q-encoding: `_` is a space, `=XX` a hex byte.
fn decode_q(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => out.push(b' '),
            b'=' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'='),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    out
}

/// The `<...>` token of a Message-ID style header, or the trimmed value.
fn extract_angle_bracket(s: &str) -> String {
    let trimmed = s.trim();
    if let Some(start) = trimmed.find('<') {
        if let Some(len) = trimmed[start..].find('>') {
            return trimmed[start..=start + len].to_string();
        }
    }
    trimmed.to_string()
}

/// All `<...>` tokens in order (References).
fn extract_all_angle_brackets(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start..].find('>') else {
            break;
        };
        out.push(rest[start..=start + len].to_string());
        rest = &rest[start + len + 1..];
    }
    out
}

/// Parse a `Date:` header value into UTC.
///
/// RFC 2822 first, then a handful of formats seen in the wild, then
/// `mail-parser` as a last resort.
pub fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    // Drop a trailing "(PST)" comment and a leading day of week.
    let no_comment = match trimmed.find(" (") {
        Some(pos) if trimmed.ends_with(')') => &trimmed[..pos],
        _ => trimmed,
    };
    let core = match no_comment.split_once(", ") {
        Some((dow, rest)) if dow.len() == 3 => rest,
        _ => no_comment,
    };
    let core = replace_named_zone(core);

    const WITH_ZONE: [&str; 3] = ["%d %b %Y %H:%M:%S %z", "%d %b %Y %H:%M %z", "%Y-%m-%d %H:%M:%S %z"];
    const WITHOUT_ZONE: [&str; 3] = ["%d %b %Y %H:%M:%S", "%Y-%m-%d %H:%M:%S", "%d-%b-%Y %H:%M:%S"];

    for fmt in WITH_ZONE {
        if let Ok(dt) = DateTime::parse_from_str(&core, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in WITHOUT_ZONE {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(&core, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }

    if let Some(dt) = mail_parser_date(trimmed) {
        return Some(dt);
    }

    debug!(date = trimmed, "Could not parse date");
    None
}

fn mail_parser_date(input: &str) -> Option<DateTime<Utc>> {
    let wrapped = format!("Date: {input}\n\n");
    let parsed = mail_parser::MessageParser::default().parse(wrapped.as_bytes())?;
    let rfc3339 = parsed.date()?.to_rfc3339();
    DateTime::parse_from_rfc3339(&rfc3339)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Replace a trailing zone abbreviation with its numeric offset.
fn replace_named_zone(s: &str) -> String {
    const ZONES: [(&str, &str); 12] = [
        ("EST", "-0500"),
        ("EDT", "-0400"),
        ("CST", "-0600"),
        ("CDT", "-0500"),
        ("MST", "-0700"),
        ("MDT", "-0600"),
        ("PST", "-0800"),
        ("PDT", "-0700"),
        ("GMT", "+0000"),
        ("UTC", "+0000"),
        ("UT", "+0000"),
        ("CET", "+0100"),
    ];
    for (name, offset) in ZONES {
        if let Some(head) = s.strip_suffix(name) {
            if head.ends_with(' ') {
                return format!("{head}{offset}");
            }
        }
    }
    s.to_string()
}
