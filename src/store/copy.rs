//! Message re-serialization for compaction and delivery.
//!
//! When a message is rewritten its separator, body and ordinary header
//! fields are copied byte for byte. Only the headers that carry mailbox
//! state (`Status`, `X-Status`, `Content-Length`, `Lines`) are regenerated.

use std::fs::File;
use std::io::{self, Read, Write};

use chrono::{DateTime, Utc};

use crate::model::message::MessageRecord;
use crate::parser::mbox::LineReader;
use crate::parser::separator::{format_from_line, parse_from_line, Dialect, FROM_PREFIX, MMDF_SEP};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Header fields dropped on rewrite and regenerated from the record.
const STATE_HEADERS: [&str; 4] = ["status", "x-status", "content-length", "lines"];

/// Where a copied message landed, relative to the start of the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub offset: u64,
    pub body_offset: u64,
    pub content_length: u64,
    /// Output position after the message and its terminator.
    pub end: u64,
}

/// Read the separator line(s) of the message at the reader's position.
///
/// For MMDF this is the sentinel plus an optional envelope line. Fails with
/// `InvalidData` when the bytes there are not a separator.
pub fn read_separator<R: Read + io::Seek>(
    reader: &mut LineReader<R>,
    dialect: Dialect,
) -> io::Result<Vec<u8>> {
    let start = reader.position();
    let mut line = Vec::with_capacity(128);
    reader.read_line(&mut line)?;
    if !dialect.is_separator(&line) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no message separator at offset {start}"),
        ));
    }

    if dialect == Dialect::Mmdf {
        let after_sep = reader.position();
        let mut next = Vec::with_capacity(128);
        reader.read_line(&mut next)?;
        if parse_from_line(&next).is_some() {
            line.extend_from_slice(&next);
        } else {
            reader.seek_to(after_sep)?;
        }
    }
    Ok(line)
}

/// Copy one message from `src` to `out`, regenerating its state headers.
///
/// `written` is the number of bytes already in `out`.
pub fn copy_message<W: Write>(
    src: &File,
    record: &MessageRecord,
    dialect: Dialect,
    out: &mut W,
    written: u64,
) -> io::Result<Relocation> {
    let content_length = record.content_length.known().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message at offset {} has no known length", record.offset),
        )
    })?;

    let mut reader = LineReader::new(src, COPY_BUFFER_SIZE, record.offset)?;
    let separator = read_separator(&mut reader, dialect)?;

    let header_len = record.body_offset.checked_sub(reader.position()).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "body starts inside the separator")
    })?;
    let mut header = vec![0u8; header_len as usize];
    reader.read_exact(&mut header)?;

    let mut head = Vec::with_capacity(separator.len() + header.len() + 96);
    head.extend_from_slice(&separator);
    write_header(&mut head, &header, record)?;
    out.write_all(&head)?;

    let copied = io::copy(&mut (&mut reader).take(content_length), out)?;
    if copied != content_length {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("message at offset {} is truncated", record.offset),
        ));
    }

    let trailer: &[u8] = match dialect {
        Dialect::Mbox => b"\n",
        Dialect::Mmdf => MMDF_SEP,
    };
    out.write_all(trailer)?;

    let body_offset = written + head.len() as u64;
    Ok(Relocation {
        offset: written,
        body_offset,
        content_length,
        end: body_offset + content_length + trailer.len() as u64,
    })
}

/// Original header minus state fields, then the regenerated state fields
/// and the blank line.
fn write_header(out: &mut Vec<u8>, raw: &[u8], record: &MessageRecord) -> io::Result<()> {
    let mut skipping = false;
    for line in raw.split_inclusive(|&b| b == b'\n') {
        if line == b"\n" || line == b"\r\n" {
            break;
        }
        let continuation = line[0] == b' ' || line[0] == b'\t';
        if !continuation {
            skipping = is_state_header(line);
        }
        if !skipping {
            out.extend_from_slice(line);
            if !line.ends_with(b"\n") {
                out.push(b'\n');
            }
        }
    }

    let flags = &record.flags;
    if flags.read || flags.old {
        out.extend_from_slice(b"Status: ");
        if flags.read {
            out.push(b'R');
        }
        if flags.old {
            out.push(b'O');
        }
        out.push(b'\n');
    }
    if flags.replied || flags.flagged {
        out.extend_from_slice(b"X-Status: ");
        if flags.replied {
            out.push(b'A');
        }
        if flags.flagged {
            out.push(b'F');
        }
        out.push(b'\n');
    }
    let content_length = record.content_length.known().unwrap_or(0);
    write!(out, "Content-Length: {content_length}\nLines: {}\n\n", record.line_count)
}

fn is_state_header(line: &[u8]) -> bool {
    let Some(colon) = line.iter().position(|&b| b == b':') else {
        return false;
    };
    let name = String::from_utf8_lossy(&line[..colon]).trim().to_ascii_lowercase();
    STATE_HEADERS.contains(&name.as_str())
}

/// Wrap a raw RFC 5322 message for delivery into a mailbox.
///
/// An existing envelope line at the top of `raw` is replaced. In mbox,
/// lines starting with `From ` are quoted as `>From `.
pub fn frame_message(
    raw: &[u8],
    dialect: Dialect,
    sender: &str,
    received: DateTime<Utc>,
) -> Vec<u8> {
    let content = match raw.iter().position(|&b| b == b'\n') {
        Some(nl) if parse_from_line(&raw[..=nl]).is_some() => &raw[nl + 1..],
        _ => raw,
    };

    let mut out = Vec::with_capacity(content.len() + 128);
    if dialect == Dialect::Mmdf {
        out.extend_from_slice(MMDF_SEP);
    }
    out.extend_from_slice(format_from_line(sender, received).as_bytes());
    out.push(b'\n');

    for line in content.split_inclusive(|&b| b == b'\n') {
        if dialect == Dialect::Mbox && line.starts_with(FROM_PREFIX) {
            out.push(b'>');
        }
        out.extend_from_slice(line);
    }
    if !content.is_empty() && !content.ends_with(b"\n") {
        out.push(b'\n');
    }

    match dialect {
        Dialect::Mbox => out.push(b'\n'),
        Dialect::Mmdf => out.extend_from_slice(MMDF_SEP),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message::ContentLength;
    use chrono::TimeZone;
    use std::io::Write as _;

    const MESSAGE: &str = "From alice@example.com Thu Jan  4 10:00:00 2024\n\
Subject: Hi\n\
Status: O\n\
Content-Length: 999\n\
X-Spam: folded\n\
 continuation\n\
Lines: 77\n\
\n\
Hello\n\
\n";

    fn record_for(data: &str) -> MessageRecord {
        let mut record = MessageRecord::new(0);
        record.body_offset = data.find("Hello").unwrap() as u64;
        record.content_length = ContentLength::Known(6);
        record.line_count = 1;
        record
    }

    fn temp_with(data: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(data.as_bytes()).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test]
    fn test_copy_message_regenerates_state_headers() {
        let tmp = temp_with(MESSAGE);
        let src = File::open(tmp.path()).unwrap();
        let mut record = record_for(MESSAGE);
        record.flags.read = true;
        record.flags.old = true;
        record.flags.flagged = true;

        let mut out = Vec::new();
        let reloc = copy_message(&src, &record, Dialect::Mbox, &mut out, 100).unwrap();
        let text = String::from_utf8(out.clone()).unwrap();

        assert_eq!(
            text,
            "From alice@example.com Thu Jan  4 10:00:00 2024\n\
Subject: Hi\n\
X-Spam: folded\n\
 continuation\n\
Status: RO\n\
X-Status: F\n\
Content-Length: 6\n\
Lines: 1\n\
\n\
Hello\n\
\n"
        );
        assert_eq!(reloc.offset, 100);
        assert_eq!(reloc.body_offset, 100 + text.find("Hello").unwrap() as u64);
        assert_eq!(reloc.content_length, 6);
        assert_eq!(reloc.end, 100 + out.len() as u64);
    }

    #[test]
    fn test_copy_message_rejects_missing_separator() {
        let data = format!("garbage\n{MESSAGE}");
        let tmp = temp_with(&data);
        let src = File::open(tmp.path()).unwrap();
        let record = record_for(&data);
        let err = copy_message(&src, &record, Dialect::Mbox, &mut Vec::new(), 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_copy_mmdf_keeps_envelope_line() {
        let data = "\x01\x01\x01\x01\nFrom bob@example.com Thu Jan  4 10:00:00 2024\nSubject: x\n\nHello\n\x01\x01\x01\x01\n";
        let tmp = temp_with(data);
        let src = File::open(tmp.path()).unwrap();
        let record = record_for(data);

        let mut out = Vec::new();
        copy_message(&src, &record, Dialect::Mmdf, &mut out, 0).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("\x01\x01\x01\x01\nFrom bob@example.com"));
        assert!(text.ends_with("Lines: 1\n\nHello\n\x01\x01\x01\x01\n"));
    }

    #[test]
    fn test_frame_message_escapes_from_lines() {
        let when = Utc.with_ymd_and_hms(2024, 1, 4, 10, 0, 0).unwrap();
        let raw = b"From old@example.com Thu Jan  4 09:00:00 2024\nSubject: x\n\nFrom here on\nbye";
        let framed = frame_message(raw, Dialect::Mbox, "carol@example.com", when);
        let text = String::from_utf8(framed).unwrap();

        assert!(text.starts_with("From carol@example.com "));
        assert!(!text.contains("old@example.com"));
        assert!(text.contains("\n>From here on\n"));
        assert!(text.ends_with("bye\n\n"));
        assert!(parse_from_line(text.lines().next().unwrap().as_bytes()).is_some());
    }

    #[test]
    fn test_frame_message_mmdf() {
        let when = Utc.with_ymd_and_hms(2024, 1, 4, 10, 0, 0).unwrap();
        let framed = frame_message(b"Subject: x\n\nFrom here\n", Dialect::Mmdf, "c@x.org", when);
        let text = String::from_utf8(framed).unwrap();
        assert!(text.starts_with("\x01\x01\x01\x01\nFrom c@x.org "));
        assert!(text.contains("\nFrom here\n"));
        assert!(text.ends_with("From here\n\x01\x01\x01\x01\n"));
    }
}
