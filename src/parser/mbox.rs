//! Streaming mailbox parser for both flat-file dialects.
//!
//! Reads line by line through a buffered [`LineReader`] that tracks the
//! absolute file position, so every record gets byte-accurate offsets.
//! Never loads the whole file into memory. A `Content-Length` hint is only
//! trusted after the bytes it points at turn out to be a separator.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{MboxError, Result};
use crate::model::address::EmailAddress;
use crate::model::message::{ContentLength, MessageRecord};
use crate::parser::header::{EnvelopeParser, ParsedHeader};
use crate::parser::separator::{parse_from_line, Dialect, FromLine, FROM_PREFIX, MMDF_SEP};
use crate::progress::{CancelToken, ProgressEvent};

/// Size of the internal read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 128 * 1024;

/// Progress is reported every 4 MB.
const PROGRESS_INTERVAL: u64 = 4 * 1024 * 1024;

/// Buffered reader that knows its absolute position in the file.
pub struct LineReader<R> {
    inner: BufReader<R>,
    pos: u64,
}

impl<R: Read + Seek> LineReader<R> {
    /// Wrap `inner`, positioned at `start`.
    pub fn new(mut inner: R, capacity: usize, start: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(start))?;
        Ok(Self {
            inner: BufReader::with_capacity(capacity, inner),
            pos: start,
        })
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Move to an absolute position, keeping the buffer when possible.
    pub fn seek_to(&mut self, pos: u64) -> io::Result<()> {
        if pos != self.pos {
            self.inner.seek_relative(pos as i64 - self.pos as i64)?;
            self.pos = pos;
        }
        Ok(())
    }

    /// Read one line, `\n` included, into `buf`. Returns 0 at EOF.
    pub fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        buf.clear();
        loop {
            let available = self.inner.fill_buf()?;
            if available.is_empty() {
                break;
            }
            let (take, done) = match memchr_newline(available) {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            };
            buf.extend_from_slice(&available[..take]);
            self.inner.consume(take);
            self.pos += take as u64;
            if done {
                break;
            }
        }
        Ok(buf.len())
    }

    /// Count `\n` bytes in the next `len` bytes, stopping early at EOF.
    fn count_newlines(&mut self, len: u64) -> io::Result<u64> {
        let mut remaining = len;
        let mut count = 0;
        while remaining > 0 {
            let available = self.inner.fill_buf()?;
            if available.is_empty() {
                break;
            }
            let take = available.len().min(remaining as usize);
            count += available[..take].iter().filter(|&&b| b == b'\n').count() as u64;
            self.inner.consume(take);
            self.pos += take as u64;
            remaining -= take as u64;
        }
        Ok(count)
    }
}

impl<R: Read> Read for LineReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(out)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read> BufRead for LineReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt);
        self.pos += amt as u64;
    }
}

/// Result of one parse pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOutcome {
    /// Records appended to the catalog.
    pub added: usize,
    /// Offset just past the last complete record. When the pass was
    /// cancelled this is where a later pass should resume.
    pub end: u64,
    pub aborted: bool,
}

/// Builds catalog records from a mailbox file.
///
/// The caller owns the file (and its lock); the parser only reads from the
/// given start offset and appends to the catalog it is handed. Existing
/// records are never touched.
pub struct MboxParser<'a> {
    path: &'a Path,
    dialect: Dialect,
    file_size: u64,
    buffer_size: usize,
    envelope: &'a dyn EnvelopeParser,
    cancel: Option<&'a CancelToken>,
    progress: Option<&'a dyn Fn(ProgressEvent)>,
}

impl<'a> MboxParser<'a> {
    /// `file_size` is the size observed when the parse began.
    pub fn new(
        path: &'a Path,
        dialect: Dialect,
        file_size: u64,
        envelope: &'a dyn EnvelopeParser,
    ) -> Self {
        Self {
            path,
            dialect,
            file_size,
            buffer_size: DEFAULT_READ_BUFFER_SIZE,
            envelope,
            cancel: None,
            progress: None,
        }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(4096);
        self
    }

    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_progress(mut self, progress: Option<&'a dyn Fn(ProgressEvent)>) -> Self {
        self.progress = progress;
        self
    }

    /// Parse from `start` to EOF, appending records to `records`.
    ///
    /// A pending cancellation is consumed and reported through
    /// [`ParseOutcome::aborted`]; records completed before it are kept.
    pub fn parse(
        &self,
        file: &File,
        start: u64,
        records: &mut Vec<MessageRecord>,
    ) -> Result<ParseOutcome> {
        let mut reader = LineReader::new(file, self.buffer_size, start)
            .map_err(|e| MboxError::io(self.path, e))?;
        let base = records.len();

        let outcome = match self.dialect {
            Dialect::Mbox => self.parse_mbox(&mut reader, records, base)?,
            Dialect::Mmdf => self.parse_mmdf(&mut reader, records, base)?,
        };

        if let Some(cb) = self.progress {
            cb(ProgressEvent::Reading {
                done: outcome.end,
                total: self.file_size,
            });
        }
        Ok(outcome)
    }

    fn parse_mbox(
        &self,
        reader: &mut LineReader<&File>,
        records: &mut Vec<MessageRecord>,
        base: usize,
    ) -> Result<ParseOutcome> {
        let mut line: Vec<u8> = Vec::with_capacity(4096);
        // Index of the record whose end is not known yet.
        let mut current: Option<usize> = None;
        let mut lines: u64 = 0;
        let mut prev_line_was_empty = true;
        let mut last_progress = reader.position();

        loop {
            let loc = reader.position();
            if self.take_cancel() {
                // The open record has no end yet; drop it and resume at its separator.
                let end = match current {
                    Some(idx) => {
                        let offset = records[idx].offset;
                        records.truncate(idx);
                        offset
                    }
                    None => loc,
                };
                return Ok(ParseOutcome {
                    added: records.len() - base,
                    end,
                    aborted: true,
                });
            }

            if reader.read_line(&mut line).map_err(|e| self.io(e))? == 0 {
                break;
            }

            if let Some(from) = parse_from_line(&line) {
                if !prev_line_was_empty && loc > 0 {
                    warn!(
                        offset = loc,
                        "Found 'From ' separator without preceding blank line"
                    );
                }
                if let Some(idx) = current {
                    finish_mbox_record(&mut records[idx], loc, lines);
                }

                let record = self.read_mbox_message(reader, loc, from, &mut line)?;
                current = Some(records.len());
                records.push(record);
                lines = 0;
                prev_line_was_empty = true;
            } else {
                lines += 1;
                prev_line_was_empty = is_blank_line(&line);
            }

            self.report(reader.position(), &mut last_progress);
        }

        let end = reader.position();
        if let Some(idx) = current {
            finish_mbox_record(&mut records[idx], end, lines);
        }

        Ok(ParseOutcome {
            added: records.len() - base,
            end,
            aborted: false,
        })
    }

    /// Header and body bounds of the mbox message whose `From ` line
    /// started at `loc`. Leaves the reader at the body start, or at the
    /// next separator when the length hint checked out.
    fn read_mbox_message(
        &self,
        reader: &mut LineReader<&File>,
        loc: u64,
        from: FromLine,
        scratch: &mut Vec<u8>,
    ) -> Result<MessageRecord> {
        let mut record = MessageRecord::new(loc);
        record.received = Some(from.received);

        let header = self.read_header(reader)?;
        apply_header(&mut record, header);
        record.body_offset = reader.position();

        if let ContentLength::Known(len) = record.content_length {
            let next = record.body_offset + len + 1;
            let valid = if next < self.file_size {
                reader.seek_to(next).map_err(|e| self.io(e))?;
                reader.read_line(scratch).map_err(|e| self.io(e))? > 0
                    && scratch.starts_with(FROM_PREFIX)
            } else {
                next == self.file_size
            };

            if valid {
                if record.line_count == 0 {
                    reader.seek_to(record.body_offset).map_err(|e| self.io(e))?;
                    record.line_count = reader.count_newlines(len).map_err(|e| self.io(e))?;
                }
                reader.seek_to(next).map_err(|e| self.io(e))?;
            } else {
                debug!(
                    offset = loc,
                    content_length = len,
                    "Content-Length does not end at a separator, scanning body"
                );
                record.content_length = ContentLength::Unknown;
                reader.seek_to(record.body_offset).map_err(|e| self.io(e))?;
            }
        }

        fill_return_path(&mut record, from.return_path);
        Ok(record)
    }

    fn parse_mmdf(
        &self,
        reader: &mut LineReader<&File>,
        records: &mut Vec<MessageRecord>,
        base: usize,
    ) -> Result<ParseOutcome> {
        let mut line: Vec<u8> = Vec::with_capacity(4096);
        let mut last_progress = reader.position();

        loop {
            let loc = reader.position();
            if self.take_cancel() {
                return Ok(ParseOutcome {
                    added: records.len() - base,
                    end: loc,
                    aborted: true,
                });
            }

            if reader.read_line(&mut line).map_err(|e| self.io(e))? == 0 {
                break;
            }
            if line != MMDF_SEP {
                warn!(offset = loc, path = %self.path.display(), "Mailbox is corrupt");
                return Err(MboxError::corrupt(
                    self.path,
                    loc,
                    "expected MMDF message separator",
                ));
            }

            let after_sep = reader.position();
            if reader.read_line(&mut line).map_err(|e| self.io(e))? == 0 {
                debug!(offset = loc, "Unexpected EOF after MMDF separator");
                break;
            }

            let mut record = MessageRecord::new(loc);
            let from = parse_from_line(&line);
            match &from {
                Some(envelope_line) => record.received = Some(envelope_line.received),
                None => reader.seek_to(after_sep).map_err(|e| self.io(e))?,
            }

            let header = self.read_header(reader)?;
            apply_header(&mut record, header);
            record.body_offset = reader.position();

            if !self.mmdf_hint_is_valid(reader, &record, &mut line)? {
                reader.seek_to(record.body_offset).map_err(|e| self.io(e))?;
                let mut count = 0;
                let mut closed = false;
                let end = loop {
                    let pos = reader.position();
                    if reader.read_line(&mut line).map_err(|e| self.io(e))? == 0 {
                        break pos;
                    }
                    if line == MMDF_SEP {
                        closed = true;
                        break pos;
                    }
                    count += 1;
                };
                if !closed {
                    warn!(offset = loc, "MMDF message has no closing separator");
                }
                record.line_count = count;
                record.content_length = ContentLength::Known(end - record.body_offset);
            }

            fill_return_path(&mut record, from.and_then(|f| f.return_path));
            records.push(record);

            self.report(reader.position(), &mut last_progress);
        }

        Ok(ParseOutcome {
            added: records.len() - base,
            end: reader.position(),
            aborted: false,
        })
    }

    /// MMDF hints are only used when both `Content-Length` and `Lines` are
    /// present and the closing separator sits right where they say.
    fn mmdf_hint_is_valid(
        &self,
        reader: &mut LineReader<&File>,
        record: &MessageRecord,
        scratch: &mut Vec<u8>,
    ) -> Result<bool> {
        let len = match record.content_length {
            ContentLength::Known(len) if len > 0 && record.line_count > 0 => len,
            _ => return Ok(false),
        };
        let close = record.body_offset + len;
        if close >= self.file_size {
            return Ok(false);
        }
        reader.seek_to(close).map_err(|e| self.io(e))?;
        reader.read_line(scratch).map_err(|e| self.io(e))?;
        if scratch.as_slice() == MMDF_SEP {
            Ok(true)
        } else {
            debug!(
                offset = record.offset,
                content_length = len,
                "Content-Length does not end at a separator, scanning body"
            );
            Ok(false)
        }
    }

    /// Run the envelope parser and reposition just past the header block.
    fn read_header(&self, reader: &mut LineReader<&File>) -> Result<ParsedHeader> {
        let start = reader.position();
        let header = self
            .envelope
            .parse_header(reader)
            .map_err(|e| self.io(e))?;
        reader
            .seek_to(start + header.consumed)
            .map_err(|e| self.io(e))?;
        Ok(header)
    }

    fn take_cancel(&self) -> bool {
        self.cancel.is_some_and(|token| token.reset())
    }

    fn report(&self, pos: u64, last: &mut u64) {
        if let Some(cb) = self.progress {
            if pos.saturating_sub(*last) >= PROGRESS_INTERVAL {
                cb(ProgressEvent::Reading {
                    done: pos,
                    total: self.file_size,
                });
                *last = pos;
            }
        }
    }

    fn io(&self, e: io::Error) -> MboxError {
        MboxError::io(self.path, e)
    }
}

/// Copy what the header says onto the record.
fn apply_header(record: &mut MessageRecord, header: ParsedHeader) {
    record.envelope = header.envelope;
    record.body = header.body;
    record.mime = header.mime;
    record.content_length = header.content_length;
    record.line_count = header.lines;
    record.flags.read = header.flags.read;
    record.flags.old = header.flags.old;
    record.flags.replied = header.flags.replied;
    record.flags.flagged = header.flags.flagged;
}

/// Close an mbox record once the next separator (or EOF) at `next` is known.
///
/// The byte before the next separator is the blank line that ends the
/// message and is not part of the body.
fn finish_mbox_record(record: &mut MessageRecord, next: u64, lines: u64) {
    if !record.content_length.is_known() {
        let len = next.saturating_sub(record.body_offset).saturating_sub(1);
        record.content_length = ContentLength::Known(len);
    }
    if record.line_count == 0 {
        record.line_count = lines.saturating_sub(1);
    }
}

/// Fall back on the envelope line for Return-Path, and on Return-Path for From.
fn fill_return_path(record: &mut MessageRecord, envelope_sender: Option<String>) {
    if record.envelope.return_path.is_empty() {
        if let Some(sender) = envelope_sender {
            record.envelope.return_path = EmailAddress::parse_list(&sender);
        }
    }
    if record.envelope.from.is_empty() {
        record.envelope.from = record.envelope.return_path.clone();
    }
}

/// Fast newline search (equivalent to memchr for `\n`).
#[inline]
fn memchr_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

/// Check whether a line is blank (empty or only whitespace / CR / LF).
fn is_blank_line(line: &[u8]) -> bool {
    line.iter()
        .all(|&b| b == b'\n' || b == b'\r' || b == b' ' || b == b'\t')
}
