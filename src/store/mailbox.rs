//! The mailbox handle: one open flat file and the catalog of its messages.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{MboxError, Result};
use crate::model::message::{Flag, MessageRecord};
use crate::parser::header::{parse_header_bytes, EnvelopeParser, HeaderParser};
use crate::parser::mbox::{LineReader, MboxParser, DEFAULT_READ_BUFFER_SIZE};
use crate::parser::separator::Dialect;
use crate::progress::{CancelToken, ProgressEvent, ProgressSink};
use crate::store::copy;
use crate::store::lock::{FlockLocker, Locker};

/// How a mailbox is opened.
#[derive(Debug, Clone)]
pub struct MailboxOptions {
    /// Force a dialect instead of detecting it from the first line.
    pub dialect: Option<Dialect>,
    /// Dialect for empty or new files when none is forced.
    pub default_dialect: Dialect,
    pub readonly: bool,
    /// Suppress progress notifications.
    pub quiet: bool,
    pub lock_retries: u32,
    pub lock_retry_delay: Duration,
    /// Spool and rescue directory for sync.
    pub tmp_dir: Option<PathBuf>,
    /// Restore file times after sync.
    pub preserve_times: bool,
    pub read_buffer_size: usize,
}

impl Default for MailboxOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl MailboxOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dialect: None,
            default_dialect: config.general.default_dialect,
            readonly: false,
            quiet: false,
            lock_retries: config.locking.retries,
            lock_retry_delay: Duration::from_millis(config.locking.retry_delay_ms),
            tmp_dir: config.sync.tmp_dir.clone(),
            preserve_times: config.sync.preserve_times,
            read_buffer_size: config.performance.read_buffer_size,
        }
    }
}

/// `size`/`mtime`/`atime` of the file at the last successful parse or sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub size: u64,
    pub mtime: Option<SystemTime>,
    pub atime: Option<SystemTime>,
}

impl Snapshot {
    fn of(meta: &std::fs::Metadata) -> Self {
        Self {
            size: meta.len(),
            mtime: meta.modified().ok(),
            atime: meta.accessed().ok(),
        }
    }
}

/// Test-only fault injection for the compactor.
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FaultPlan {
    /// Fail the spool after this many messages were written.
    pub spool_after: Option<usize>,
    /// Fail the splice after verifying the separator.
    pub splice: bool,
}

/// Builder for handles that need a custom collaborator or progress sink.
pub struct MailboxBuilder {
    path: PathBuf,
    options: MailboxOptions,
    envelope: Option<Box<dyn EnvelopeParser + Send>>,
    locker: Option<Box<dyn Locker + Send>>,
    progress: Option<ProgressSink>,
}

impl MailboxBuilder {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            options: MailboxOptions::default(),
            envelope: None,
            locker: None,
            progress: None,
        }
    }

    pub fn options(mut self, options: MailboxOptions) -> Self {
        self.options = options;
        self
    }

    pub fn envelope_parser(mut self, parser: Box<dyn EnvelopeParser + Send>) -> Self {
        self.envelope = Some(parser);
        self
    }

    pub fn locker(mut self, locker: Box<dyn Locker + Send>) -> Self {
        self.locker = Some(locker);
        self
    }

    pub fn progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Open, lock shared, parse, unlock.
    ///
    /// Falls back to read-only when the file is not writable or the shared
    /// lock cannot be taken.
    pub fn open(self) -> Result<Mailbox> {
        let dialect = match self.options.dialect {
            Some(dialect) => dialect,
            None => Dialect::detect(&self.path, self.options.default_dialect)?,
        };
        let (file, readonly) = open_file(&self.path, self.options.readonly)?;
        let mut mailbox = self.into_mailbox(file, dialect, readonly, false);

        if !mailbox.lock(false, true)? {
            warn!(path = %mailbox.path.display(), "Mailbox is locked, opening read-only");
            mailbox.readonly = true;
        }
        let parsed = mailbox.parse_from(0);
        mailbox.unlock();
        parsed?;

        info!(
            path = %mailbox.path.display(),
            dialect = %mailbox.dialect,
            messages = mailbox.records.len(),
            readonly = mailbox.readonly,
            "Opened mailbox"
        );
        Ok(mailbox)
    }

    /// Open (creating if needed) for delivery only. The exclusive lock is
    /// held until the handle is closed.
    pub fn open_append(self) -> Result<Mailbox> {
        let existing = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        let dialect = match self.options.dialect {
            Some(dialect) => dialect,
            None if existing > 0 => Dialect::detect(&self.path, self.options.default_dialect)?,
            None => self.options.default_dialect,
        };
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| MboxError::io(&self.path, e))?;
        let mut mailbox = self.into_mailbox(file, dialect, false, true);

        if !mailbox.lock(true, true)? {
            return Err(MboxError::Locked {
                path: mailbox.path.clone(),
            });
        }
        mailbox.restat()?;
        debug!(path = %mailbox.path.display(), dialect = %dialect, "Opened mailbox for appending");
        Ok(mailbox)
    }

    fn into_mailbox(self, file: File, dialect: Dialect, readonly: bool, append_only: bool) -> Mailbox {
        let options = self.options;
        Mailbox {
            locker: self.locker.unwrap_or_else(|| {
                Box::new(FlockLocker::new(options.lock_retries, options.lock_retry_delay))
            }),
            envelope: self.envelope.unwrap_or_else(|| Box::new(HeaderParser)),
            progress: self.progress,
            path: self.path,
            file: Some(file),
            dialect,
            snapshot: Snapshot {
                size: 0,
                mtime: None,
                atime: None,
            },
            locked: false,
            lock_exclusive: false,
            readonly,
            append_only,
            quiet: options.quiet,
            dirty: false,
            records: Vec::new(),
            cancel: CancelToken::new(),
            options,
            #[cfg(test)]
            faults: FaultPlan::default(),
        }
    }
}

/// One open mbox or MMDF file.
///
/// The handle owns its catalog. Records stay in ascending offset order and
/// every record's `offset` points at a separator of the handle's dialect.
/// After a fatal error the file is dropped: the catalog stays readable but
/// file operations fail with [`MboxError::Closed`].
pub struct Mailbox {
    pub(super) path: PathBuf,
    pub(super) file: Option<File>,
    pub(super) dialect: Dialect,
    pub(super) snapshot: Snapshot,
    pub(super) locked: bool,
    pub(super) lock_exclusive: bool,
    pub(super) readonly: bool,
    pub(super) append_only: bool,
    pub(super) quiet: bool,
    /// Some record may need rewriting.
    pub(super) dirty: bool,
    pub(super) records: Vec<MessageRecord>,
    pub(super) options: MailboxOptions,
    pub(super) locker: Box<dyn Locker + Send>,
    pub(super) envelope: Box<dyn EnvelopeParser + Send>,
    pub(super) cancel: CancelToken,
    pub(super) progress: Option<ProgressSink>,
    #[cfg(test)]
    pub(crate) faults: FaultPlan,
}

impl Mailbox {
    /// Open an existing mailbox and parse it.
    pub fn open(path: impl AsRef<Path>, options: MailboxOptions) -> Result<Self> {
        MailboxBuilder::new(path).options(options).open()
    }

    /// Open a mailbox for appending new messages.
    pub fn open_append(path: impl AsRef<Path>, options: MailboxOptions) -> Result<Self> {
        MailboxBuilder::new(path).options(options).open_append()
    }

    /// Release the lock and close the file.
    pub fn close(mut self) -> Result<()> {
        if self.locked {
            if let Some(file) = &self.file {
                self.locker.unlock(file, &self.path)?;
            }
            self.locked = false;
        }
        self.file = None;
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn records(&self) -> &[MessageRecord] {
        &self.records
    }

    pub fn get(&self, index: usize) -> Option<&MessageRecord> {
        self.records.get(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_append_only(&self) -> bool {
        self.append_only
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the handle still has its file.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn set_quiet(&mut self, quiet: bool) {
        self.quiet = quiet;
    }

    pub fn set_progress(&mut self, sink: Option<ProgressSink>) {
        self.progress = sink;
    }

    /// Token that interrupts a running parse. Clones share the flag.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Any message that is neither read, old nor deleted.
    pub fn has_new(&self) -> bool {
        self.records.iter().any(MessageRecord::is_new)
    }

    // ── Flags ───────────────────────────────────────────────────

    /// Set or clear a flag. Returns whether anything changed.
    ///
    /// Flags with an on-disk form mark the record `changed`; deletion and
    /// attachment deletion make it dirty directly; `tagged` and `purge` are
    /// local only.
    pub fn set_flag(&mut self, index: usize, flag: Flag, value: bool) -> Result<bool> {
        let record = self
            .records
            .get_mut(index)
            .ok_or(MboxError::NoSuchMessage(index))?;
        let slot = record.flags.slot(flag);
        if *slot == value {
            return Ok(false);
        }
        *slot = value;

        match flag {
            Flag::Read | Flag::Old | Flag::Flagged | Flag::Replied => {
                record.flags.changed = true;
                self.dirty = true;
            }
            Flag::Deleted | Flag::AttachDeleted => {
                if value {
                    self.dirty = true;
                } else {
                    self.dirty = self.records.iter().any(MessageRecord::is_dirty);
                }
            }
            Flag::Tagged | Flag::Purge => {}
        }
        Ok(true)
    }

    // ── Parsing ─────────────────────────────────────────────────

    /// Parse the file into the catalog.
    ///
    /// With `resume` the parse starts at the end of the last snapshot and
    /// appends; otherwise the catalog must be empty and the whole file is
    /// read. Takes a shared lock for the duration unless one is held.
    /// Returns the number of records added.
    pub fn parse(&mut self, resume: bool) -> Result<usize> {
        self.ensure_readable()?;
        if !resume && !self.records.is_empty() {
            return Err(MboxError::InvalidMode(
                "a full parse needs an empty catalog".to_string(),
            ));
        }
        let start = if resume { self.snapshot.size } else { 0 };

        let took_lock = !self.locked;
        if took_lock && !self.lock(false, true)? {
            return Err(MboxError::Locked {
                path: self.path.clone(),
            });
        }
        let result = self.parse_from(start);
        if took_lock {
            self.unlock();
        }
        result
    }

    /// Parse from `start` with the lock already held.
    pub(super) fn parse_from(&mut self, start: u64) -> Result<usize> {
        let meta = std::fs::metadata(&self.path).map_err(|e| MboxError::io(&self.path, e))?;
        let snapshot = Snapshot::of(&meta);
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| MboxError::Closed(self.path.clone()))?;

        let progress = if self.quiet {
            None
        } else {
            self.progress
                .as_deref()
                .map(|sink| sink as &dyn Fn(ProgressEvent))
        };
        let outcome = MboxParser::new(&self.path, self.dialect, snapshot.size, self.envelope.as_ref())
            .with_buffer_size(self.options.read_buffer_size)
            .with_cancel(&self.cancel)
            .with_progress(progress)
            .parse(file, start, &mut self.records)?;

        self.snapshot = snapshot;
        if outcome.aborted {
            // A later check sees the file as grown and resumes from here.
            self.snapshot.size = outcome.end;
            warn!(
                path = %self.path.display(),
                parsed = outcome.added,
                offset = outcome.end,
                "Parse interrupted"
            );
            return Err(MboxError::Aborted {
                parsed: outcome.added,
            });
        }
        debug!(added = outcome.added, start, "Parsed mailbox");
        Ok(outcome.added)
    }

    // ── Raw access and delivery ─────────────────────────────────

    /// Raw bytes of a message, separator excluded.
    pub fn read_message(&self, index: usize) -> Result<Vec<u8>> {
        let record = self
            .records
            .get(index)
            .ok_or(MboxError::NoSuchMessage(index))?;
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| MboxError::Closed(self.path.clone()))?;

        let io = |e| MboxError::io(&self.path, e);
        let mut reader = LineReader::new(file, DEFAULT_READ_BUFFER_SIZE, record.offset).map_err(io)?;
        copy::read_separator(&mut reader, self.dialect).map_err(io)?;

        let end = record.body_offset + record.body_length();
        let len = end.saturating_sub(reader.position());
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf).map_err(io)?;
        Ok(buf)
    }

    /// Deliver one message. Returns the offset of its separator.
    ///
    /// Without `sender` the envelope sender comes from the message's
    /// Return-Path or From, then the login name.
    pub fn append_message(
        &mut self,
        raw: &[u8],
        sender: Option<&str>,
        received: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        if !self.append_only {
            return Err(MboxError::InvalidMode(
                "mailbox is not open for appending".to_string(),
            ));
        }
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| MboxError::Closed(self.path.clone()))?;

        let sender = sender.map(str::to_string).unwrap_or_else(|| envelope_sender(raw));
        let framed = copy::frame_message(raw, self.dialect, &sender, received.unwrap_or_else(Utc::now));

        let io = |e| MboxError::io(&self.path, e);
        let offset = file.metadata().map_err(io)?.len();
        let mut writer: &File = file;
        writer.write_all(&framed).map_err(io)?;
        writer.flush().map_err(io)?;
        file.sync_all().map_err(io)?;

        self.restat()?;
        info!(path = %self.path.display(), offset, sender = %sender, "Appended message");
        Ok(offset)
    }

    // ── Internals shared with check / sync ──────────────────────

    pub(super) fn ensure_open(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| MboxError::Closed(self.path.clone()))
    }

    /// Open and not an append-only handle.
    pub(super) fn ensure_readable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.append_only {
            return Err(MboxError::InvalidMode(
                "operation not available on an append-only mailbox".to_string(),
            ));
        }
        Ok(())
    }

    pub(super) fn lock(&mut self, exclusive: bool, blocking: bool) -> Result<bool> {
        if self.locked {
            if self.lock_exclusive || !exclusive {
                return Ok(true);
            }
            // flock conversion is not atomic; release before upgrading.
            self.unlock();
        }
        let file = self.ensure_open()?;
        let acquired = self.locker.lock(file, &self.path, exclusive, blocking)?;
        if acquired {
            self.locked = true;
            self.lock_exclusive = exclusive;
        }
        Ok(acquired)
    }

    /// Release the lock, logging rather than failing.
    pub(super) fn unlock(&mut self) {
        if !self.locked {
            return;
        }
        if let Some(file) = &self.file {
            if let Err(e) = self.locker.unlock(file, &self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to release mailbox lock");
            }
        }
        self.locked = false;
        self.lock_exclusive = false;
    }

    /// Drop the file after a fatal error.
    pub(super) fn discard(&mut self) {
        self.unlock();
        self.file = None;
        warn!(path = %self.path.display(), "Mailbox handle closed");
    }

    /// Reopen the file by path, carrying the lock over.
    pub(super) fn reopen(&mut self) -> Result<()> {
        let relock = self.locked.then_some(self.lock_exclusive);
        self.unlock();
        let (file, readonly) = open_file(&self.path, self.readonly)?;
        self.file = Some(file);
        self.readonly = readonly;
        if let Some(exclusive) = relock {
            if !self.lock(exclusive, true)? {
                return Err(MboxError::Locked {
                    path: self.path.clone(),
                });
            }
        }
        Ok(())
    }

    pub(super) fn restat(&mut self) -> Result<()> {
        let meta = std::fs::metadata(&self.path).map_err(|e| MboxError::io(&self.path, e))?;
        self.snapshot = Snapshot::of(&meta);
        Ok(())
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Open read-write, or read-only when asked or when writing is refused.
fn open_file(path: &Path, readonly: bool) -> Result<(File, bool)> {
    let not_found = |e: std::io::Error| {
        if e.kind() == std::io::ErrorKind::NotFound {
            MboxError::FileNotFound(path.to_path_buf())
        } else {
            MboxError::io(path, e)
        }
    };

    if !readonly {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => return Ok((file, false)),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                warn!(path = %path.display(), "Mailbox is not writable, opening read-only");
            }
            Err(e) => return Err(not_found(e)),
        }
    }
    let file = File::open(path).map_err(not_found)?;
    Ok((file, true))
}

/// Envelope sender for a delivered message.
fn envelope_sender(raw: &[u8]) -> String {
    let header_end = raw
        .windows(2)
        .position(|w| w == b"\n\n")
        .map_or(raw.len(), |pos| pos + 1);
    let header = parse_header_bytes(&raw[..header_end]);
    header
        .envelope
        .return_path
        .first()
        .or_else(|| header.envelope.from.first())
        .map(|addr| addr.address.clone())
        .or_else(|| std::env::var("USER").ok())
        .or_else(|| std::env::var("LOGNAME").ok())
        .unwrap_or_else(|| "MAILER-DAEMON".to_string())
}

/// Whether the mailbox at `path` holds no data.
pub fn check_empty(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len() == 0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(MboxError::FileNotFound(path.to_path_buf()))
        }
        Err(e) => Err(MboxError::io(path, e)),
    }
}
