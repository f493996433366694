//! External modification detection.

use tracing::{debug, info, warn};

use crate::error::{MboxError, Result};
use crate::parser::mbox::LineReader;
use crate::store::mailbox::Mailbox;
use crate::store::reconcile::{reconcile, ReconcileReport};

/// What [`Mailbox::check`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Unchanged,
    /// Messages were appended, or a re-parse found every known message
    /// plus new ones.
    NewMail,
    /// The file was re-read and known messages were lost or may have
    /// changed on disk.
    Reopened,
    /// The lock is held elsewhere. Try again later.
    Locked,
}

impl Mailbox {
    /// Compare the file against the last snapshot and catch up with it.
    ///
    /// Clean appends are parsed incrementally. Anything else forces a full
    /// re-parse reconciled against the current catalog. If that re-parse
    /// fails the handle is closed and the error is returned.
    pub fn check(&mut self) -> Result<CheckStatus> {
        self.ensure_readable()?;
        let meta = std::fs::metadata(&self.path).map_err(|e| MboxError::io(&self.path, e))?;
        let size = meta.len();
        let mtime = meta.modified().ok();

        if size == self.snapshot.size {
            if mtime != self.snapshot.mtime {
                debug!(path = %self.path.display(), "Mailbox touched without size change");
                self.snapshot.mtime = mtime;
            }
            return Ok(CheckStatus::Unchanged);
        }

        let took_lock = !self.locked;
        if took_lock && !self.lock(false, false)? {
            debug!(path = %self.path.display(), "Mailbox is locked, will check later");
            return Ok(CheckStatus::Locked);
        }

        let result = self.check_locked(size);
        if took_lock {
            self.unlock();
        }
        result
    }

    fn check_locked(&mut self, size: u64) -> Result<CheckStatus> {
        if size > self.snapshot.size && self.append_point_is_separator()? {
            let added = self.parse_from(self.snapshot.size)?;
            info!(path = %self.path.display(), added, "New mail");
            return Ok(CheckStatus::NewMail);
        }

        info!(path = %self.path.display(), "Mailbox modified externally, re-reading");
        self.reparse_or_discard()
    }

    /// Force a full re-parse reconciled against the current catalog, as
    /// [`check`](Self::check) does after an unexplained modification.
    pub fn reload(&mut self) -> Result<CheckStatus> {
        self.ensure_readable()?;
        let took_lock = !self.locked;
        if took_lock && !self.lock(false, true)? {
            return Ok(CheckStatus::Locked);
        }
        let result = self.reparse_or_discard();
        if took_lock {
            self.unlock();
        }
        result
    }

    /// A re-parse never reports `Unchanged`: on-disk state of matched
    /// messages may differ from what the caller last saw.
    fn reparse_or_discard(&mut self) -> Result<CheckStatus> {
        match self.reparse() {
            Ok(report) if report.unmatched_old == 0 && self.records.len() > report.matched => {
                Ok(CheckStatus::NewMail)
            }
            Ok(_) => Ok(CheckStatus::Reopened),
            Err(MboxError::Aborted { parsed }) => Err(MboxError::Aborted { parsed }),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Mailbox was corrupted");
                self.discard();
                Err(match e {
                    corrupt @ MboxError::Corrupt { .. } => corrupt,
                    other => MboxError::corrupt(&self.path, 0, other.to_string()),
                })
            }
        }
    }

    /// Whether the first line past the old end of file opens a message.
    fn append_point_is_separator(&self) -> Result<bool> {
        let file = self.ensure_open()?;
        let io = |e| MboxError::io(&self.path, e);
        let mut reader = LineReader::new(file, 4096, self.snapshot.size).map_err(io)?;
        let mut line = Vec::with_capacity(128);
        reader.read_line(&mut line).map_err(io)?;
        let clean = self.dialect.looks_like_separator(&line);
        if !clean {
            debug!(offset = self.snapshot.size, "No separator at the old end of file");
        }
        Ok(clean)
    }

    /// Reopen, parse from scratch and carry local state over.
    ///
    /// On any failure the previous catalog and snapshot are put back, so
    /// local intents survive and the next check re-parses again.
    fn reparse(&mut self) -> Result<ReconcileReport> {
        let old = std::mem::take(&mut self.records);
        let snapshot = self.snapshot;
        if let Err(e) = self.reopen().and_then(|()| self.parse_from(0)) {
            self.records = old;
            self.snapshot = snapshot;
            return Err(e);
        }

        let report = reconcile(&mut self.records, old);
        self.dirty = self.records.iter().any(|r| r.is_dirty());
        debug!(
            matched = report.matched,
            unmatched = report.unmatched_old,
            "Reconciled catalog"
        );
        Ok(report)
    }
}
