//! Compaction: writing pending deletions and flag changes back to the file.
//!
//! Everything from the first dirty message onward is re-serialized into a
//! spool file next to the mailbox. Only after the spool is complete and on
//! disk is the live file touched: the spool is copied over the tail
//! starting at the first dirty message, and the file is truncated. Bytes
//! before that offset are never written.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::error::{MboxError, Result};
use crate::model::message::{ContentLength, MessageRecord};
use crate::parser::mbox::LineReader;
use crate::progress::ProgressEvent;
use crate::store::check::CheckStatus;
use crate::store::copy::{self, Relocation};
use crate::store::mailbox::{Mailbox, Snapshot};

/// Result of a successful [`Mailbox::sync`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing to write.
    Clean,
    /// The file changed since it was parsed; nothing was written. The
    /// catalog has been brought up to date and the caller may sync again.
    ExternalChange(CheckStatus),
    Synced {
        /// Deleted messages removed from the file and the catalog.
        removed: usize,
        /// Offset from which the file was rewritten.
        rewritten_from: u64,
    },
}

/// Pre-sync position of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCheckpoint {
    pub offset: u64,
    pub body_offset: u64,
    pub line_count: u64,
    pub content_length: ContentLength,
}

impl SyncCheckpoint {
    fn capture(record: &MessageRecord) -> Self {
        Self {
            offset: record.offset,
            body_offset: record.body_offset,
            line_count: record.line_count,
            content_length: record.content_length,
        }
    }

    fn restore(&self, record: &mut MessageRecord) {
        record.offset = self.offset;
        record.body_offset = self.body_offset;
        record.line_count = self.line_count;
        record.content_length = self.content_length;
    }
}

impl Mailbox {
    /// Write pending changes to disk.
    ///
    /// Holds an exclusive lock for the whole pass. A failure before the
    /// live file is touched leaves it byte-identical and the handle usable
    /// ([`MboxError::SyncFailed`]). A failure while splicing saves the
    /// rewritten tail to a rescue file and closes the handle
    /// ([`MboxError::SyncUnrecoverable`]).
    pub fn sync(&mut self) -> Result<SyncOutcome> {
        self.ensure_readable()?;
        if self.readonly {
            return Err(MboxError::ReadOnly(self.path.clone()));
        }
        if !self.dirty {
            return Ok(SyncOutcome::Clean);
        }

        if !self.lock(true, true)? {
            return Err(MboxError::Locked {
                path: self.path.clone(),
            });
        }
        let result = self.sync_locked();
        self.unlock();
        result
    }

    fn sync_locked(&mut self) -> Result<SyncOutcome> {
        match self.check()? {
            CheckStatus::Unchanged => {}
            status => {
                info!(path = %self.path.display(), ?status, "Mailbox changed on disk, not syncing");
                return Ok(SyncOutcome::ExternalChange(status));
            }
        }

        let first = self
            .records
            .iter()
            .position(MessageRecord::is_dirty)
            .ok_or_else(|| {
                MboxError::Inconsistent(
                    "mailbox marked modified but no message needs rewriting".to_string(),
                )
            })?;
        let first_offset = self.records[first].offset;
        let checkpoints: Vec<SyncCheckpoint> = self.records[first..]
            .iter()
            .map(SyncCheckpoint::capture)
            .collect();
        debug!(first, offset = first_offset, "Rewriting mailbox tail");

        let separator = self
            .separator_at(first_offset)
            .map_err(|e| self.sync_failed(first, &checkpoints, e))?;

        let (spool, relocations) = match self.write_spool(first) {
            Ok(spooled) => spooled,
            Err(e) => return Err(self.sync_failed(first, &checkpoints, e)),
        };

        let before = std::fs::metadata(&self.path)
            .map(|meta| Snapshot {
                size: meta.len(),
                mtime: meta.modified().ok(),
                atime: meta.accessed().ok(),
            })
            .map_err(|e| self.sync_failed(first, &checkpoints, e))?;

        if let Err((source, spool)) = self.splice(first_offset, &separator, spool) {
            return Err(self.unrecoverable(first, &checkpoints, spool, source));
        }

        // Committed: apply the new layout.
        for (record, reloc) in self.records[first..]
            .iter_mut()
            .filter(|r| !r.flags.deleted)
            .zip(&relocations)
        {
            record.offset = first_offset + reloc.offset;
            record.body_offset = first_offset + reloc.body_offset;
            record.content_length = ContentLength::Known(reloc.content_length);
        }
        let count = self.records.len();
        self.records.retain(|r| !r.flags.deleted);
        let removed = count - self.records.len();
        for record in &mut self.records {
            record.flags.changed = false;
            record.flags.attach_deleted = false;
        }
        self.dirty = false;

        if self.options.preserve_times {
            self.reset_times(&before);
        }
        self.restat()?;

        info!(
            path = %self.path.display(),
            removed,
            offset = first_offset,
            "Mailbox synced"
        );
        Ok(SyncOutcome::Synced {
            removed,
            rewritten_from: first_offset,
        })
    }

    /// The separator line(s) at `offset`, as bytes.
    fn separator_at(&self, offset: u64) -> io::Result<Vec<u8>> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "mailbox file closed"))?;
        let mut reader = LineReader::new(file, 4096, offset)?;
        copy::read_separator(&mut reader, self.dialect)
    }

    /// Serialize every surviving record from `first` onward into a spool
    /// file. Offsets in the returned relocations are relative to the spool.
    fn write_spool(&self, first: usize) -> io::Result<(NamedTempFile, Vec<Relocation>)> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "mailbox file closed"))?;
        let spool = NamedTempFile::new_in(self.spool_dir())?;
        let mut out = BufWriter::new(spool);

        let survivors: Vec<&MessageRecord> = self.records[first..]
            .iter()
            .filter(|r| !r.flags.deleted)
            .collect();
        let progress = self.progress.as_deref().filter(|_| !self.quiet);

        let mut relocations = Vec::with_capacity(survivors.len());
        let mut written = 0u64;
        for (done, record) in survivors.iter().enumerate() {
            #[cfg(test)]
            if self.faults.spool_after == Some(done) {
                return Err(io::Error::other("injected spool failure"));
            }
            let reloc = copy::copy_message(file, record, self.dialect, &mut out, written)?;
            written = reloc.end;
            relocations.push(reloc);
            if let Some(sink) = progress {
                sink(ProgressEvent::Writing {
                    done: done + 1,
                    total: survivors.len(),
                });
            }
        }

        let spool = out.into_inner().map_err(|e| e.into_error())?;
        spool.as_file().sync_all()?;
        Ok((spool, relocations))
    }

    /// Overwrite the live file from `offset` with the spool and truncate.
    ///
    /// Refuses to write if the separator at `offset` is no longer the one
    /// seen before spooling. On failure the spool is handed back.
    fn splice(
        &self,
        offset: u64,
        separator: &[u8],
        mut spool: NamedTempFile,
    ) -> std::result::Result<(), (io::Error, NamedTempFile)> {
        let result = (|| -> io::Result<()> {
            let current = self.separator_at(offset)?;
            if current != separator {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("message separator at offset {offset} changed during sync"),
                ));
            }
            #[cfg(test)]
            if self.faults.splice {
                return Err(io::Error::other("injected splice failure"));
            }

            let mut live: &File = self
                .file
                .as_ref()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "mailbox file closed"))?;
            spool.as_file_mut().seek(SeekFrom::Start(0))?;
            live.seek(SeekFrom::Start(offset))?;
            let copied = io::copy(spool.as_file_mut(), &mut live)?;
            live.flush()?;
            live.set_len(offset + copied)?;
            live.sync_all()?;
            Ok(())
        })();

        match result {
            Ok(()) => Ok(()),
            Err(e) => Err((e, spool)),
        }
    }

    /// Restore checkpoints and report a failure that left the file untouched.
    fn sync_failed(&mut self, first: usize, checkpoints: &[SyncCheckpoint], source: io::Error) -> MboxError {
        self.restore(first, checkpoints);
        warn!(path = %self.path.display(), error = %source, "Sync failed, mailbox unchanged");
        MboxError::SyncFailed {
            path: self.path.clone(),
            source,
        }
    }

    /// Save the spool as a rescue file, restore checkpoints and close the handle.
    fn unrecoverable(
        &mut self,
        first: usize,
        checkpoints: &[SyncCheckpoint],
        spool: NamedTempFile,
        source: io::Error,
    ) -> MboxError {
        let rescue = self.rescue_path();
        match save_rescue(spool, &rescue) {
            Ok(()) => error!(
                path = %self.path.display(),
                rescue = %rescue.display(),
                error = %source,
                "Write failed, saved partial mailbox"
            ),
            Err(e) => error!(
                path = %self.path.display(),
                rescue = %rescue.display(),
                error = %e,
                "Could not save partial mailbox"
            ),
        }
        self.restore(first, checkpoints);
        self.discard();
        MboxError::SyncUnrecoverable {
            path: self.path.clone(),
            rescue,
            source,
        }
    }

    fn restore(&mut self, first: usize, checkpoints: &[SyncCheckpoint]) {
        for (record, checkpoint) in self.records[first..].iter_mut().zip(checkpoints) {
            checkpoint.restore(record);
        }
    }

    fn spool_dir(&self) -> PathBuf {
        if let Some(dir) = &self.options.tmp_dir {
            return dir.clone();
        }
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// `<tmpdir>/mboxstore.<user>-<host>-<pid>`
    fn rescue_path(&self) -> PathBuf {
        let dir = self
            .options
            .tmp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let host = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        dir.join(format!("mboxstore.{user}-{host}-{}", std::process::id()))
    }

    /// Put back the pre-sync times, keeping the access time older than the
    /// modification time while unread mail remains so notifiers still see it.
    fn reset_times(&self, before: &Snapshot) {
        let (Some(mtime), Some(mut atime)) = (before.mtime, before.atime) else {
            return;
        };
        if atime >= mtime && self.has_new() {
            atime = mtime
                .checked_sub(std::time::Duration::from_secs(1))
                .unwrap_or(mtime);
        }
        if let Err(e) = nix::sys::stat::utimes(&self.path, &timeval(atime), &timeval(mtime)) {
            warn!(path = %self.path.display(), error = %e, "Could not restore file times");
        }
    }
}

fn timeval(time: SystemTime) -> nix::sys::time::TimeVal {
    let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    nix::sys::time::TimeVal::new(
        since.as_secs() as nix::sys::time::time_t,
        since.subsec_micros() as nix::sys::time::suseconds_t,
    )
}

/// Move the spool to `rescue`, copying when a rename is not possible.
fn save_rescue(spool: NamedTempFile, rescue: &Path) -> io::Result<()> {
    match spool.persist(rescue) {
        Ok(_) => Ok(()),
        Err(e) => {
            let mut src = e.file;
            src.seek(SeekFrom::Start(0))?;
            let mut dst = File::create(rescue)?;
            io::copy(&mut src, &mut dst)?;
            dst.sync_all()
        }
    }
}
