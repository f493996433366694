//! Integration tests for the mailbox engine: parsing, change detection,
//! reconciliation and compaction against real files.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};

use mboxstore::model::message::{ContentLength, Flag};
use mboxstore::parser::separator::{Dialect, FROM_PREFIX, MMDF_SEP};
use mboxstore::progress::ProgressEvent;
use mboxstore::store::{CheckStatus, Mailbox, MailboxBuilder, MailboxOptions, SyncOutcome};
use mboxstore::MboxError;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Copy a fixture into a fresh temp directory.
fn workspace(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    std::fs::copy(fixture(name), &path).unwrap();
    (dir, path)
}

fn options(dir: &tempfile::TempDir) -> MailboxOptions {
    MailboxOptions {
        tmp_dir: Some(dir.path().to_path_buf()),
        lock_retries: 2,
        lock_retry_delay: Duration::from_millis(5),
        ..MailboxOptions::default()
    }
}

fn sha(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

/// Every record's offset must point at a separator of the mailbox's dialect.
fn assert_separators(mailbox: &Mailbox) {
    let data = std::fs::read(mailbox.path()).unwrap();
    for record in mailbox.records() {
        let at = &data[record.offset as usize..];
        match mailbox.dialect() {
            Dialect::Mbox => assert!(at.starts_with(FROM_PREFIX), "offset {}", record.offset),
            Dialect::Mmdf => assert!(at.starts_with(MMDF_SEP), "offset {}", record.offset),
        }
    }
}

// ─── Parsing ────────────────────────────────────────────────────────

#[test]
fn test_parse_simple_mbox() {
    let (dir, path) = workspace("simple.mbox");
    let mailbox = Mailbox::open(&path, options(&dir)).unwrap();

    assert_eq!(mailbox.len(), 5);
    assert_eq!(mailbox.dialect(), Dialect::Mbox);
    assert_separators(&mailbox);

    let first = &mailbox.records()[0];
    assert_eq!(first.envelope.subject.as_deref(), Some("Hello World"));
    assert_eq!(first.envelope.from[0].address, "user1@example.com");
    assert_eq!(first.envelope.from[0].display_name, "User One");
    assert_eq!(first.envelope.message_id.as_deref(), Some("<msg001@example.com>"));
    assert!(first.received.is_some());

    let second = &mailbox.records()[1].flags;
    assert!(second.read && second.old && !second.changed);

    let third = &mailbox.records()[2];
    assert_eq!(third.envelope.subject.as_deref(), Some("Café meeting"));
    assert_eq!(third.envelope.from[0].display_name, "José García");
    assert!(third.flags.flagged);
    assert!(third.mime);

    let fourth = &mailbox.records()[3];
    assert_eq!(fourth.content_length, ContentLength::Known(63));
    assert_eq!(fourth.line_count, 4);
}

#[test]
fn test_parse_simple_mmdf() {
    let (dir, path) = workspace("simple.mmdf");
    let mailbox = Mailbox::open(&path, options(&dir)).unwrap();

    assert_eq!(mailbox.len(), 3);
    assert_eq!(mailbox.dialect(), Dialect::Mmdf);
    assert_separators(&mailbox);
    assert_eq!(mailbox.records()[0].offset, 0);
    assert!(mailbox.records()[1].received.is_some());
    assert!(mailbox.records()[1].flags.read);
    assert_eq!(mailbox.records()[1].line_count, 2);
    assert_eq!(
        mailbox.read_message(2).unwrap(),
        b"From: User Three <user3@example.com>\n\
Subject: Third\n\
Date: Wed, 3 Jan 2024 12:00:00 +0000\n\
Message-ID: <mmdf003@example.com>\n\
\n\
Three.\n"
    );
}

#[test]
fn test_mmdf_missing_sentinel_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.mmdf");
    let mut data = std::fs::read(fixture("simple.mmdf")).unwrap();
    // Drop the opening sentinel of the second message.
    let second = data
        .windows(2 * MMDF_SEP.len())
        .position(|w| w == [MMDF_SEP, MMDF_SEP].concat().as_slice())
        .unwrap()
        + MMDF_SEP.len();
    data.drain(second..second + MMDF_SEP.len());
    std::fs::write(&path, data).unwrap();

    match Mailbox::open(&path, options(&dir)) {
        Err(MboxError::Corrupt { offset, .. }) => assert_eq!(offset, second as u64),
        Err(other) => panic!("expected Corrupt, got {other:?}"),
        Ok(_) => panic!("expected Corrupt, got a mailbox"),
    }
}

#[test]
fn test_progress_reaches_file_size() {
    let (dir, path) = workspace("simple.mbox");
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let mailbox = MailboxBuilder::new(&path)
        .options(options(&dir))
        .progress(Box::new(move |event| sink.lock().unwrap().push(event)))
        .open()
        .unwrap();

    let size = mailbox.snapshot().size;
    let events = events.lock().unwrap();
    assert_eq!(
        events.last(),
        Some(&ProgressEvent::Reading {
            done: size,
            total: size
        })
    );
}

// ─── Sync ───────────────────────────────────────────────────────────

#[test]
fn test_sync_without_changes_is_a_no_op() {
    let (dir, path) = workspace("simple.mbox");
    let before = std::fs::read(&path).unwrap();
    let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

    let mut mailbox = Mailbox::open(&path, options(&dir)).unwrap();
    let snapshot = mailbox.snapshot();
    assert_eq!(mailbox.sync().unwrap(), SyncOutcome::Clean);

    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), mtime);
    assert_eq!(mailbox.snapshot(), snapshot);
}

#[test]
fn test_delete_rewrites_only_the_tail() {
    let (dir, path) = workspace("simple.mbox");
    let mut mailbox = Mailbox::open(&path, options(&dir)).unwrap();
    let target = mailbox.records()[2].offset as usize;
    let before = std::fs::read(&path).unwrap();
    let prefix = sha(&before[..target]);

    mailbox.set_flag(2, Flag::Deleted, true).unwrap();
    let outcome = mailbox.sync().unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Synced {
            removed: 1,
            rewritten_from: target as u64
        }
    );

    let after = std::fs::read(&path).unwrap();
    assert_eq!(sha(&after[..target]), prefix);
    assert!(!String::from_utf8_lossy(&after).contains("msg003@example.com"));
    assert_eq!(mailbox.len(), 4);
    assert_separators(&mailbox);

    let fresh = Mailbox::open(&path, options(&dir)).unwrap();
    let subjects: Vec<_> = fresh
        .records()
        .iter()
        .map(|r| r.envelope.subject.clone().unwrap_or_default())
        .collect();
    assert_eq!(
        subjects,
        ["Hello World", "Re: Hello World", "Quarterly report", "Weekend"]
    );
    for (a, b) in fresh.records().iter().zip(mailbox.records()) {
        assert_eq!(a.offset, b.offset);
        assert_eq!(a.body_offset, b.body_offset);
        assert_eq!(a.content_length, b.content_length);
        assert_eq!(a.line_count, b.line_count);
    }
}

#[test]
fn test_flags_are_written_as_headers() {
    let (dir, path) = workspace("simple.mbox");
    let mut mailbox = Mailbox::open(&path, options(&dir)).unwrap();
    mailbox.set_flag(4, Flag::Read, true).unwrap();
    mailbox.set_flag(4, Flag::Replied, true).unwrap();
    mailbox.set_flag(2, Flag::Flagged, false).unwrap();
    mailbox.sync().unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("Subject: Weekend\nDate: Fri, 5 Jan 2024 17:45:00 +0000\nMessage-ID: <msg005@example.com>\nStatus: R\nX-Status: A\n"));
    assert!(!text.contains("X-Status: F"));
    // The untouched header fields keep their order and bytes.
    assert!(text.contains("Content-Transfer-Encoding: 8bit\nContent-Length: 30\nLines: 1\n\n"));

    let fresh = Mailbox::open(&path, options(&dir)).unwrap();
    let last = fresh.records()[4].flags;
    assert!(last.read && last.replied);
    assert!(!fresh.records()[2].flags.flagged);
    assert_eq!(fresh.records()[1].flags, mailbox.records()[1].flags);
}

#[test]
fn test_mmdf_delete_and_reopen() {
    let (dir, path) = workspace("simple.mmdf");
    let mut mailbox = Mailbox::open(&path, options(&dir)).unwrap();
    mailbox.set_flag(1, Flag::Deleted, true).unwrap();
    mailbox.sync().unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(!text.contains("Second"));
    assert!(text.ends_with("Three.\n\x01\x01\x01\x01\n"));
    assert_separators(&mailbox);

    let fresh = Mailbox::open(&path, options(&dir)).unwrap();
    assert_eq!(fresh.len(), 2);
    assert_eq!(fresh.records()[1].offset, mailbox.records()[1].offset);
    assert_eq!(fresh.records()[1].content_length, ContentLength::Known(7));
}

#[test]
fn test_sync_waits_for_foreign_lock() {
    let (dir, path) = workspace("simple.mbox");
    let mut mailbox = Mailbox::open(&path, options(&dir)).unwrap();
    mailbox.set_flag(0, Flag::Deleted, true).unwrap();

    let deliverer = Mailbox::open_append(&path, options(&dir)).unwrap();
    assert!(matches!(mailbox.sync(), Err(MboxError::Locked { .. })));
    assert!(mailbox.is_dirty());
    deliverer.close().unwrap();

    assert!(matches!(mailbox.sync().unwrap(), SyncOutcome::Synced { removed: 1, .. }));
}

// ─── Change detection ───────────────────────────────────────────────

#[test]
fn test_delivery_is_picked_up_incrementally() {
    let (dir, path) = workspace("simple.mbox");
    let mut mailbox = Mailbox::open(&path, options(&dir)).unwrap();
    let old_size = mailbox.snapshot().size;
    mailbox.set_flag(0, Flag::Tagged, true).unwrap();

    let mut deliverer = Mailbox::open_append(&path, options(&dir)).unwrap();
    let offset = deliverer
        .append_message(
            b"From: Late <late@example.com>\nSubject: Late\n\nFrom now on\n",
            None,
            None,
        )
        .unwrap();
    deliverer.close().unwrap();
    assert_eq!(offset, old_size);

    assert_eq!(mailbox.check().unwrap(), CheckStatus::NewMail);
    assert_eq!(mailbox.len(), 6);
    assert_eq!(mailbox.records()[5].offset, old_size);
    assert_eq!(mailbox.records()[5].envelope.return_path[0].address, "late@example.com");
    assert!(mailbox.records()[0].flags.tagged);
    assert!(mailbox.has_new());
    assert_separators(&mailbox);
    assert_eq!(mailbox.check().unwrap(), CheckStatus::Unchanged);
}

#[test]
fn test_forced_reparse_preserves_deletion() {
    let (dir, path) = workspace("simple.mmdf");
    let mut mailbox = Mailbox::open(&path, options(&dir)).unwrap();
    mailbox.set_flag(1, Flag::Deleted, true).unwrap();

    assert_eq!(mailbox.reload().unwrap(), CheckStatus::Reopened);
    assert_eq!(mailbox.len(), 3);
    let deleted: Vec<bool> = mailbox.records().iter().map(|r| r.flags.deleted).collect();
    assert_eq!(deleted, [false, true, false]);
    assert!(mailbox.is_dirty());
}

#[test]
fn test_foreign_flag_rewrite_is_never_synced_over() {
    let (dir, path) = workspace("simple.mbox");
    let mut mailbox = Mailbox::open(&path, options(&dir)).unwrap();
    assert!(mailbox.records()[1].flags.read);
    mailbox.set_flag(4, Flag::Deleted, true).unwrap();

    // Another client marks the second message unread, shrinking the file.
    let data = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, data.replacen("Status: RO\n", "Status: O\n", 1)).unwrap();

    assert!(matches!(mailbox.sync().unwrap(), SyncOutcome::ExternalChange(_)));
    assert!(!mailbox.records()[1].flags.read);
    assert!(mailbox.records()[4].flags.deleted);

    assert!(matches!(mailbox.sync().unwrap(), SyncOutcome::Synced { removed: 1, .. }));
    let fresh = Mailbox::open(&path, options(&dir)).unwrap();
    assert_eq!(fresh.len(), 4);
    assert!(!fresh.records()[1].flags.read);
    assert!(fresh.records()[1].flags.old);
}

#[test]
fn test_external_rewrite_keeps_pending_deletion() {
    let (dir, path) = workspace("simple.mbox");
    let mut mailbox = Mailbox::open(&path, options(&dir)).unwrap();
    mailbox.set_flag(3, Flag::Deleted, true).unwrap();

    // Another program expunges the first message.
    let data = std::fs::read(&path).unwrap();
    let second = mailbox.records()[1].offset as usize;
    std::fs::write(&path, &data[second..]).unwrap();

    assert_eq!(mailbox.check().unwrap(), CheckStatus::Reopened);
    assert_eq!(mailbox.len(), 4);
    assert!(mailbox.is_dirty());
    let deleted: Vec<_> = mailbox
        .records()
        .iter()
        .filter(|r| r.flags.deleted)
        .map(|r| r.envelope.subject.clone().unwrap_or_default())
        .collect();
    assert_eq!(deleted, ["Quarterly report"]);

    mailbox.sync().unwrap();
    let fresh = Mailbox::open(&path, options(&dir)).unwrap();
    assert_eq!(fresh.len(), 3);
    assert!(fresh
        .records()
        .iter()
        .all(|r| r.envelope.subject.as_deref() != Some("Quarterly report")));
}

#[test]
fn test_external_append_during_session_defers_sync() {
    let (dir, path) = workspace("simple.mbox");
    let mut mailbox = Mailbox::open(&path, options(&dir)).unwrap();
    mailbox.set_flag(1, Flag::Deleted, true).unwrap();

    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"From x@example.com Sat Jan  6 10:00:00 2024\nSubject: Extra\n\nHi\n\n")
        .unwrap();
    drop(file);

    assert_eq!(
        mailbox.sync().unwrap(),
        SyncOutcome::ExternalChange(CheckStatus::NewMail)
    );
    assert_eq!(mailbox.len(), 6);
    assert!(matches!(mailbox.sync().unwrap(), SyncOutcome::Synced { removed: 1, .. }));
    assert_eq!(mailbox.len(), 5);
    assert_separators(&mailbox);
}

// ─── Append mode ────────────────────────────────────────────────────

#[test]
fn test_append_creates_mmdf_mailbox() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("new.mmdf");
    let opts = MailboxOptions {
        default_dialect: Dialect::Mmdf,
        ..options(&dir)
    };

    let mut mailbox = Mailbox::open_append(&path, opts.clone()).unwrap();
    assert_eq!(mailbox.dialect(), Dialect::Mmdf);
    mailbox
        .append_message(b"Subject: one\n\nFrom the start\n", Some("a@example.com"), None)
        .unwrap();
    mailbox
        .append_message(b"Subject: two\n\nsecond", Some("b@example.com"), None)
        .unwrap();
    mailbox.close().unwrap();

    let reader = Mailbox::open(&path, opts).unwrap();
    assert_eq!(reader.dialect(), Dialect::Mmdf);
    assert_eq!(reader.len(), 2);
    assert_separators(&reader);
    // MMDF bodies are not quoted.
    assert_eq!(
        reader.read_message(0).unwrap(),
        b"Subject: one\n\nFrom the start\n"
    );
    assert_eq!(reader.read_message(1).unwrap(), b"Subject: two\n\nsecond\n");
    assert_eq!(reader.records()[1].envelope.return_path[0].address, "b@example.com");
}

#[test]
fn test_readonly_handle_keeps_flags_in_memory() {
    let (dir, path) = workspace("simple.mbox");
    let before = std::fs::read(&path).unwrap();
    let opts = MailboxOptions {
        readonly: true,
        ..options(&dir)
    };
    let mut mailbox = Mailbox::open(&path, opts).unwrap();
    mailbox.set_flag(0, Flag::Read, true).unwrap();
    assert!(mailbox.records()[0].flags.read);
    assert!(matches!(mailbox.sync(), Err(MboxError::ReadOnly(_))));
    assert_eq!(std::fs::read(&path).unwrap(), before);
}
