//! Carrying local message state across a full re-parse.
//!
//! Nothing in a flat mailbox identifies a message stably, so a record is
//! matched by strict structural equality ([`MessageRecord::same_message`]).
//! The search is biased towards the same position and then earlier ones,
//! since external deletions shift survivors towards the front. This is a
//! best-effort assignment: several structurally identical messages (for
//! example duplicate copies of one forward) can be paired out of order.

use crate::model::message::MessageRecord;

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub matched: usize,
    /// Old records with no counterpart in the new catalog.
    pub unmatched_old: usize,
}

/// Copy local state from `old` onto the freshly parsed `new` catalog.
///
/// Persistent flags (read, old, flagged, replied) are only taken from an
/// old record the session had changed; otherwise the on-disk values win.
/// Deleted, purge and tagged have no on-disk form and are always copied.
pub fn reconcile(new: &mut [MessageRecord], old: Vec<MessageRecord>) -> ReconcileReport {
    let mut old: Vec<Option<MessageRecord>> = old.into_iter().map(Some).collect();
    let mut report = ReconcileReport::default();

    for (i, record) in new.iter_mut().enumerate() {
        let forward = i..old.len();
        let backward = 0..i.min(old.len());
        let found = forward.chain(backward).find(|&j| {
            old[j]
                .as_ref()
                .is_some_and(|candidate| candidate.same_message(record))
        });

        let Some(j) = found else {
            continue;
        };
        let Some(previous) = old[j].take() else {
            continue;
        };
        carry_over(record, &previous);
        report.matched += 1;
    }

    report.unmatched_old = old.iter().filter(|slot| slot.is_some()).count();
    report
}

fn carry_over(record: &mut MessageRecord, previous: &MessageRecord) {
    let prev = &previous.flags;
    let flags = &mut record.flags;

    if prev.changed {
        for (slot, value) in [
            (&mut flags.flagged, prev.flagged),
            (&mut flags.replied, prev.replied),
            (&mut flags.old, prev.old),
            (&mut flags.read, prev.read),
        ] {
            if *slot != value {
                *slot = value;
                flags.changed = true;
            }
        }
    }

    flags.deleted = prev.deleted;
    flags.purge = prev.purge;
    flags.tagged = prev.tagged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message::ContentLength;

    fn record(subject: &str, offset: u64) -> MessageRecord {
        let mut rec = MessageRecord::new(offset);
        rec.envelope.subject = Some(subject.to_string());
        rec.content_length = ContentLength::Known(10);
        rec.line_count = 1;
        rec
    }

    #[test]
    fn test_local_intents_survive_unmodified_file() {
        let mut old = vec![record("a", 0), record("b", 100), record("c", 200)];
        old[1].flags.deleted = true;
        old[2].flags.tagged = true;
        let mut new = vec![record("a", 0), record("b", 100), record("c", 200)];

        let report = reconcile(&mut new, old);
        assert_eq!(report.matched, 3);
        assert_eq!(report.unmatched_old, 0);
        assert!(new[1].flags.deleted);
        assert!(new[2].flags.tagged);
        assert!(!new[0].flags.deleted);
    }

    #[test]
    fn test_unchanged_old_record_defers_to_disk() {
        let mut old = vec![record("a", 0)];
        old[0].flags.read = true;
        let mut new = vec![record("a", 0)];

        reconcile(&mut new, old);
        assert!(!new[0].flags.read);
        assert!(!new[0].flags.changed);
    }

    #[test]
    fn test_changed_old_record_wins() {
        let mut old = vec![record("a", 0)];
        old[0].flags.read = true;
        old[0].flags.flagged = true;
        old[0].flags.changed = true;
        let mut new = vec![record("a", 0)];
        new[0].flags.read = true;

        reconcile(&mut new, old);
        assert!(new[0].flags.read && new[0].flags.flagged);
        assert!(new[0].flags.changed);

        // Nothing differs: not marked changed.
        let mut old = vec![record("a", 0)];
        old[0].flags.changed = true;
        let mut new = vec![record("a", 0)];
        reconcile(&mut new, old);
        assert!(!new[0].flags.changed);
    }

    #[test]
    fn test_external_deletion_shifts_matches_forward() {
        let mut old = vec![record("a", 0), record("b", 100), record("c", 200)];
        old[2].flags.deleted = true;
        // "a" was removed by someone else.
        let mut new = vec![record("b", 0), record("c", 100)];

        let report = reconcile(&mut new, old);
        assert_eq!(report.matched, 2);
        assert_eq!(report.unmatched_old, 1);
        assert!(new[1].flags.deleted);
    }

    #[test]
    fn test_insertion_matches_backward() {
        let mut old = vec![record("a", 0), record("b", 100)];
        old[0].flags.tagged = true;
        let mut new = vec![record("x", 0), record("y", 50), record("a", 100), record("b", 200)];
        new.swap(0, 2);
        // new = [a, y, x, b]; "b" at index 3 is found by the backward search.

        let report = reconcile(&mut new, old);
        assert_eq!(report.matched, 2);
        assert!(new[0].flags.tagged);
        assert_eq!(report.unmatched_old, 0);
    }

    #[test]
    fn test_identical_messages_are_matched_once() {
        let mut old = vec![record("dup", 0), record("dup", 100)];
        old[0].flags.deleted = true;
        let mut new = vec![record("dup", 0)];

        let report = reconcile(&mut new, old);
        assert_eq!(report.matched, 1);
        assert_eq!(report.unmatched_old, 1);
        assert!(new[0].flags.deleted);
    }
}
