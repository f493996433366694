//! Catalog entries: one [`MessageRecord`] per message found in the mailbox file.

use chrono::{DateTime, Utc};

use super::envelope::{BodyShape, Envelope};

/// Declared or recovered byte length of a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ContentLength {
    Known(u64),
    /// No trustworthy length yet; it must be recomputed by scanning.
    Unknown,
}

impl ContentLength {
    pub fn known(self) -> Option<u64> {
        match self {
            Self::Known(n) => Some(n),
            Self::Unknown => None,
        }
    }

    pub fn is_known(self) -> bool {
        matches!(self, Self::Known(_))
    }
}

/// A flag that can be toggled on a record through the mailbox handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Deleted,
    Old,
    Read,
    Flagged,
    Replied,
    Tagged,
    Purge,
    AttachDeleted,
}

/// Per-message state.
///
/// `old`, `read`, `flagged` and `replied` have an on-disk form (the `Status`
/// and `X-Status` headers). `deleted`, `purge` and `tagged` are local intents.
/// `changed` marks a record whose persistent flags differ from the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MessageFlags {
    pub deleted: bool,
    pub changed: bool,
    pub old: bool,
    pub read: bool,
    pub flagged: bool,
    pub replied: bool,
    pub tagged: bool,
    pub purge: bool,
    pub attach_deleted: bool,
}

impl MessageFlags {
    pub fn get(&self, flag: Flag) -> bool {
        match flag {
            Flag::Deleted => self.deleted,
            Flag::Old => self.old,
            Flag::Read => self.read,
            Flag::Flagged => self.flagged,
            Flag::Replied => self.replied,
            Flag::Tagged => self.tagged,
            Flag::Purge => self.purge,
            Flag::AttachDeleted => self.attach_deleted,
        }
    }

    pub(crate) fn slot(&mut self, flag: Flag) -> &mut bool {
        match flag {
            Flag::Deleted => &mut self.deleted,
            Flag::Old => &mut self.old,
            Flag::Read => &mut self.read,
            Flag::Flagged => &mut self.flagged,
            Flag::Replied => &mut self.replied,
            Flag::Tagged => &mut self.tagged,
            Flag::Purge => &mut self.purge,
            Flag::AttachDeleted => &mut self.attach_deleted,
        }
    }

    /// Compact one-letter rendering used by the CLI (`D`, `N`, `O`, `F`, `r`, `*`).
    pub fn summary(&self) -> String {
        let mut s = String::with_capacity(4);
        if self.deleted {
            s.push('D');
        } else if !self.read {
            s.push(if self.old { 'O' } else { 'N' });
        } else {
            s.push(' ');
        }
        s.push(if self.flagged { 'F' } else { ' ' });
        s.push(if self.replied { 'r' } else { ' ' });
        s.push(if self.tagged { '*' } else { ' ' });
        s
    }
}

/// One parsed message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MessageRecord {
    /// Byte offset of the separator line that opens the message.
    pub offset: u64,
    /// Byte offset of the first body byte (just past the blank line ending the header).
    pub body_offset: u64,
    pub content_length: ContentLength,
    /// Number of body lines.
    pub line_count: u64,
    /// Timestamp from the mbox envelope line, if any.
    pub received: Option<DateTime<Utc>>,
    /// Whether the header declared MIME-Version.
    pub mime: bool,
    pub envelope: Envelope,
    pub body: BodyShape,
    pub flags: MessageFlags,
}

impl MessageRecord {
    /// Empty record starting at `offset`.
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            body_offset: offset,
            content_length: ContentLength::Unknown,
            line_count: 0,
            received: None,
            mime: false,
            envelope: Envelope::default(),
            body: BodyShape::default(),
            flags: MessageFlags::default(),
        }
    }

    /// Whether the on-disk bytes of this message must be rewritten on sync.
    pub fn is_dirty(&self) -> bool {
        self.flags.deleted || self.flags.changed || self.flags.attach_deleted
    }

    /// A message that arrived since the user last looked at the mailbox.
    pub fn is_new(&self) -> bool {
        !self.flags.deleted && !self.flags.read && !self.flags.old
    }

    /// Known body length, or zero.
    pub fn body_length(&self) -> u64 {
        self.content_length.known().unwrap_or(0)
    }

    /// Strict structural identity.
    ///
    /// Two records are the same message only if every fingerprint field is
    /// equal. Flags and offsets are deliberately ignored.
    pub fn same_message(&self, other: &MessageRecord) -> bool {
        self.received == other.received
            && self.content_length == other.content_length
            && self.line_count == other.line_count
            && self.mime == other.mime
            && self.envelope == other.envelope
            && self.body == other.body
    }
}
