//! The mailbox engine: open handles, change detection, reconciliation and compaction.

pub mod check;
pub mod copy;
pub mod lock;
pub mod mailbox;
pub mod reconcile;
pub mod sync;

pub use check::CheckStatus;
pub use mailbox::{check_empty, Mailbox, MailboxBuilder, MailboxOptions, Snapshot};
pub use sync::{SyncCheckpoint, SyncOutcome};
