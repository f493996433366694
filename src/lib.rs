//! `mboxstore`: a crash-safe storage engine for mbox and MMDF mailboxes.
//!
//! This crate parses flat-file mailboxes into an in-memory catalog, notices
//! when other programs change the file, carries local flags across re-reads,
//! and writes deletions and flag changes back with minimal rewriting.

pub mod config;
pub mod error;
pub mod model;
pub mod parser;
pub mod progress;
pub mod store;

pub use error::{MboxError, Result};
pub use model::message::{ContentLength, Flag, MessageFlags, MessageRecord};
pub use parser::separator::Dialect;
pub use progress::{CancelToken, ProgressEvent};
pub use store::{CheckStatus, Mailbox, MailboxOptions, SyncOutcome};
