//! Mailbox parsing: separator recognition, header decoding, and the streaming parser.

pub mod header;
pub mod mbox;
pub mod separator;
