//! Core data model: message records, envelope fingerprints, and addresses.

pub mod address;
pub mod envelope;
pub mod message;
