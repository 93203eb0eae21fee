//! The Rookery client: resolves peers through the directory ring and talks
//! to them directly, end-to-end encrypted.

#[macro_use]
extern crate tracing;

pub mod chat;
pub mod crypto;
