//! Utility crate for the Rookery chat directory

pub mod error;
pub mod keyspace;
