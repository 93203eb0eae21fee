//! The distributed directory node: consistent-hash ring membership, request
//! routing, failure detection and shard replication.

#[macro_use]
extern crate tracing;

pub mod node;
pub mod ring;

mod commands;
mod detector;
mod multicast;
mod replication;

/// Number of simultaneous node failures the ring is provisioned to survive.
/// Each shard is kept on `FAULT_TOLERANCE + 1` replics and each node tracks
/// `FAULT_TOLERANCE + 1` backup successors.
pub const FAULT_TOLERANCE: usize = 3;
