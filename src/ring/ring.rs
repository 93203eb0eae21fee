//! In-memory ring membership state of one node.

use std::net::IpAddr;

use rookery_util::keyspace::KeyRange;

use crate::FAULT_TOLERANCE;

/// Snapshot of this node's position in the ring and its replication
/// relationships. Published through a watch channel: readers borrow a
/// consistent `Arc<RingState>`, writers clone-mutate-send behind a mutex.
#[derive(Debug, Clone)]
pub struct RingState {
	/// The contiguous hash range this node owns.
	pub range: KeyRange,
	/// Owner of the range ending at `range.lower - 1`.
	pub predecessor: Option<IpAddr>,
	/// Owner of the range starting at `range.upper + 1`.
	pub successor: Option<IpAddr>,
	/// Prefix of the clockwise ring walk starting at the successor,
	/// truncated to `FAULT_TOLERANCE + 1` entries.
	pub backup_successors: Vec<IpAddr>,
	/// Remote nodes holding a copy of this node's shard.
	pub replics: Vec<IpAddr>,
	/// Remote owners whose shards this node holds.
	pub replicants: Vec<IpAddr>,
}

impl RingState {
	/// A node alone in the cluster: it owns the whole keyspace and has no
	/// neighbors.
	pub fn solo() -> Self {
		RingState {
			range: KeyRange::full(),
			predecessor: None,
			successor: None,
			backup_successors: vec![],
			replics: vec![],
			replicants: vec![],
		}
	}

	/// Install the backup-successor chain received via SUCC propagation.
	pub fn set_backup_successors(&mut self, chain: &[IpAddr]) {
		self.backup_successors = chain
			.iter()
			.take(FAULT_TOLERANCE + 1)
			.cloned()
			.collect();
	}

	pub fn add_replicant(&mut self, owner: IpAddr) -> bool {
		if self.replicants.contains(&owner) {
			false
		} else {
			self.replicants.push(owner);
			true
		}
	}
}

/// Which way a keyed request leaves this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
	Local,
	ToPredecessor,
	ToSuccessor,
}

impl RingState {
	pub fn route(&self, hash: u64) -> Route {
		if hash < self.range.lower {
			Route::ToPredecessor
		} else if hash > self.range.upper {
			Route::ToSuccessor
		} else {
			Route::Local
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ip(s: &str) -> IpAddr {
		s.parse().unwrap()
	}

	#[test]
	fn routing_bounds_are_inclusive() {
		let mut st = RingState::solo();
		st.range = KeyRange {
			lower: 100,
			upper: 200,
		};
		assert_eq!(st.route(100), Route::Local);
		assert_eq!(st.route(200), Route::Local);
		assert_eq!(st.route(99), Route::ToPredecessor);
		assert_eq!(st.route(201), Route::ToSuccessor);
	}

	#[test]
	fn solo_node_owns_everything() {
		let st = RingState::solo();
		assert_eq!(st.route(0), Route::Local);
		assert_eq!(st.route(rookery_util::keyspace::HASH_MOD - 1), Route::Local);
	}

	#[test]
	fn backup_chain_is_truncated() {
		let mut st = RingState::solo();
		let chain: Vec<IpAddr> = (1..=8).map(|i| ip(&format!("10.0.0.{}", i))).collect();
		st.set_backup_successors(&chain);
		assert_eq!(st.backup_successors.len(), FAULT_TOLERANCE + 1);
		assert_eq!(st.backup_successors[0], ip("10.0.0.1"));
	}

	#[test]
	fn replicants_are_a_set() {
		let mut st = RingState::solo();
		assert!(st.add_replicant(ip("10.0.0.5")));
		assert!(!st.add_replicant(ip("10.0.0.5")));
		assert_eq!(st.replicants.len(), 1);
	}
}
