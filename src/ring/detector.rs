//! Liveness probing and ring repair.
//!
//! Every node probes its neighbors once a second. A missed probe broadcasts
//! FIX to the whole LAN and every node then runs its own crisis sequence:
//! patch the tape forward and backward, absorb the shards of dead
//! replicants, and push away the rows that no longer hash into the local
//! range.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::watch;
use tokio::time::Instant;

use rookery_net::socket::{self, PROBE_TIMEOUT};
use rookery_util::keyspace::HASH_MOD;

use crate::node::{parse_range_reply, DirectoryNode};
use crate::FAULT_TOLERANCE;

/// Interval of the neighbor liveness check.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);
/// The backward re-probe is more patient than the forward one: the
/// predecessor may itself be busy repairing its forward side.
const BACKWARD_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
/// Deadline for the RANGE query to a promoted backup successor.
const PROMOTE_RANGE_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between the forward and backward halves of fix-tape, letting the
/// rest of the cluster finish its forward repairs first.
const FIX_STAGGER: Duration = Duration::from_millis(100 * 3 * FAULT_TOLERANCE as u64);
/// A node broadcasts FIX at most this often.
const FIX_MIN_INTERVAL: Duration = Duration::from_secs(1);

impl DirectoryNode {
	/// Answer PING with PONG on the dedicated liveness port.
	pub(crate) async fn liveness_loop(self: &Arc<Self>, mut must_exit: watch::Receiver<bool>) {
		let mut buf = [0u8; 64];
		while !*must_exit.borrow() {
			select! {
				res = self.liveness_socket.recv_from(&mut buf) => match res {
					Ok((n, from)) => {
						if &buf[..n] == b"PING" {
							let _ = self.liveness_socket.send_to(b"PONG", from).await;
						}
					}
					Err(e) => debug!("Liveness socket receive error: {}", e),
				},
				_ = must_exit.changed() => {},
			}
		}
	}

	/// Probe successor then predecessor once a second; any timeout raises
	/// the alarm for the whole cluster.
	pub(crate) async fn integrity_loop(self: &Arc<Self>, mut must_exit: watch::Receiver<bool>) {
		while !*must_exit.borrow() {
			if !self.in_crisis() {
				let st = self.ring_state();
				let mut compromised = false;
				if let Some(succ) = st.successor {
					compromised |= !socket::probe(self.liveness_addr(succ), PROBE_TIMEOUT).await;
				}
				if !compromised {
					if let Some(pred) = st.predecessor {
						compromised |=
							!socket::probe(self.liveness_addr(pred), PROBE_TIMEOUT).await;
					}
				}
				if compromised {
					warn!("Tape integrity compromised");
					self.raise_fix().await;
				}
			}
			select! {
				_ = tokio::time::sleep(PROBE_INTERVAL) => {},
				_ = must_exit.changed() => {},
			}
		}
		info!("Shutting tape integrity check off");
	}

	/// Broadcast FIX to every command port on the LAN (rate-limited) and run
	/// our own crisis sequence without waiting for the loopback copy.
	async fn raise_fix(self: &Arc<Self>) {
		let due = {
			let mut last = self.last_fix.lock().unwrap();
			let now = Instant::now();
			match *last {
				Some(t) if now.duration_since(t) < FIX_MIN_INTERVAL => false,
				_ => {
					*last = Some(now);
					true
				}
			}
		};
		if !due {
			return;
		}

		match UdpSocket::bind(("0.0.0.0", 0)).await {
			Ok(sock) => {
				if sock.set_broadcast(true).is_ok() {
					let _ = sock
						.send_to(b"FIX", (Ipv4Addr::BROADCAST, self.config.command_port))
						.await;
				}
			}
			Err(e) => warn!("Could not broadcast FIX: {}", e),
		}

		tokio::spawn(self.clone().run_crisis());
	}

	/// The crisis sequence. Idempotent: a FIX received while already in
	/// crisis is a no-op.
	pub(crate) async fn run_crisis(self: Arc<Self>) {
		if self
			.crisis
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			debug!("FIX received while already in crisis, ignoring");
			return;
		}
		warn!("Entering crisis mode");

		self.fix_tape().await;
		self.assimilate_dead_replicants().await;
		self.correct_shard().await;

		self.crisis.store(false, Ordering::SeqCst);
		info!("Crisis resolved");
		self.log_status();
	}

	async fn fix_tape(&self) {
		let st = self.ring_state();
		if let Some(succ) = st.successor {
			if !socket::probe(self.liveness_addr(succ), PROBE_TIMEOUT).await {
				self.fix_tape_forward().await;
			}
		}

		tokio::time::sleep(FIX_STAGGER).await;

		let st = self.ring_state();
		if let Some(pred) = st.predecessor {
			if !socket::probe(self.liveness_addr(pred), BACKWARD_PROBE_TIMEOUT).await {
				self.fix_tape_backward(pred).await;
			}
		}
	}

	/// The successor is gone: promote the first live backup successor and
	/// absorb the keyspace between us and it. With no live candidate at all
	/// we become the tail of the tape.
	async fn fix_tape_forward(&self) {
		let st = self.ring_state();
		for candidate in st.backup_successors.clone() {
			if !socket::probe(self.liveness_addr(candidate), PROBE_TIMEOUT).await {
				warn!("Backup successor {} unavailable", candidate);
				continue;
			}
			let reply = match socket::query(
				self.command_addr(candidate),
				"RANGE",
				PROMOTE_RANGE_TIMEOUT,
			)
			.await
			{
				Ok(r) => r,
				Err(e) => {
					warn!("RANGE query to backup successor {} failed: {}", candidate, e);
					continue;
				}
			};
			let range = match parse_range_reply(&reply) {
				Ok(r) => r,
				Err(e) => {
					warn!("Bad RANGE reply from {}: {}", candidate, e);
					continue;
				}
			};

			self.mutate_ring(|st| {
				st.range.upper = range.lower.saturating_sub(1);
				st.successor = Some(candidate);
			})
			.await;
			let msg = format!("PRED_CHANGE {}", self.ip);
			let _ = self
				.command_socket
				.send_to(msg.as_bytes(), self.command_addr(candidate))
				.await;
			info!(
				"Promoted {} to successor, absorbing keyspace up to {}",
				candidate,
				range.lower.saturating_sub(1)
			);
			return;
		}

		self.mutate_ring(|st| {
			st.range.upper = HASH_MOD - 1;
			st.successor = None;
			st.backup_successors.clear();
		})
		.await;
		info!("No backup successor answered, absorbing the forward gap");
	}

	/// The predecessor is gone: tell it to die in case it is half-alive,
	/// then adopt the backward gap down to the start of the keyspace.
	async fn fix_tape_backward(&self, dead: std::net::IpAddr) {
		let _ = socket::send_oneshot(self.command_addr(dead), "KILL").await;
		self.mutate_ring(|st| {
			st.range.lower = 0;
			st.predecessor = None;
		})
		.await;
		info!("Predecessor {} is dead, absorbing the backward gap", dead);
	}
}
