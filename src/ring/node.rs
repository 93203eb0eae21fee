//! Node lifecycle: startup discovery, cluster join, and the set of
//! concurrent loops every directory node runs.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::join;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use rookery_db::directory::DirectoryStore;
use rookery_net::{discovery, socket};
use rookery_util::error::{Error, OkOrMessage};
use rookery_util::keyspace::KeyRange;

use crate::ring::RingState;

/// How long startup discovery collects DISCOVER replies.
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(1);
/// Deadline for the RANGE queries used to pick the join target.
const RANGE_QUERY_TIMEOUT: Duration = Duration::from_secs(3);
/// Deadline for the JOIN request itself.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Interval of the tail node's SUCC advertisement upstream.
const SUCC_INTERVAL: Duration = Duration::from_secs(5);
/// Interval of the state dump written to the log.
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

pub struct RingConfig {
	pub command_port: u16,
	pub liveness_port: u16,
	pub multicast_port: u16,
	pub data_dir: PathBuf,
	/// Override for the address peers should reach this node on; detected
	/// from the interfaces when absent.
	pub advertised_ip: Option<IpAddr>,
}

impl Default for RingConfig {
	fn default() -> Self {
		RingConfig {
			command_port: rookery_net::COMMAND_PORT,
			liveness_port: rookery_net::LIVENESS_PORT,
			multicast_port: discovery::MULTICAST_PORT,
			data_dir: PathBuf::from("server/db"),
			advertised_ip: None,
		}
	}
}

/// One directory server node.
pub struct DirectoryNode {
	pub name: String,
	/// The address peers know this node by.
	pub ip: IpAddr,
	pub(crate) config: RingConfig,
	pub store: DirectoryStore,

	ring: watch::Receiver<Arc<RingState>>,
	update_ring: Mutex<watch::Sender<Arc<RingState>>>,

	pub(crate) crisis: AtomicBool,
	pub(crate) last_fix: std::sync::Mutex<Option<Instant>>,

	pub(crate) command_socket: Arc<UdpSocket>,
	pub(crate) liveness_socket: Arc<UdpSocket>,

	stop: watch::Sender<bool>,
}

impl DirectoryNode {
	/// Open the local shard, discover the LAN, join the widest-range peer
	/// (or bootstrap alone) and bind the node's well-known sockets.
	///
	/// Failure to bind the command or liveness port is fatal.
	pub async fn init(name: String, config: RingConfig) -> Result<Arc<Self>, Error> {
		let store = DirectoryStore::open(&config.data_dir, &name)?;
		let replicants = match store.replica_owners() {
			Ok(owners) => owners,
			Err(e) => {
				warn!("Could not reload replica owners, starting empty: {}", e);
				vec![]
			}
		};

		let ip = config.advertised_ip.unwrap_or_else(rookery_net::local_ip);

		let peers = match discovery::discover_servers(config.command_port, DISCOVER_TIMEOUT).await
		{
			Ok(peers) => peers.into_iter().filter(|(_, pip)| *pip != ip).collect(),
			Err(e) => {
				warn!("LAN discovery failed ({}), assuming no peers", e);
				vec![]
			}
		};

		let mut state = if peers.is_empty() {
			info!("No other servers running");
			RingState::solo()
		} else {
			for (peer_name, peer_ip) in &peers {
				info!("Server found: {} at {}", peer_name, peer_ip);
			}
			join_cluster(&peers, config.command_port).await?
		};
		state.replicants = replicants;

		let (update_ring, ring) = watch::channel(Arc::new(state));
		let (stop, _) = watch::channel(false);

		let command_socket =
			UdpSocket::bind(("0.0.0.0", config.command_port))
				.await
				.map_err(|e| {
					Error::Message(format!(
						"Cannot bind command port {}: {}",
						config.command_port, e
					))
				})?;
		let liveness_socket =
			UdpSocket::bind(("0.0.0.0", config.liveness_port))
				.await
				.map_err(|e| {
					Error::Message(format!(
						"Cannot bind liveness port {}: {}",
						config.liveness_port, e
					))
				})?;

		let node = Arc::new(DirectoryNode {
			name,
			ip,
			config,
			store,
			ring,
			update_ring: Mutex::new(update_ring),
			crisis: AtomicBool::new(false),
			last_fix: std::sync::Mutex::new(None),
			command_socket: Arc::new(command_socket),
			liveness_socket: Arc::new(liveness_socket),
			stop,
		});
		node.log_status();
		Ok(node)
	}

	/// Run every loop of the node until `shutdown` is called (by a signal
	/// handler or by an incoming KILL).
	pub async fn run(self: Arc<Self>) {
		let must_exit = self.stop.subscribe();
		join!(
			self.command_loop(must_exit.clone()),
			self.liveness_loop(must_exit.clone()),
			self.integrity_loop(must_exit.clone()),
			self.successor_provider_loop(must_exit.clone()),
			self.replication_loop(must_exit.clone()),
			self.status_loop(must_exit.clone()),
			self.multicast_loop(must_exit.clone()),
		);
		info!("Node '{}' stopped", self.name);
	}

	pub fn shutdown(&self) {
		let _ = self.stop.send(true);
	}

	pub fn stop_signal(&self) -> watch::Receiver<bool> {
		self.stop.subscribe()
	}

	/// A consistent snapshot of the ring state.
	pub fn ring_state(&self) -> Arc<RingState> {
		self.ring.borrow().clone()
	}

	pub fn in_crisis(&self) -> bool {
		self.crisis.load(Ordering::SeqCst)
	}

	/// Clone-mutate-publish the ring state. The sender mutex serializes
	/// concurrent writers so no update is lost.
	pub(crate) async fn mutate_ring<F>(&self, mutate: F)
	where
		F: FnOnce(&mut RingState),
	{
		let update_ring = self.update_ring.lock().await;
		let mut state: RingState = self.ring.borrow().as_ref().clone();
		mutate(&mut state);
		let _ = update_ring.send(Arc::new(state));
	}

	pub(crate) fn command_addr(&self, ip: IpAddr) -> SocketAddr {
		SocketAddr::new(ip, self.config.command_port)
	}

	pub(crate) fn liveness_addr(&self, ip: IpAddr) -> SocketAddr {
		SocketAddr::new(ip, self.config.liveness_port)
	}

	pub(crate) fn log_status(&self) {
		let st = self.ring_state();
		info!(
			"Server '{}' on ({}:{}). Storing in range {}. Predecessor is {:?}, successor is {:?}",
			self.name, self.ip, self.config.command_port, st.range, st.predecessor, st.successor
		);
		info!(
			"Backup successors: {:?}. Replics: {:?}. Replicants: {:?}",
			st.backup_successors, st.replics, st.replicants
		);
	}

	/// The tail of the tape (no successor) periodically seeds the backup
	/// successor chain by advertising itself upstream; interior nodes extend
	/// and retransmit on receipt.
	async fn successor_provider_loop(
		self: &Arc<Self>,
		mut must_exit: watch::Receiver<bool>,
	) {
		while !*must_exit.borrow() {
			let st = self.ring_state();
			if st.successor.is_none() {
				if let Some(pred) = st.predecessor {
					let msg = format!("SUCC {}", self.ip);
					if let Err(e) = self
						.command_socket
						.send_to(msg.as_bytes(), self.command_addr(pred))
						.await
					{
						debug!("SUCC advertisement to {} failed: {}", pred, e);
					}
				}
			}
			select! {
				_ = tokio::time::sleep(SUCC_INTERVAL) => {},
				_ = must_exit.changed() => {},
			}
		}
	}

	async fn status_loop(self: &Arc<Self>, mut must_exit: watch::Receiver<bool>) {
		while !*must_exit.borrow() {
			select! {
				_ = tokio::time::sleep(STATUS_INTERVAL) => self.log_status(),
				_ = must_exit.changed() => {},
			}
		}
	}
}

/// Pick the peer with the widest range (first received wins ties) and ask it
/// for half of it.
async fn join_cluster(
	peers: &[(String, IpAddr)],
	command_port: u16,
) -> Result<RingState, Error> {
	let mut widest: Option<(IpAddr, u64)> = None;
	for (peer_name, peer_ip) in peers {
		let addr = SocketAddr::new(*peer_ip, command_port);
		match socket::query(addr, "RANGE", RANGE_QUERY_TIMEOUT).await {
			Ok(reply) => match parse_range_reply(&reply) {
				Ok(range) => {
					if widest.map(|(_, w)| range.width() > w).unwrap_or(true) {
						widest = Some((*peer_ip, range.width()));
					}
				}
				Err(e) => warn!("Bad RANGE reply from '{}': {}", peer_name, e),
			},
			Err(e) => warn!("Error getting range from server '{}': {}", peer_name, e),
		}
	}

	let (target, _) = widest.ok_or_message("No peer answered a RANGE query")?;
	let reply = socket::query(
		SocketAddr::new(target, command_port),
		"JOIN",
		JOIN_TIMEOUT,
	)
	.await?;

	let tokens: Vec<&str> = reply.split_whitespace().collect();
	match tokens.as_slice() {
		["OK", lower, upper, predecessor, successor] => {
			let successor = if *successor == "_" {
				None
			} else {
				Some(successor.parse()?)
			};
			let state = RingState {
				range: KeyRange {
					lower: lower.parse()?,
					upper: upper.parse()?,
				},
				predecessor: Some(predecessor.parse()?),
				successor,
				backup_successors: vec![],
				replics: vec![],
				replicants: vec![],
			};
			info!("Joined the ring through {}", target);
			Ok(state)
		}
		_ => Err(Error::Message(format!("Joining request failed: {}", reply))),
	}
}

pub(crate) fn parse_range_reply(reply: &str) -> Result<KeyRange, Error> {
	let tokens: Vec<&str> = reply.split_whitespace().collect();
	match tokens.as_slice() {
		["OK", lower, upper] => Ok(KeyRange {
			lower: lower.parse()?,
			upper: upper.parse()?,
		}),
		_ => Err(Error::Wire(format!("bad RANGE reply: {}", reply))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn range_reply_parsing() {
		let r = parse_range_reply("OK 10 500").unwrap();
		assert_eq!(r, KeyRange {
			lower: 10,
			upper: 500
		});
		assert!(parse_range_reply("ERROR nope").is_err());
		assert!(parse_range_reply("OK 10").is_err());
	}
}
