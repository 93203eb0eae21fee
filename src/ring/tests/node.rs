//! End-to-end exercise of a single node over its real UDP sockets.
//!
//! The wire identifies nodes by IP alone, so multi-node rings cannot share a
//! loopback host; the single-node path still covers bootstrap, command
//! handling, routing to the local shard, replica bookkeeping and shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use rookery_net::socket;
use rookery_ring::node::{DirectoryNode, RingConfig};
use rookery_ring::FAULT_TOLERANCE;
use rookery_util::keyspace::{key_hash, HASH_MOD};

const CMD_PORT: u16 = 42345;
const LIVE_PORT: u16 = 42346;
const REPLY_WAIT: Duration = Duration::from_secs(1);

async fn wait_until(mut cond: impl FnMut() -> bool) {
	for _ in 0..100 {
		if cond() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	panic!("condition not reached in time");
}

#[tokio::test]
async fn single_node_cluster_end_to_end() {
	let data_dir = mktemp::Temp::new_dir().unwrap();
	let config = RingConfig {
		command_port: CMD_PORT,
		liveness_port: LIVE_PORT,
		multicast_port: 40003,
		data_dir: data_dir.as_path().to_path_buf(),
		advertised_ip: Some("127.0.0.1".parse().unwrap()),
	};

	let node = DirectoryNode::init("testnode".to_string(), config)
		.await
		.unwrap();

	// Alone in the cluster: the node owns the whole keyspace, no neighbors.
	let st = node.ring_state();
	assert_eq!(st.range.lower, 0);
	assert_eq!(st.range.upper, HASH_MOD - 1);
	assert!(st.predecessor.is_none());
	assert!(st.successor.is_none());

	let running = tokio::spawn(node.clone().run());

	let cmd: SocketAddr = format!("127.0.0.1:{}", CMD_PORT).parse().unwrap();
	let live: SocketAddr = format!("127.0.0.1:{}", LIVE_PORT).parse().unwrap();

	// Liveness responder
	assert!(socket::probe(live, Duration::from_millis(500)).await);

	// DISCOVER answers with the node name
	let name = socket::query(cmd, "DISCOVER", REPLY_WAIT).await.unwrap();
	assert_eq!(name, "testnode");

	// RANGE reports the full keyspace
	let range = socket::query(cmd, "RANGE", REPLY_WAIT).await.unwrap();
	assert_eq!(range, format!("OK 0 {}", HASH_MOD - 1));

	// REGISTER in the short client form is persisted locally and answered
	let reply = socket::query(cmd, "REGISTER ada 127.0.0.1 40001", REPLY_WAIT)
		.await
		.unwrap();
	assert!(reply.starts_with("OK"), "unexpected reply: {}", reply);
	assert!(node.ring_state().range.contains(key_hash("ada")));
	assert_eq!(
		node.store.resolve_user("ada").unwrap(),
		Some(("127.0.0.1".parse().unwrap(), 40001))
	);

	// Re-registration replaces the endpoint
	let reply = socket::query(cmd, "REGISTER ada 127.0.0.1 40009", REPLY_WAIT)
		.await
		.unwrap();
	assert!(reply.starts_with("OK"));
	assert_eq!(
		node.store.resolve_user("ada").unwrap(),
		Some(("127.0.0.1".parse().unwrap(), 40009))
	);

	// RESOLVE for a known and an unknown user
	let reply = socket::query(cmd, "RESOLVE ada", REPLY_WAIT).await.unwrap();
	assert_eq!(reply, "OK 127.0.0.1 40009");
	let reply = socket::query(cmd, "RESOLVE ghost", REPLY_WAIT).await.unwrap();
	assert!(reply.starts_with("ERROR 404"), "unexpected reply: {}", reply);

	// REPLIC from an unknown sender must populate the replicants set
	let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
	peer.send_to(b"REPLIC grace 127.0.0.1 40002", cmd)
		.await
		.unwrap();
	{
		let node = node.clone();
		wait_until(move || {
			node.ring_state()
				.replicants
				.contains(&"127.0.0.1".parse().unwrap())
		})
		.await;
	}
	let rows = node.store.replicas_of("127.0.0.1".parse().unwrap()).unwrap();
	assert_eq!(rows.len(), 1);
	assert_eq!(rows[0].username, "grace");

	// DROP_REPLICS clears both the rows and the replicant entry
	peer.send_to(b"DROP_REPLICS 127.0.0.1", cmd).await.unwrap();
	{
		let node = node.clone();
		wait_until(move || node.ring_state().replicants.is_empty()).await;
	}
	assert!(node
		.store
		.replicas_of("127.0.0.1".parse().unwrap())
		.unwrap()
		.is_empty());

	// Unknown verbs are ignored, the node stays up
	peer.send_to(b"FROBNICATE 1 2 3", cmd).await.unwrap();
	assert!(socket::probe(live, Duration::from_millis(500)).await);

	// A second FIX landing mid-crisis is a no-op; the crisis clears on its own
	peer.send_to(b"FIX", cmd).await.unwrap();
	peer.send_to(b"FIX", cmd).await.unwrap();
	{
		let node = node.clone();
		wait_until(move || node.in_crisis()).await;
	}
	{
		let node = node.clone();
		wait_until(move || !node.in_crisis()).await;
	}
	assert!(socket::probe(live, Duration::from_millis(500)).await);
	// Shard correction left the in-range row alone
	assert!(node.store.resolve_user("ada").unwrap().is_some());

	// Replication invariants at rest
	let st = node.ring_state();
	assert!(st.replics.len() <= FAULT_TOLERANCE + 1);
	assert!(!st.replics.contains(&node.ip));

	// KILL terminates every loop
	socket::send_oneshot(cmd, "KILL").await.unwrap();
	timeout(Duration::from_secs(5), running)
		.await
		.expect("node did not stop after KILL")
		.unwrap();
}
