//! Full-loop test: a directory node on loopback, two clients registering
//! through it and messaging each other directly.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::timeout;

use rookery_client::chat::{ChatClient, ClientConfig, ServerInfo};
use rookery_net::socket;
use rookery_ring::node::{DirectoryNode, RingConfig};

const CMD_PORT: u16 = 52345;
const LIVE_PORT: u16 = 52346;

#[tokio::test]
async fn directory_backed_messaging() {
	let dir = mktemp::Temp::new_dir().unwrap();

	let node = DirectoryNode::init(
		"gateway".to_string(),
		RingConfig {
			command_port: CMD_PORT,
			liveness_port: LIVE_PORT,
			multicast_port: 50003,
			data_dir: dir.as_path().join("server"),
			advertised_ip: Some("127.0.0.1".parse().unwrap()),
		},
	)
	.await
	.unwrap();
	let running = tokio::spawn(node.clone().run());

	let server = ServerInfo {
		name: "gateway".to_string(),
		addr: format!("127.0.0.1:{}", CMD_PORT).parse().unwrap(),
	};

	let client_config = |sub: &str| ClientConfig {
		command_port: CMD_PORT,
		data_dir: dir.as_path().join(sub),
		enable_crypto: false,
	};

	let xavier = ChatClient::new("xavier".to_string(), client_config("x"))
		.await
		.unwrap();
	let yuki = ChatClient::new("yuki".to_string(), client_config("y"))
		.await
		.unwrap();
	xavier.use_server(server.clone());
	yuki.use_server(server.clone());

	let _x = tokio::spawn(xavier.clone().run());
	let _y = tokio::spawn(yuki.clone().run());

	// Both clients register their peer endpoints in the directory
	xavier.register().await.unwrap();
	yuki.register().await.unwrap();

	// The ring resolves yuki for xavier
	let resolved = xavier.resolve("yuki").await.unwrap();
	let expected: SocketAddr = yuki.local_addr();
	assert_eq!(resolved, Some(expected));

	// Unknown users come back as not found, not as an error
	assert_eq!(xavier.resolve("ghost").await.unwrap(), None);

	// Direct delivery through the resolved endpoint
	let mut inbox = yuki.subscribe();
	xavier
		.send_message("yuki", "hello through the ring")
		.await
		.unwrap();
	let received = timeout(Duration::from_secs(5), inbox.recv())
		.await
		.expect("message never arrived")
		.unwrap();
	assert_eq!(received.sender, "xavier");
	assert_eq!(received.text, "hello through the ring");

	xavier.shutdown();
	yuki.shutdown();

	// KILL brings the node down
	socket::send_oneshot(server.addr, "KILL").await.unwrap();
	timeout(Duration::from_secs(5), running)
		.await
		.expect("node did not stop after KILL")
		.unwrap();
}
