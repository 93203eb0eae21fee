//! Live loopback exercises of the peer channel: pending-queue retry, key
//! exchange coalescing, and end-to-end encrypted delivery between two
//! clients. Every socket is ephemeral so the tests can run in parallel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use rookery_client::chat::{ChatClient, ClientConfig};
use rookery_client::crypto::CryptoManager;

fn config(dir: &std::path::Path, crypto: bool) -> ClientConfig {
	ClientConfig {
		data_dir: dir.to_path_buf(),
		enable_crypto: crypto,
		..Default::default()
	}
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
	for _ in 0..200 {
		if cond() {
			return;
		}
		sleep(Duration::from_millis(50)).await;
	}
	panic!("condition not reached in time");
}

#[tokio::test]
async fn self_send_goes_straight_to_the_log() {
	let dir = mktemp::Temp::new_dir().unwrap();
	let x = ChatClient::new("xavier".to_string(), config(dir.as_path(), false))
		.await
		.unwrap();
	x.send_message("xavier", "note to self").await.unwrap();
	let chat = x.load_chat("xavier").unwrap();
	assert_eq!(chat.len(), 1);
	assert_eq!(chat[0].text, "note to self");
	assert!(chat[0].seen);
}

#[tokio::test]
async fn pending_queue_drains_in_order_when_recipient_comes_online() {
	let dir = mktemp::Temp::new_dir().unwrap();
	let x = ChatClient::new("xavier".to_string(), config(&dir.as_path().join("x"), false))
		.await
		.unwrap();

	// The recipient exists but stays silent, so every delivery fails.
	let y_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
	let y_addr = y_sock.local_addr().unwrap();
	x.add_contact("yuki", y_addr);

	x.send_or_queue("yuki", "first").await;
	x.send_or_queue("yuki", "second").await;
	assert_eq!(x.pending_count("yuki"), 2);
	// Nothing is logged as sent until it actually leaves
	assert!(x.load_chat("yuki").unwrap().is_empty());

	let _runner = tokio::spawn(x.clone().run());

	// Bring yuki online: answer presence probes and collect messages.
	let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
	tokio::spawn(async move {
		let mut buf = [0u8; 65536];
		loop {
			let (n, from) = y_sock.recv_from(&mut buf).await.unwrap();
			let text = String::from_utf8_lossy(&buf[..n]).to_string();
			if text.trim() == "PING" {
				y_sock.send_to(b"PONG", from).await.unwrap();
			} else if text.starts_with("MESSAGE") {
				let _ = msg_tx.send(text.trim_end().to_string());
			}
		}
	});

	let first = timeout(Duration::from_secs(10), msg_rx.recv())
		.await
		.expect("first message never delivered")
		.unwrap();
	let second = timeout(Duration::from_secs(10), msg_rx.recv())
		.await
		.expect("second message never delivered")
		.unwrap();
	assert_eq!(first, "MESSAGE xavier first");
	assert_eq!(second, "MESSAGE xavier second");

	{
		let x = x.clone();
		wait_until(move || x.pending_count("yuki") == 0).await;
	}
	assert_eq!(x.load_chat("yuki").unwrap().len(), 2);
	x.shutdown();
}

#[tokio::test]
async fn concurrent_key_exchanges_coalesce_on_one_request() {
	let dir = mktemp::Temp::new_dir().unwrap();
	let x = ChatClient::new("xavier".to_string(), config(&dir.as_path().join("x"), true))
		.await
		.unwrap();

	// A hand-rolled peer that holds yuki's identity and answers the
	// exchange only after both waiters are parked.
	let yuki_keys = CryptoManager::new(&dir.as_path().join("y"), "yuki").unwrap();
	let yuki_key_b64 = yuki_keys.public_key_b64().unwrap();
	let y_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
	let y_addr = y_sock.local_addr().unwrap();
	x.add_contact("yuki", y_addr);

	let _runner = tokio::spawn(x.clone().run());

	let requests = Arc::new(AtomicUsize::new(0));
	let seen = requests.clone();
	tokio::spawn(async move {
		let mut buf = [0u8; 65536];
		loop {
			let (n, from) = y_sock.recv_from(&mut buf).await.unwrap();
			let text = String::from_utf8_lossy(&buf[..n]).to_string();
			if text.starts_with("PUBKEY_REQ") {
				if seen.fetch_add(1, Ordering::SeqCst) == 0 {
					sleep(Duration::from_millis(300)).await;
					let response = format!("PUBKEY_RES yuki {}", yuki_key_b64);
					y_sock.send_to(response.as_bytes(), from).await.unwrap();
				}
			}
		}
	});

	let (a, b) = tokio::join!(
		x.ensure_peer_key("yuki", Duration::from_secs(5)),
		x.ensure_peer_key("yuki", Duration::from_secs(5)),
	);
	assert!(a.unwrap(), "first waiter should complete");
	assert!(b.unwrap(), "second waiter should complete");
	assert!(x.has_peer_key("yuki"));

	sleep(Duration::from_millis(300)).await;
	assert_eq!(
		requests.load(Ordering::SeqCst),
		1,
		"both waiters must share one in-flight PUBKEY_REQ"
	);
	x.shutdown();
}

#[tokio::test]
async fn end_to_end_encrypted_delivery() {
	let dir = mktemp::Temp::new_dir().unwrap();
	let x = ChatClient::new("xavier".to_string(), config(&dir.as_path().join("x"), true))
		.await
		.unwrap();
	let y = ChatClient::new("yuki".to_string(), config(&dir.as_path().join("y"), true))
		.await
		.unwrap();

	let x_addr: SocketAddr = format!("127.0.0.1:{}", x.local_addr().port()).parse().unwrap();
	let y_addr: SocketAddr = format!("127.0.0.1:{}", y.local_addr().port()).parse().unwrap();
	x.add_contact("yuki", y_addr);
	y.add_contact("xavier", x_addr);

	let _x_runner = tokio::spawn(x.clone().run());
	let _y_runner = tokio::spawn(y.clone().run());
	let mut inbox = y.subscribe();

	// The exchange is mutual: our request makes yuki ask back.
	assert!(x
		.ensure_peer_key("yuki", Duration::from_secs(5))
		.await
		.unwrap());
	{
		let y = y.clone();
		wait_until(move || y.has_peer_key("xavier")).await;
	}

	x.send_message("yuki", "the password is swordfish")
		.await
		.unwrap();

	let received = timeout(Duration::from_secs(5), inbox.recv())
		.await
		.expect("message never arrived")
		.unwrap();
	assert_eq!(received.sender, "xavier");
	assert_eq!(received.text, "the password is swordfish");

	assert_eq!(
		y.unread_counts().unwrap(),
		vec![("xavier".to_string(), 1)]
	);
	y.mark_seen("xavier").unwrap();
	assert!(y.unread_counts().unwrap().is_empty());

	x.shutdown();
	y.shutdown();
}
