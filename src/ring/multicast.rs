//! Multicast discovery listener: clients that cannot broadcast can find a
//! server by asking the multicast group instead.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::watch;

use rookery_net::discovery::{DISCOVER_SERVER_MSG, MULTICAST_GROUP};

use crate::node::DirectoryNode;

impl DirectoryNode {
	pub(crate) async fn multicast_loop(self: &Arc<Self>, mut must_exit: watch::Receiver<bool>) {
		let sock = match UdpSocket::bind(("0.0.0.0", self.config.multicast_port)).await {
			Ok(s) => s,
			Err(e) => {
				warn!("Multicast listener disabled, cannot bind: {}", e);
				return;
			}
		};
		if let Err(e) = sock.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED) {
			warn!("Multicast listener disabled, cannot join group: {}", e);
			return;
		}
		info!(
			"Multicast listener on {}:{}",
			MULTICAST_GROUP, self.config.multicast_port
		);

		let mut buf = [0u8; 1024];
		while !*must_exit.borrow() {
			select! {
				res = sock.recv_from(&mut buf) => match res {
					Ok((n, from)) => {
						let message = String::from_utf8_lossy(&buf[..n]).trim().to_string();
						if message.starts_with(DISCOVER_SERVER_MSG) {
							let target = parse_reply_target(&message).unwrap_or(from);
							debug!("Multicast discovery from {}, answering {}", from, target);
							let _ = sock.send_to(self.ip.to_string().as_bytes(), target).await;
						}
					}
					Err(e) => {
						warn!("Multicast receive error: {}", e);
					}
				},
				_ = must_exit.changed() => {},
			}
		}
	}
}

/// Some clients ask with `DISCOVER_SERVER:<ip>:<port>` to get the answer on
/// a different socket than the one that sent the query.
fn parse_reply_target(message: &str) -> Option<SocketAddr> {
	let mut parts = message.split(':');
	let _verb = parts.next()?;
	let ip = parts.next()?.parse().ok()?;
	let port = parts.next()?.parse().ok()?;
	Some(SocketAddr::new(ip, port))
}
