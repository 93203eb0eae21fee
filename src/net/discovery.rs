//! LAN discovery: UDP broadcast for peer/server location and a multicast
//! group clients can use as an alternative. Absence of replies is a valid
//! outcome — a node that hears nothing is simply alone.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

use rookery_util::error::Error;

/// Multicast group servers listen on for client discovery.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
pub const MULTICAST_PORT: u16 = 10003;
pub const DISCOVER_SERVER_MSG: &str = "DISCOVER_SERVER";

/// How long a broadcast discovery keeps collecting replies.
pub const DISCOVER_TIMEOUT: Duration = Duration::from_secs(1);

/// Broadcast `message` to the given port and collect every reply that
/// arrives before the deadline.
async fn broadcast_collect(
	message: &str,
	port: u16,
	wait: Duration,
) -> Result<Vec<(String, SocketAddr)>, Error> {
	let sock = UdpSocket::bind(("0.0.0.0", 0)).await?;
	sock.set_broadcast(true)?;
	sock.send_to(message.as_bytes(), (Ipv4Addr::BROADCAST, port))
		.await?;

	let deadline = Instant::now() + wait;
	let mut replies = vec![];
	let mut buf = [0u8; 1024];
	loop {
		let remaining = deadline.saturating_duration_since(Instant::now());
		if remaining.is_zero() {
			break;
		}
		match timeout(remaining, sock.recv_from(&mut buf)).await {
			Ok(Ok((n, addr))) => {
				replies.push((String::from_utf8_lossy(&buf[..n]).trim().to_string(), addr));
			}
			Ok(Err(e)) => return Err(e.into()),
			Err(_) => break,
		}
	}
	Ok(replies)
}

/// `DISCOVER` broadcast: every live server answers with its node name.
pub async fn discover_servers(
	command_port: u16,
	wait: Duration,
) -> Result<Vec<(String, IpAddr)>, Error> {
	let replies = broadcast_collect("DISCOVER", command_port, wait).await?;
	Ok(replies
		.into_iter()
		.map(|(name, addr)| (name, addr.ip()))
		.collect())
}

/// PING broadcast on the liveness port: collects the set of live server IPs,
/// which is the candidate pool for replica placement.
pub async fn ping_sweep(liveness_port: u16, wait: Duration) -> Result<Vec<IpAddr>, Error> {
	let replies = broadcast_collect("PING", liveness_port, wait).await?;
	let mut ips: Vec<IpAddr> = replies.into_iter().map(|(_, addr)| addr.ip()).collect();
	ips.sort();
	ips.dedup();
	Ok(ips)
}

/// Multicast `DISCOVER_SERVER` to the group; servers answer with their IP.
pub async fn multicast_discover(wait: Duration) -> Result<Vec<IpAddr>, Error> {
	let sock = UdpSocket::bind(("0.0.0.0", 0)).await?;
	sock.set_multicast_ttl_v4(1)?;
	sock.send_to(
		DISCOVER_SERVER_MSG.as_bytes(),
		(MULTICAST_GROUP, MULTICAST_PORT),
	)
	.await?;

	let deadline = Instant::now() + wait;
	let mut servers = vec![];
	let mut buf = [0u8; 1024];
	loop {
		let remaining = deadline.saturating_duration_since(Instant::now());
		if remaining.is_zero() {
			break;
		}
		match timeout(remaining, sock.recv_from(&mut buf)).await {
			Ok(Ok((n, _))) => {
				match String::from_utf8_lossy(&buf[..n]).trim().parse::<IpAddr>() {
					Ok(ip) => servers.push(ip),
					Err(_) => debug!("Ignoring malformed multicast discovery reply"),
				}
			}
			Ok(Err(e)) => return Err(e.into()),
			Err(_) => break,
		}
	}
	Ok(servers)
}
