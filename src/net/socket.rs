//! Datagram request/reply helpers.
//!
//! Everything here speaks one-shot UDP: a response is complete when a chunk
//! ends in `\r\n` or is shorter than the read buffer, and every wait carries
//! an explicit deadline.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use rookery_util::error::Error;

/// Largest chunk read in one `recv_from`.
pub const MAX_CHUNK: usize = 8192;

/// Liveness probes answer within this or the peer is considered down.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Receive one framed text response and the address it came from.
pub async fn recv_text(sock: &UdpSocket) -> Result<(String, SocketAddr), Error> {
	let mut buf = [0u8; MAX_CHUNK];
	let (mut n, from) = sock.recv_from(&mut buf).await?;
	let mut text = String::from_utf8_lossy(&buf[..n]).into_owned();
	while n == MAX_CHUNK && !text.ends_with("\r\n") {
		let (more, _) = sock.recv_from(&mut buf).await?;
		n = more;
		text.push_str(&String::from_utf8_lossy(&buf[..n]));
	}
	Ok((text, from))
}

/// Send `request` on `sock` and wait for one framed reply.
pub async fn exchange(
	sock: &UdpSocket,
	addr: SocketAddr,
	request: &str,
	deadline: Duration,
) -> Result<String, Error> {
	sock.send_to(request.as_bytes(), addr).await?;
	let (reply, _) = timeout(deadline, recv_text(sock)).await??;
	Ok(reply.trim_end().to_string())
}

/// One request, one reply, over a fresh ephemeral socket. Used whenever the
/// caller's own bound socket is busy feeding a receive loop.
pub async fn query(addr: SocketAddr, request: &str, deadline: Duration) -> Result<String, Error> {
	let sock = UdpSocket::bind(("0.0.0.0", 0)).await?;
	exchange(&sock, addr, request, deadline).await
}

/// Fire-and-forget datagram from an ephemeral socket.
pub async fn send_oneshot(addr: SocketAddr, message: &str) -> Result<(), Error> {
	let sock = UdpSocket::bind(("0.0.0.0", 0)).await?;
	sock.send_to(message.as_bytes(), addr).await?;
	Ok(())
}

/// PING the given address and wait for PONG.
pub async fn probe(addr: SocketAddr, deadline: Duration) -> bool {
	matches!(query(addr, "PING", deadline).await, Ok(ref r) if r == "PONG")
}
