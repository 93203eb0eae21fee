//! Wire protocol and datagram plumbing shared by Rookery servers and clients.

#[macro_use]
extern crate tracing;

pub mod discovery;
pub mod proto;
pub mod socket;

use std::net::{IpAddr, Ipv4Addr};

/// Well-known UDP port every server answers commands on.
pub const COMMAND_PORT: u16 = 12345;

/// Separate UDP port dedicated to liveness probes, so a node busy with
/// command work still answers PING.
pub const LIVENESS_PORT: u16 = 12346;

/// The address of the first up, non-loopback interface, which is what peers
/// will see as this host's identity on the LAN.
pub fn local_ip() -> IpAddr {
	pnet_datalink::interfaces()
		.iter()
		.find(|e| e.is_up() && !e.is_loopback() && !e.ips.is_empty())
		.and_then(|e| e.ips.first())
		.map(|a| a.ip())
		.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Every address assigned to this host, loopback included. A node may be
/// reached under any of these, not just the one it advertises.
pub fn local_ips() -> Vec<IpAddr> {
	pnet_datalink::interfaces()
		.iter()
		.flat_map(|e| e.ips.iter().map(|a| a.ip()))
		.collect()
}
