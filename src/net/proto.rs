//! The UTF-8 line protocol spoken over UDP.
//!
//! Server commands and client peer messages are whitespace-separated token
//! lines; the trailing field of a peer message may contain spaces and is
//! parsed with a bounded split. Replies (`OK …`, `ERROR 404 …`) are free
//! text checked by prefix on the caller side.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use rookery_util::error::Error;

/// Where the eventual `OK`/`ERROR` reply of a routed request should go.
///
/// A request straight from a client carries no envelope and is answered at
/// its datagram source; once a node forwards it along the ring the reply
/// address is pinned explicitly so later hops can still answer the
/// originator. `Nobody` (spelled `.` on the wire) marks internal
/// re-registrations that want no reply at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTo {
	Caller,
	Addr(SocketAddr),
	Nobody,
}

impl ReplyTo {
	/// Pin the reply address before forwarding: a caller-relative reply
	/// becomes the explicit address of the original requester.
	pub fn pinned(self, caller: SocketAddr) -> ReplyTo {
		match self {
			ReplyTo::Caller => ReplyTo::Addr(caller),
			other => other,
		}
	}
}

/// A command received on a server's command port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	Discover,
	Range,
	Join,
	PredChange {
		predecessor: IpAddr,
	},
	Register {
		reply: ReplyTo,
		username: String,
		ip: IpAddr,
		port: u16,
	},
	Resolve {
		reply: ReplyTo,
		username: String,
	},
	Succ {
		chain: Vec<IpAddr>,
	},
	Fix,
	Replic {
		username: String,
		ip: IpAddr,
		port: u16,
	},
	DropReplics {
		owner: IpAddr,
	},
	Kill,
}

impl Command {
	pub fn parse(line: &str) -> Result<Command, Error> {
		let tokens: Vec<&str> = line.split_whitespace().collect();
		let (verb, args) = tokens
			.split_first()
			.ok_or_else(|| Error::Wire("empty datagram".into()))?;

		match (*verb, args.len()) {
			("DISCOVER", 0) => Ok(Command::Discover),
			("RANGE", 0) => Ok(Command::Range),
			("JOIN", 0) => Ok(Command::Join),
			("FIX", 0) => Ok(Command::Fix),
			("KILL", 0) => Ok(Command::Kill),
			("PRED_CHANGE", 1) => Ok(Command::PredChange {
				predecessor: args[0].parse()?,
			}),
			("REGISTER", 3) => Ok(Command::Register {
				reply: ReplyTo::Caller,
				username: args[0].to_string(),
				ip: args[1].parse()?,
				port: args[2].parse()?,
			}),
			("REGISTER", 5) => Ok(Command::Register {
				reply: parse_reply(args[0], args[1])?,
				username: args[2].to_string(),
				ip: args[3].parse()?,
				port: args[4].parse()?,
			}),
			("RESOLVE", 1) => Ok(Command::Resolve {
				reply: ReplyTo::Caller,
				username: args[0].to_string(),
			}),
			("RESOLVE", 3) => Ok(Command::Resolve {
				reply: parse_reply(args[0], args[1])?,
				username: args[2].to_string(),
			}),
			("SUCC", n) if n >= 1 => {
				let mut chain = Vec::with_capacity(n);
				for a in args {
					chain.push(a.parse()?);
				}
				Ok(Command::Succ { chain })
			}
			("REPLIC", 3) => Ok(Command::Replic {
				username: args[0].to_string(),
				ip: args[1].parse()?,
				port: args[2].parse()?,
			}),
			("DROP_REPLICS", 1) => Ok(Command::DropReplics {
				owner: args[0].parse()?,
			}),
			_ => Err(Error::Wire(format!("unhandled command: {}", line.trim()))),
		}
	}
}

fn parse_reply(ip: &str, port: &str) -> Result<ReplyTo, Error> {
	if ip == "." {
		Ok(ReplyTo::Nobody)
	} else {
		Ok(ReplyTo::Addr(SocketAddr::new(ip.parse()?, port.parse()?)))
	}
}

fn fmt_reply(f: &mut fmt::Formatter<'_>, reply: &ReplyTo) -> fmt::Result {
	match reply {
		ReplyTo::Caller => Ok(()),
		ReplyTo::Addr(a) => write!(f, "{} {} ", a.ip(), a.port()),
		ReplyTo::Nobody => write!(f, ". . "),
	}
}

impl fmt::Display for Command {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Command::Discover => write!(f, "DISCOVER"),
			Command::Range => write!(f, "RANGE"),
			Command::Join => write!(f, "JOIN"),
			Command::Fix => write!(f, "FIX"),
			Command::Kill => write!(f, "KILL"),
			Command::PredChange { predecessor } => write!(f, "PRED_CHANGE {}", predecessor),
			Command::Register {
				reply,
				username,
				ip,
				port,
			} => {
				write!(f, "REGISTER ")?;
				fmt_reply(f, reply)?;
				write!(f, "{} {} {}", username, ip, port)
			}
			Command::Resolve { reply, username } => {
				write!(f, "RESOLVE ")?;
				fmt_reply(f, reply)?;
				write!(f, "{}", username)
			}
			Command::Succ { chain } => {
				write!(f, "SUCC")?;
				for ip in chain {
					write!(f, " {}", ip)?;
				}
				Ok(())
			}
			Command::Replic { username, ip, port } => {
				write!(f, "REPLIC {} {} {}", username, ip, port)
			}
			Command::DropReplics { owner } => write!(f, "DROP_REPLICS {}", owner),
		}
	}
}

/// A message on a client's peer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMsg {
	Message { sender: String, payload: String },
	Ping,
	Pong,
	PubkeyReq { requester: String },
	PubkeyRes { peer: String, key_b64: String },
}

impl PeerMsg {
	pub fn parse(line: &str) -> Result<PeerMsg, Error> {
		let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
		match line {
			"PING" => return Ok(PeerMsg::Ping),
			"PONG" => return Ok(PeerMsg::Pong),
			_ => {}
		}
		let mut parts = line.splitn(3, ' ');
		let verb = parts
			.next()
			.ok_or_else(|| Error::Wire("empty datagram".into()))?;
		match verb {
			"MESSAGE" => {
				let sender = parts
					.next()
					.ok_or_else(|| Error::Wire("MESSAGE without sender".into()))?;
				let payload = parts.next().unwrap_or("");
				Ok(PeerMsg::Message {
					sender: sender.to_string(),
					payload: payload.to_string(),
				})
			}
			"PUBKEY_REQ" => {
				let requester = parts
					.next()
					.ok_or_else(|| Error::Wire("PUBKEY_REQ without requester".into()))?;
				Ok(PeerMsg::PubkeyReq {
					requester: requester.to_string(),
				})
			}
			"PUBKEY_RES" => {
				let peer = parts
					.next()
					.ok_or_else(|| Error::Wire("PUBKEY_RES without peer".into()))?;
				let key_b64 = parts
					.next()
					.ok_or_else(|| Error::Wire("PUBKEY_RES without key".into()))?;
				Ok(PeerMsg::PubkeyRes {
					peer: peer.to_string(),
					key_b64: key_b64.to_string(),
				})
			}
			_ => Err(Error::Wire(format!("unhandled peer message: {}", line))),
		}
	}
}

impl fmt::Display for PeerMsg {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PeerMsg::Message { sender, payload } => write!(f, "MESSAGE {} {}", sender, payload),
			PeerMsg::Ping => write!(f, "PING"),
			PeerMsg::Pong => write!(f, "PONG"),
			PeerMsg::PubkeyReq { requester } => write!(f, "PUBKEY_REQ {}", requester),
			PeerMsg::PubkeyRes { peer, key_b64 } => {
				write!(f, "PUBKEY_RES {} {}", peer, key_b64)
			}
		}
	}
}
