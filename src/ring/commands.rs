//! The command responder: one receive loop on the command port, dispatching
//! to the ring membership and directory routing handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::select;
use tokio::sync::watch;

use rookery_net::proto::{Command, ReplyTo};
use rookery_net::socket;
use rookery_util::error::Error;
use rookery_util::keyspace::key_hash;

use crate::node::DirectoryNode;
use crate::ring::Route;

impl DirectoryNode {
	pub(crate) async fn command_loop(self: &Arc<Self>, mut must_exit: watch::Receiver<bool>) {
		info!("Listening for commands on port {}", self.config.command_port);
		while !*must_exit.borrow() {
			select! {
				res = socket::recv_text(&self.command_socket) => match res {
					Ok((line, from)) => {
						let line = line.trim();
						match Command::parse(line) {
							Ok(cmd) => {
								self.log_command(&cmd, from, line);
								if let Err(e) = self.handle_command(cmd, from).await {
									error!("Error handling command from {}: {}", from, e);
								}
							}
							// A misparsed datagram is dropped, never fatal
							Err(e) => debug!("Ignoring datagram from {}: {}", from, e),
						}
					}
					Err(e) => error!("Command socket receive error: {}", e),
				},
				_ = must_exit.changed() => {},
			}
		}
	}

	fn log_command(&self, cmd: &Command, from: SocketAddr, line: &str) {
		match cmd {
			// Periodic chatter stays out of the info log
			Command::Succ { .. } | Command::Replic { .. } => {
				debug!("Command from {}: {}", from, line)
			}
			_ => info!("Command from {}: {}", from, line),
		}
	}

	async fn handle_command(
		self: &Arc<Self>,
		cmd: Command,
		from: SocketAddr,
	) -> Result<(), Error> {
		match cmd {
			Command::Discover => {
				self.command_socket
					.send_to(self.name.as_bytes(), from)
					.await?;
			}
			Command::Range => {
				let st = self.ring_state();
				let reply = format!("OK {} {}", st.range.lower, st.range.upper);
				self.command_socket.send_to(reply.as_bytes(), from).await?;
			}
			Command::Join => {
				self.handle_join(from).await?;
				self.log_status();
			}
			Command::PredChange { predecessor } => {
				self.mutate_ring(|st| st.predecessor = Some(predecessor)).await;
				self.log_status();
			}
			Command::Register {
				reply,
				username,
				ip,
				port,
			} => {
				self.route_register(reply.pinned(from), &username, ip, port)
					.await?;
			}
			Command::Resolve { reply, username } => {
				self.route_resolve(reply.pinned(from), &username).await?;
			}
			Command::Succ { chain } => {
				self.handle_succ(&chain).await?;
			}
			Command::Fix => {
				tokio::spawn(self.clone().run_crisis());
			}
			Command::Replic { username, ip, port } => {
				if !self.ring_state().replicants.contains(&from.ip()) {
					self.mutate_ring(|st| {
						st.add_replicant(from.ip());
					})
					.await;
				}
				self.store.upsert_replica(
					&rookery_db::directory::UserEntry {
						username: username.clone(),
						ip,
						port,
					},
					from.ip(),
				)?;
				debug!("Registered replic user '{}' from {}", username, from.ip());
			}
			Command::DropReplics { owner } => {
				let dropped = self.store.drop_replicas(owner)?;
				self.mutate_ring(|st| st.replicants.retain(|r| *r != owner))
					.await;
				info!("Dropped {} replica rows owned by {}", dropped, owner);
			}
			Command::Kill => {
				info!("KILL received, shutting down");
				self.shutdown();
			}
		}
		Ok(())
	}

	/// Hand the upper half of our range to the joiner and splice it in
	/// between us and our old successor.
	async fn handle_join(&self, joiner: SocketAddr) -> Result<(), Error> {
		if self.in_crisis() {
			self.command_socket
				.send_to(b"ERROR 503 ring repair in progress", joiner)
				.await?;
			return Ok(());
		}

		let st = self.ring_state();
		let (kept, ceded) = st.range.split_upper_half();
		let old_successor = st.successor;

		// The old successor's predecessor pointer moves to the joiner.
		// Best-effort: the detector heals a lost notification.
		if let Some(succ) = old_successor {
			let msg = format!("PRED_CHANGE {}", joiner.ip());
			let _ = self
				.command_socket
				.send_to(msg.as_bytes(), self.command_addr(succ))
				.await;
		}

		let successor_field = match old_successor {
			Some(ip) => ip.to_string(),
			None => "_".to_string(),
		};
		let reply = format!(
			"OK {} {} {} {}",
			ceded.lower, ceded.upper, self.ip, successor_field
		);
		self.command_socket.send_to(reply.as_bytes(), joiner).await?;

		self.mutate_ring(|st| {
			st.range = kept;
			st.successor = Some(joiner.ip());
		})
		.await;
		info!(
			"Node {} joined: ceded range {}, keeping {}",
			joiner.ip(),
			ceded,
			kept
		);
		Ok(())
	}

	/// Keep our backup prefix and extend the walk upstream.
	async fn handle_succ(&self, chain: &[std::net::IpAddr]) -> Result<(), Error> {
		self.mutate_ring(|st| st.set_backup_successors(chain)).await;

		let st = self.ring_state();
		if let Some(pred) = st.predecessor {
			let mut msg = format!("SUCC {}", self.ip);
			for ip in chain {
				msg.push(' ');
				msg.push_str(&ip.to_string());
			}
			let _ = self
				.command_socket
				.send_to(msg.as_bytes(), self.command_addr(pred))
				.await;
		}
		Ok(())
	}

	/// Route a REGISTER along the ring. Returns whether the request was
	/// either persisted locally or handed to a neighbor.
	pub(crate) async fn route_register(
		&self,
		reply: ReplyTo,
		username: &str,
		ip: std::net::IpAddr,
		port: u16,
	) -> Result<bool, Error> {
		let st = self.ring_state();
		match st.route(key_hash(username)) {
			Route::ToPredecessor => {
				self.forward(
					st.predecessor,
					"predecessor",
					Command::Register {
						reply,
						username: username.to_string(),
						ip,
						port,
					},
				)
				.await
			}
			Route::ToSuccessor => {
				self.forward(
					st.successor,
					"successor",
					Command::Register {
						reply,
						username: username.to_string(),
						ip,
						port,
					},
				)
				.await
			}
			Route::Local => {
				self.store.upsert_user(username, ip, port)?;
				let response =
					format!("OK User '{}' at ({}:{}) registered", username, ip, port);
				info!("{}", response);
				if let ReplyTo::Addr(a) = reply {
					let _ = self.command_socket.send_to(response.as_bytes(), a).await;
				}
				for replic in &st.replics {
					let msg = Command::Replic {
						username: username.to_string(),
						ip,
						port,
					}
					.to_string();
					let _ = self
						.command_socket
						.send_to(msg.as_bytes(), self.command_addr(*replic))
						.await;
				}
				Ok(true)
			}
		}
	}

	/// Route a RESOLVE along the ring; the owner answers the reply address.
	pub(crate) async fn route_resolve(
		&self,
		reply: ReplyTo,
		username: &str,
	) -> Result<bool, Error> {
		let st = self.ring_state();
		match st.route(key_hash(username)) {
			Route::ToPredecessor => {
				self.forward(
					st.predecessor,
					"predecessor",
					Command::Resolve {
						reply,
						username: username.to_string(),
					},
				)
				.await
			}
			Route::ToSuccessor => {
				self.forward(
					st.successor,
					"successor",
					Command::Resolve {
						reply,
						username: username.to_string(),
					},
				)
				.await
			}
			Route::Local => {
				let response = match self.store.resolve_user(username)? {
					Some((ip, port)) => {
						info!("Resolved address of user '{}', ({}:{})", username, ip, port);
						format!("OK {} {}", ip, port)
					}
					None => {
						warn!("User not found during RESOLVE: {}", username);
						"ERROR 404 User not found".to_string()
					}
				};
				if let ReplyTo::Addr(a) = reply {
					let _ = self.command_socket.send_to(response.as_bytes(), a).await;
				}
				Ok(true)
			}
		}
	}

	async fn forward(
		&self,
		neighbor: Option<std::net::IpAddr>,
		side: &str,
		cmd: Command,
	) -> Result<bool, Error> {
		match neighbor {
			Some(ip) => {
				self.command_socket
					.send_to(cmd.to_string().as_bytes(), self.command_addr(ip))
					.await?;
				debug!("Forwarded {} to {} {}", cmd, side, ip);
				Ok(true)
			}
			None => {
				warn!("Cannot forward {}: no {}", cmd, side);
				Ok(false)
			}
		}
	}
}
