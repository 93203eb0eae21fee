//! Shard replication: keep `FAULT_TOLERANCE + 1` copies of the local shard
//! on other nodes, and absorb the shards of replicants that disappear.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::select;
use tokio::sync::watch;

use rookery_net::proto::{Command, ReplyTo};
use rookery_net::socket::{self, PROBE_TIMEOUT};
use rookery_net::discovery;
use rookery_util::error::Error;
use rookery_util::keyspace::key_hash;

use crate::node::DirectoryNode;
use crate::FAULT_TOLERANCE;

const REPLICATION_INTERVAL: Duration = Duration::from_secs(1);

impl DirectoryNode {
	/// Once a second, outside crisis: drop dead replics and top the set back
	/// up to `FAULT_TOLERANCE + 1`, pushing the full shard to newcomers.
	pub(crate) async fn replication_loop(
		self: &Arc<Self>,
		mut must_exit: watch::Receiver<bool>,
	) {
		while !*must_exit.borrow() {
			if !self.in_crisis() {
				if let Err(e) = self.replication_tick().await {
					warn!("Replication tick failed: {}", e);
				}
			}
			select! {
				_ = tokio::time::sleep(REPLICATION_INTERVAL) => {},
				_ = must_exit.changed() => {},
			}
		}
	}

	async fn replication_tick(&self) -> Result<(), Error> {
		let st = self.ring_state();
		let mut replics = st.replics.clone();

		let mut dead = vec![];
		for replic in &replics {
			if !socket::probe(self.liveness_addr(*replic), PROBE_TIMEOUT).await {
				dead.push(*replic);
			}
		}
		for d in &dead {
			replics.retain(|r| r != d);
			// best-effort: a recovered replic sheds our stale rows
			let msg = format!("DROP_REPLICS {}", self.ip);
			let _ = socket::send_oneshot(self.command_addr(*d), &msg).await;
			info!("Replic {} is dead, dropping it", d);
		}

		let needed = (FAULT_TOLERANCE + 1).saturating_sub(replics.len());
		if needed > 0 {
			let new_replics = self.find_new_replics(needed, &replics).await?;
			if !new_replics.is_empty() {
				info!("New replics: {:?}", new_replics);
				let users = self.store.all_users()?;
				for replic in &new_replics {
					for user in &users {
						let msg = Command::Replic {
							username: user.username.clone(),
							ip: user.ip,
							port: user.port,
						}
						.to_string();
						let _ = self
							.command_socket
							.send_to(msg.as_bytes(), self.command_addr(*replic))
							.await;
					}
				}
				replics.extend(new_replics);
			}
		}

		if replics != st.replics {
			self.mutate_ring(|st| st.replics = replics).await;
		}
		Ok(())
	}

	/// Uniform random sample of live LAN peers, excluding ourselves and the
	/// replics we already have.
	async fn find_new_replics(
		&self,
		needed: usize,
		current: &[IpAddr],
	) -> Result<Vec<IpAddr>, Error> {
		let mut candidates =
			discovery::ping_sweep(self.config.liveness_port, PROBE_TIMEOUT).await?;
		// A broadcast reply can carry any of our own interface addresses
		let local = rookery_net::local_ips();
		candidates
			.retain(|ip| *ip != self.ip && !local.contains(ip) && !current.contains(ip));

		let take = needed.min(candidates.len());
		let picked = {
			let mut rng = rand::thread_rng();
			candidates
				.choose_multiple(&mut rng, take)
				.cloned()
				.collect()
		};
		Ok(picked)
	}

	/// Crisis step: every replicant that no longer answers probes gets its
	/// rows re-registered through our own routing (no reply expected), so
	/// each row lands at the current owner of its hash.
	pub(crate) async fn assimilate_dead_replicants(&self) {
		let st = self.ring_state();
		for replicant in st.replicants.clone() {
			if socket::probe(self.liveness_addr(replicant), PROBE_TIMEOUT).await {
				continue;
			}
			let rows = match self.store.replicas_of(replicant) {
				Ok(rows) => rows,
				Err(e) => {
					error!("Cannot read replica rows of {}: {}", replicant, e);
					continue;
				}
			};
			for user in &rows {
				if let Err(e) = self
					.route_register(ReplyTo::Nobody, &user.username, user.ip, user.port)
					.await
				{
					error!("Re-registration of '{}' failed: {}", user.username, e);
				}
			}
			if let Err(e) = self.store.drop_replicas(replicant) {
				error!("Cannot drop replica rows of {}: {}", replicant, e);
			}
			self.mutate_ring(|st| st.replicants.retain(|r| *r != replicant))
				.await;
			info!(
				"Assimilated {} rows from dead replicant {}",
				rows.len(),
				replicant
			);
		}
	}

	/// Crisis step: rows whose hash fell outside our range after a repair
	/// are re-routed to their owner and removed here.
	pub(crate) async fn correct_shard(&self) {
		let st = self.ring_state();
		let aliens = match self
			.store
			.users_outside(st.range.lower, st.range.upper, key_hash)
		{
			Ok(aliens) => aliens,
			Err(e) => {
				error!("Shard correction query failed: {}", e);
				return;
			}
		};
		for user in aliens {
			match self
				.route_register(ReplyTo::Nobody, &user.username, user.ip, user.port)
				.await
			{
				Ok(true) => {
					if let Err(e) = self.store.delete_user(&user.username) {
						error!("Cannot delete corrected row '{}': {}", user.username, e);
					} else {
						info!("Moved '{}' to its owner", user.username);
					}
				}
				// no neighbor to take it: the row stays here
				Ok(false) => {}
				Err(e) => error!("Shard correction of '{}' failed: {}", user.username, e),
			}
		}
	}
}
