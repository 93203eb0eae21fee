//! The client node: registers with the directory ring, resolves peers and
//! exchanges messages with them directly over UDP.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::join;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

use rookery_db::chatlog::{ChatLog, StoredMessage};
use rookery_net::proto::PeerMsg;
use rookery_net::{discovery, socket};
use rookery_util::error::{Error, OkOrMessage};

use crate::crypto::CryptoManager;

/// Deadline for request/reply exchanges with the directory server.
const SERVER_TIMEOUT: Duration = Duration::from_secs(3);
/// Deadline for the PING presence check before a direct send.
const PRESENCE_TIMEOUT: Duration = Duration::from_millis(500);
/// Default deadline of a key exchange.
pub const KEY_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);
/// Interval of the pending-delivery retry loop.
const PENDING_INTERVAL: Duration = Duration::from_secs(1);
/// Interval of the server-reconnect loop.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(3);
/// How long multicast discovery waits when broadcast finds nothing.
const MULTICAST_TIMEOUT: Duration = Duration::from_secs(3);

pub struct ClientConfig {
	/// Command port of the directory servers.
	pub command_port: u16,
	/// Base directory for the chat log (`chats/`) and keys (`keys/`).
	pub data_dir: PathBuf,
	/// Disable to run without end-to-end encryption (messages go out as
	/// plaintext and a warning is logged).
	pub enable_crypto: bool,
}

impl Default for ClientConfig {
	fn default() -> Self {
		ClientConfig {
			command_port: rookery_net::COMMAND_PORT,
			data_dir: PathBuf::from("client"),
			enable_crypto: true,
		}
	}
}

#[derive(Debug, Clone)]
pub struct ServerInfo {
	pub name: String,
	pub addr: SocketAddr,
}

/// What the UI sink receives for every incoming message.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
	pub sender: String,
	pub text: String,
}

pub struct ChatClient {
	pub username: String,
	config: ClientConfig,

	message_socket: Arc<UdpSocket>,
	local_addr: SocketAddr,

	server: ArcSwapOption<ServerInfo>,
	server_down: AtomicBool,

	contacts: Mutex<HashMap<String, SocketAddr>>,
	pending: Mutex<HashMap<String, VecDeque<String>>>,
	key_exchanges: Mutex<HashMap<String, watch::Sender<bool>>>,

	crypto: Option<CryptoManager>,
	log: ChatLog,

	incoming: broadcast::Sender<IncomingMessage>,
	stop: watch::Sender<bool>,
}

impl ChatClient {
	/// Bind the peer socket, open the chat log and load (or create) the
	/// local keypair.
	pub async fn new(username: String, config: ClientConfig) -> Result<Arc<Self>, Error> {
		let message_socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
		let port = message_socket.local_addr()?.port();
		let local_addr = SocketAddr::new(rookery_net::local_ip(), port);

		let log = ChatLog::open(&config.data_dir.join("chats"), &username)?;
		let crypto = if config.enable_crypto {
			match CryptoManager::new(&config.data_dir.join("keys"), &username) {
				Ok(c) => Some(c),
				Err(e) => {
					warn!("Crypto not available: {}", e);
					None
				}
			}
		} else {
			None
		};

		let (incoming, _) = broadcast::channel(64);
		let (stop, _) = watch::channel(false);

		Ok(Arc::new(ChatClient {
			username,
			config,
			message_socket: Arc::new(message_socket),
			local_addr,
			server: ArcSwapOption::from(None),
			server_down: AtomicBool::new(false),
			contacts: Mutex::new(HashMap::new()),
			pending: Mutex::new(HashMap::new()),
			key_exchanges: Mutex::new(HashMap::new()),
			crypto,
			log,
			incoming,
			stop,
		}))
	}

	/// Run the peer listener, the pending-delivery loop and the
	/// server-reconnect loop until `shutdown`.
	pub async fn run(self: Arc<Self>) {
		let must_exit = self.stop.subscribe();
		join!(
			self.peer_listener(must_exit.clone()),
			self.pending_loop(must_exit.clone()),
			self.reconnect_loop(must_exit.clone()),
		);
	}

	pub fn shutdown(&self) {
		let _ = self.stop.send(true);
	}

	/// The endpoint other clients reach us on.
	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// New-message notifications for whatever presentation layer is driving
	/// this client.
	pub fn subscribe(&self) -> broadcast::Receiver<IncomingMessage> {
		self.incoming.subscribe()
	}

	// ---- Directory server interaction ----

	/// Locate a directory server on the LAN, preferring broadcast and
	/// falling back to the multicast group.
	pub async fn connect(&self) -> Result<ServerInfo, Error> {
		let mut servers =
			discovery::discover_servers(self.config.command_port, discovery::DISCOVER_TIMEOUT)
				.await
				.unwrap_or_else(|e| {
					warn!("Broadcast discovery failed: {}", e);
					vec![]
				});
		if servers.is_empty() {
			servers = discovery::multicast_discover(MULTICAST_TIMEOUT)
				.await
				.unwrap_or_default()
				.into_iter()
				.map(|ip| (ip.to_string(), ip))
				.collect();
		}
		let (name, ip) = servers
			.into_iter()
			.next()
			.ok_or_message("No directory server answered discovery")?;
		let info = ServerInfo {
			name,
			addr: SocketAddr::new(ip, self.config.command_port),
		};
		self.use_server(info.clone());
		Ok(info)
	}

	/// Point the client at a specific directory server.
	pub fn use_server(&self, info: ServerInfo) {
		info!("Using directory server '{}' at {}", info.name, info.addr);
		self.server.store(Some(Arc::new(info)));
		self.server_down.store(false, Ordering::SeqCst);
	}

	async fn send_command(&self, command: &str) -> Result<String, Error> {
		let server = self
			.server
			.load_full()
			.ok_or_message("Not connected to any directory server")?;
		match socket::query(server.addr, command, SERVER_TIMEOUT).await {
			Ok(reply) => Ok(reply),
			Err(e) => {
				self.server_down.store(true, Ordering::SeqCst);
				Err(e)
			}
		}
	}

	/// Register our peer endpoint under our username.
	pub async fn register(&self) -> Result<(), Error> {
		let command = format!(
			"REGISTER {} {} {}",
			self.username,
			self.local_addr.ip(),
			self.local_addr.port()
		);
		let reply = self.send_command(&command).await?;
		if reply.starts_with("OK") {
			info!("Registered as '{}' at {}", self.username, self.local_addr);
			Ok(())
		} else {
			Err(Error::Message(format!("Registration failed: {}", reply)))
		}
	}

	/// Resolve a username through the ring. `Ok(None)` means the directory
	/// does not know the user.
	pub async fn resolve(&self, username: &str) -> Result<Option<SocketAddr>, Error> {
		let reply = self.send_command(&format!("RESOLVE {}", username)).await?;
		if reply.starts_with("ERROR 404") {
			return Ok(None);
		}
		let tokens: Vec<&str> = reply.split_whitespace().collect();
		match tokens.as_slice() {
			["OK", ip, port] => {
				let addr = SocketAddr::new(ip.parse()?, port.parse()?);
				self.add_contact(username, addr);
				Ok(Some(addr))
			}
			_ => Err(Error::Wire(format!("bad RESOLVE reply: {}", reply))),
		}
	}

	/// Cache a peer endpoint directly, bypassing the directory.
	pub fn add_contact(&self, username: &str, addr: SocketAddr) {
		self.contacts
			.lock()
			.unwrap()
			.insert(username.to_string(), addr);
	}

	async fn lookup(&self, username: &str) -> Result<Option<SocketAddr>, Error> {
		let cached = self.contacts.lock().unwrap().get(username).copied();
		match cached {
			Some(addr) => Ok(Some(addr)),
			None => self.resolve(username).await,
		}
	}

	// ---- Direct messaging ----

	/// Send `text` to `recipient` right now; fails if the recipient cannot
	/// be resolved or is offline.
	pub async fn send_message(&self, recipient: &str, text: &str) -> Result<(), Error> {
		if recipient == self.username {
			self.log
				.insert_message(&self.username, recipient, text, true)?;
			return Ok(());
		}
		self.try_deliver(recipient, text).await
	}

	/// Send, or queue for the retry loop when delivery fails.
	pub async fn send_or_queue(&self, recipient: &str, text: &str) {
		if let Err(e) = self.send_message(recipient, text).await {
			debug!("Delivery to '{}' failed ({}), queueing", recipient, e);
			self.pending
				.lock()
				.unwrap()
				.entry(recipient.to_string())
				.or_insert_with(VecDeque::new)
				.push_back(text.to_string());
		}
	}

	pub fn pending_count(&self, recipient: &str) -> usize {
		self.pending
			.lock()
			.unwrap()
			.get(recipient)
			.map(|q| q.len())
			.unwrap_or(0)
	}

	async fn try_deliver(&self, recipient: &str, text: &str) -> Result<(), Error> {
		let addr = self
			.lookup(recipient)
			.await?
			.ok_or_else(|| Error::Message(format!("Cannot resolve user '{}'", recipient)))?;

		if let Some(crypto) = &self.crypto {
			if !crypto.has_peer_key(recipient) {
				let _ = self.ensure_peer_key(recipient, KEY_EXCHANGE_TIMEOUT).await;
			}
		}
		let payload = match &self.crypto {
			Some(c) if c.has_peer_key(recipient) => c.encrypt_to(recipient, text)?,
			_ => {
				warn!("No key for '{}', sending plaintext", recipient);
				text.to_string()
			}
		};

		// Presence check; a stale cache entry gets one re-resolve.
		let addr = if socket::probe(addr, PRESENCE_TIMEOUT).await {
			addr
		} else {
			match self.resolve(recipient).await? {
				Some(fresh) if socket::probe(fresh, PRESENCE_TIMEOUT).await => fresh,
				_ => {
					return Err(Error::Message(format!(
						"User '{}' is not reachable",
						recipient
					)))
				}
			}
		};

		self.log
			.insert_message(&self.username, recipient, text, true)?;
		let wire = format!(
			"{}\r\n",
			PeerMsg::Message {
				sender: self.username.clone(),
				payload,
			}
		);
		self.message_socket.send_to(wire.as_bytes(), addr).await?;
		Ok(())
	}

	// ---- Key exchange ----

	pub fn has_peer_key(&self, peer: &str) -> bool {
		self.crypto
			.as_ref()
			.map(|c| c.has_peer_key(peer))
			.unwrap_or(false)
	}

	/// Make sure we hold `recipient`'s public key, requesting it over the
	/// peer channel if needed. Concurrent calls for the same peer coalesce
	/// on a single in-flight PUBKEY_REQ.
	pub async fn ensure_peer_key(&self, recipient: &str, wait: Duration) -> Result<bool, Error> {
		let crypto = match &self.crypto {
			Some(c) => c,
			None => return Ok(true),
		};
		if crypto.has_peer_key(recipient) {
			return Ok(true);
		}
		let addr = match self.lookup(recipient).await? {
			Some(a) => a,
			None => return Ok(false),
		};

		let (mut done, initiated) = {
			let mut exchanges = self.key_exchanges.lock().unwrap();
			match exchanges.get(recipient) {
				Some(tx) => (tx.subscribe(), false),
				None => {
					let (tx, rx) = watch::channel(false);
					exchanges.insert(recipient.to_string(), tx);
					(rx, true)
				}
			}
		};

		if initiated {
			let request = PeerMsg::PubkeyReq {
				requester: self.username.clone(),
			}
			.to_string();
			self.message_socket.send_to(request.as_bytes(), addr).await?;
		}

		let completed = matches!(timeout(wait, done.wait_for(|d| *d)).await, Ok(Ok(_)));
		if initiated && !completed {
			self.key_exchanges.lock().unwrap().remove(recipient);
		}
		Ok(completed)
	}

	// ---- Background loops ----

	async fn peer_listener(self: &Arc<Self>, mut must_exit: watch::Receiver<bool>) {
		debug!("Peer channel listening on {}", self.local_addr);
		while !*must_exit.borrow() {
			select! {
				res = socket::recv_text(&self.message_socket) => match res {
					Ok((line, from)) => match PeerMsg::parse(line.trim()) {
						Ok(msg) => {
							if let Err(e) = self.handle_peer_msg(msg, from).await {
								error!("Error handling peer message from {}: {}", from, e);
							}
						}
						Err(e) => debug!("Ignoring datagram from {}: {}", from, e),
					},
					Err(e) => debug!("Peer socket receive error: {}", e),
				},
				_ = must_exit.changed() => {},
			}
		}
	}

	async fn handle_peer_msg(&self, msg: PeerMsg, from: SocketAddr) -> Result<(), Error> {
		match msg {
			PeerMsg::Ping => {
				self.message_socket.send_to(b"PONG", from).await?;
			}
			PeerMsg::Pong => {}
			PeerMsg::Message { sender, payload } => {
				let text = match &self.crypto {
					Some(c) if c.has_peer_key(&sender) => match c.decrypt(&payload) {
						Ok(text) => text,
						Err(e) => {
							warn!(
								"Cannot decrypt message from '{}' ({}), keeping it verbatim",
								sender, e
							);
							payload
						}
					},
					_ => payload,
				};
				self.log.insert_message(&sender, &self.username, &text, false)?;
				self.add_contact(&sender, from);
				let _ = self.incoming.send(IncomingMessage { sender, text });
			}
			PeerMsg::PubkeyReq { requester } => {
				if let Some(crypto) = &self.crypto {
					let response = PeerMsg::PubkeyRes {
						peer: self.username.clone(),
						key_b64: crypto.public_key_b64()?,
					}
					.to_string();
					self.message_socket.send_to(response.as_bytes(), from).await?;
					self.add_contact(&requester, from);
					// Exchange is mutual: ask back if we miss their key
					if !crypto.has_peer_key(&requester) {
						let request = PeerMsg::PubkeyReq {
							requester: self.username.clone(),
						}
						.to_string();
						self.message_socket.send_to(request.as_bytes(), from).await?;
					}
				}
			}
			PeerMsg::PubkeyRes { peer, key_b64 } => {
				if let Some(crypto) = &self.crypto {
					crypto.store_peer_key(&peer, &key_b64)?;
					self.add_contact(&peer, from);
					if let Some(tx) = self.key_exchanges.lock().unwrap().remove(&peer) {
						let _ = tx.send(true);
					}
					info!("Stored public key of '{}'", peer);
				}
			}
		}
		Ok(())
	}

	/// Once a second, retry the head of every pending queue; a failure
	/// leaves that queue intact and moves on to the next recipient.
	async fn pending_loop(self: &Arc<Self>, mut must_exit: watch::Receiver<bool>) {
		while !*must_exit.borrow() {
			select! {
				_ = tokio::time::sleep(PENDING_INTERVAL) => {},
				_ = must_exit.changed() => continue,
			}

			let recipients: Vec<String> =
				self.pending.lock().unwrap().keys().cloned().collect();
			for recipient in recipients {
				loop {
					let head = self
						.pending
						.lock()
						.unwrap()
						.get(&recipient)
						.and_then(|q| q.front().cloned());
					let text = match head {
						Some(text) => text,
						None => break,
					};
					match self.try_deliver(&recipient, &text).await {
						Ok(()) => {
							let mut pending = self.pending.lock().unwrap();
							if let Some(queue) = pending.get_mut(&recipient) {
								queue.pop_front();
								if queue.is_empty() {
									pending.remove(&recipient);
								}
							}
						}
						Err(_) => break,
					}
				}
			}
		}
	}

	async fn reconnect_loop(self: &Arc<Self>, mut must_exit: watch::Receiver<bool>) {
		while !*must_exit.borrow() {
			select! {
				_ = tokio::time::sleep(RECONNECT_INTERVAL) => {},
				_ = must_exit.changed() => continue,
			}
			if self.server_down.load(Ordering::SeqCst) {
				match self.connect().await {
					Ok(info) => info!("Reconnected to directory server '{}'", info.name),
					Err(e) => debug!("Server rediscovery failed: {}", e),
				}
			}
		}
	}

	// ---- Chat log surface ----

	pub fn load_chat(&self, partner: &str) -> Result<Vec<StoredMessage>, Error> {
		Ok(self.log.conversation(&self.username, partner)?)
	}

	pub fn unseen_from(&self, partner: &str) -> Result<Vec<StoredMessage>, Error> {
		Ok(self.log.unseen_from(&self.username, partner)?)
	}

	pub fn mark_seen(&self, partner: &str) -> Result<(), Error> {
		Ok(self.log.mark_seen(&self.username, partner)?)
	}

	pub fn unread_counts(&self) -> Result<Vec<(String, u32)>, Error> {
		Ok(self.log.unread_counts(&self.username)?)
	}

	pub fn chat_previews(&self) -> Result<Vec<(String, String)>, Error> {
		Ok(self.log.chat_previews(&self.username)?)
	}
}
