// Copyright 2018-2021 Parity Technologies (UK) Ltd.
// This file is part of job-broker.

// job-broker is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// job-broker is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with job-broker.  If not, see <http://www.gnu.org/licenses/>.

//! The network front of the broker. Accepted connections are handed
//! round-robin to a fixed set of I/O threads, each running its own local
//! executor; a connection's protocol state machine only ever runs on the
//! thread that adopted it. Threads learn about new connections and
//! shutdown through a per-thread wakeup channel.

mod admin;
mod connection;
mod handlers;

use std::{
	convert::TryFrom,
	net::{SocketAddr, ToSocketAddrs},
	sync::Arc,
};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Deserialize;
use smol::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};

use crate::{
	broker::{Broker, Outbound},
	error::{Error, Result},
	queue::{self, PersistentQueue, QueueSettings, ReplaySink},
	types::{ConnId, Priority},
};

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
	/// Addresses to listen on; one listening socket each.
	#[serde(default = "default_listen")]
	pub listen: Vec<String>,
	#[serde(default = "default_port")]
	pub port: u16,
	#[serde(default = "default_backlog")]
	pub backlog: i32,
	/// Number of I/O threads sharding the connection set.
	#[serde(default = "default_io_threads")]
	pub io_threads: usize,
	/// Distinguishes this broker's job handles: `H:<server_id>:<n>`.
	#[serde(default = "default_server_id")]
	pub server_id: String,
	/// `WORK_FAIL` re-queues a job this many times before it is terminal.
	#[serde(default)]
	pub job_retries: u32,
	/// How many sleeping workers to wake per enqueue; 0 wakes all.
	#[serde(default)]
	pub worker_wakeup: usize,
	/// Soft cap on a connection's outbound FIFO; 0 is unbounded.
	#[serde(default)]
	pub outbound_soft_limit: usize,
	#[serde(default)]
	pub queue: QueueSettings,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			listen: default_listen(),
			port: default_port(),
			backlog: default_backlog(),
			io_threads: default_io_threads(),
			server_id: default_server_id(),
			job_retries: 0,
			worker_wakeup: 0,
			outbound_soft_limit: 0,
			queue: QueueSettings::default(),
		}
	}
}

fn default_listen() -> Vec<String> {
	vec!["0.0.0.0".to_string()]
}

const fn default_port() -> u16 {
	4730
}

const fn default_backlog() -> i32 {
	64
}

fn default_io_threads() -> usize {
	num_cpus::get()
}

fn default_server_id() -> String {
	"local".to_string()
}

/// Opcodes delivered to an I/O thread's loop.
enum Wakeup {
	Adopt { conn: ConnId, stream: TcpStream, outbound: flume::Receiver<Outbound> },
	Shutdown,
}

/// Messages for the supervising loop.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Control {
	Shutdown { graceful: bool },
	/// graceful drain finished; sent by the handler that completed the
	/// last running job
	Drained,
}

/// State every handler can reach: the broker behind its lock, the durable
/// queue, and the control channel.
pub(crate) struct Shared {
	pub broker: Mutex<Broker>,
	pub queue: Option<Arc<dyn PersistentQueue>>,
	pub control: flume::Sender<Control>,
}

struct BrokerReplay<'a>(&'a mut Broker);

impl ReplaySink for BrokerReplay<'_> {
	fn replay_add(&mut self, function: &[u8], unique: &[u8], data: &[u8], priority: Priority) {
		self.0.replay_job(function, unique, data, priority);
	}
}

pub struct ServerBuilder {
	config: ServerConfig,
	adapter: Option<Arc<dyn PersistentQueue>>,
}

impl Default for ServerBuilder {
	fn default() -> Self {
		Self { config: ServerConfig::default(), adapter: None }
	}
}

impl ServerBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_config(config: ServerConfig) -> Self {
		Self { config, adapter: None }
	}

	/// Addresses to listen on.
	///
	/// # Default
	/// Defaults to all IPv4 interfaces.
	pub fn listen(mut self, addrs: Option<Vec<String>>) -> Self {
		if let Some(addrs) = addrs {
			self.config.listen = addrs;
		}
		self
	}

	/// TCP port shared by all listening sockets.
	///
	/// # Default
	/// Defaults to 4730.
	pub fn port(mut self, port: Option<u16>) -> Self {
		if let Some(port) = port {
			self.config.port = port;
		}
		self
	}

	/// Number of I/O threads.
	///
	/// # Default
	/// Defaults to the number of logical cpus in the system.
	pub fn io_threads(mut self, threads: Option<usize>) -> Self {
		if let Some(threads) = threads {
			self.config.io_threads = threads.max(1);
		}
		self
	}

	pub fn server_id(mut self, id: Option<String>) -> Self {
		if let Some(id) = id {
			self.config.server_id = id;
		}
		self
	}

	pub fn backlog(mut self, backlog: Option<i32>) -> Self {
		if let Some(backlog) = backlog {
			self.config.backlog = backlog;
		}
		self
	}

	pub fn job_retries(mut self, retries: Option<u32>) -> Self {
		if let Some(retries) = retries {
			self.config.job_retries = retries;
		}
		self
	}

	pub fn worker_wakeup(mut self, wakeup: Option<usize>) -> Self {
		if let Some(wakeup) = wakeup {
			self.config.worker_wakeup = wakeup;
		}
		self
	}

	pub fn outbound_soft_limit(mut self, limit: Option<usize>) -> Self {
		if let Some(limit) = limit {
			self.config.outbound_soft_limit = limit;
		}
		self
	}

	pub fn queue_settings(mut self, settings: QueueSettings) -> Self {
		self.config.queue = settings;
		self
	}

	/// Install a pre-built adapter instead of constructing one from the
	/// queue settings. Used by tests and embedders.
	pub fn queue_adapter(mut self, adapter: Arc<dyn PersistentQueue>) -> Self {
		self.adapter = Some(adapter);
		self
	}

	/// Install the durable queue, replay it, bind the listening sockets
	/// and spawn the I/O threads. The returned server accepts nothing
	/// until [`Server::run`] is called.
	pub fn build(self) -> Result<Server> {
		let config = self.config;
		let adapter = match self.adapter {
			Some(adapter) => Some(adapter),
			None => smol::block_on(queue::init(&config.queue))?,
		};

		let mut broker = Broker::new(
			&config.server_id,
			config.job_retries,
			config.worker_wakeup,
			config.outbound_soft_limit,
		);
		if let Some(queue) = &adapter {
			broker.set_replaying(true);
			let replayed = smol::block_on(queue.replay(&mut BrokerReplay(&mut broker)))?;
			broker.set_replaying(false);
			log::info!("replayed {} durable jobs", replayed);
		}

		let (control_tx, control_rx) = flume::unbounded();
		let shared = Arc::new(Shared { broker: Mutex::new(broker), queue: adapter, control: control_tx });

		let mut listeners = Vec::with_capacity(config.listen.len());
		let mut local_addrs = Vec::with_capacity(config.listen.len());
		for addr in &config.listen {
			let listener = bind(addr, config.port, config.backlog)?;
			let local = listener.local_addr()?;
			log::info!("listening on {}", local);
			local_addrs.push(local);
			listeners.push(listener);
		}

		let mut wakeups = Vec::with_capacity(config.io_threads);
		let mut threads = Vec::with_capacity(config.io_threads);
		for index in 0..config.io_threads.max(1) {
			let (tx, rx) = flume::unbounded();
			let shared = shared.clone();
			threads.push(jod_thread::spawn(move || io_thread(shared, rx, index)));
			wakeups.push(tx);
		}

		Ok(Server { shared, listeners, local_addrs, wakeups, threads, control_rx })
	}
}

/// Bind one listening socket with an explicit backlog.
fn bind(addr: &str, port: u16, backlog: i32) -> Result<TcpListener> {
	let addr: SocketAddr = (addr, port)
		.to_socket_addrs()
		.map_err(|e| Error::Config(format!("cannot resolve `{}`: {}", addr, e)))?
		.next()
		.ok_or_else(|| Error::Config(format!("`{}` resolves to no address", addr)))?;
	let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
	let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
	socket.set_reuse_address(true)?;
	socket.bind(&addr.into())?;
	socket.listen(backlog)?;
	socket.set_nonblocking(true)?;
	let listener: std::net::TcpListener = socket.into();
	TcpListener::try_from(listener).map_err(Into::into)
}

fn io_thread(shared: Arc<Shared>, wakeups: flume::Receiver<Wakeup>, index: usize) {
	let ex = smol::LocalExecutor::new();
	smol::block_on(ex.run(async {
		loop {
			match wakeups.recv_async().await {
				Ok(Wakeup::Adopt { conn, stream, outbound }) => {
					log::debug!("thread {} adopting conn {}", index, conn);
					ex.spawn(connection::run(shared.clone(), conn, stream, outbound)).detach();
				}
				Ok(Wakeup::Shutdown) | Err(_) => break,
			}
		}
	}));
	// let writers flush queued responses before their tasks are dropped
	smol::block_on(ex.run(smol::Timer::after(std::time::Duration::from_millis(100))));
	log::debug!("io thread {} exited", index);
}

/// A built broker: listeners bound, queue replayed, threads idle.
pub struct Server {
	shared: Arc<Shared>,
	listeners: Vec<TcpListener>,
	local_addrs: Vec<SocketAddr>,
	wakeups: Vec<flume::Sender<Wakeup>>,
	threads: Vec<jod_thread::JoinHandle<()>>,
	control_rx: flume::Receiver<Control>,
}

/// Cloneable remote control for a running server.
#[derive(Clone)]
pub struct ServerHandle {
	control: flume::Sender<Control>,
}

impl ServerHandle {
	/// Stop the server. Graceful shutdown stops accepting and waits for
	/// running jobs to reach terminal status first.
	pub fn shutdown(&self, graceful: bool) {
		let _ = self.control.send(Control::Shutdown { graceful });
	}
}

impl Server {
	pub fn builder() -> ServerBuilder {
		ServerBuilder::new()
	}

	pub fn handle(&self) -> ServerHandle {
		ServerHandle { control: self.shared.control.clone() }
	}

	pub fn local_addrs(&self) -> &[SocketAddr] {
		&self.local_addrs
	}

	/// Accept and serve until shutdown. Blocks the calling thread.
	pub fn run(self) -> Result<()> {
		let Server { shared, listeners, local_addrs: _, wakeups, threads, control_rx } = self;
		let result =
			smol::block_on(supervise(shared, listeners, wakeups.clone(), control_rx));
		for tx in &wakeups {
			let _ = tx.send(Wakeup::Shutdown);
		}
		drop(wakeups);
		for thread in threads {
			thread.join();
		}
		log::info!("broker stopped");
		result
	}
}

enum Step {
	Continue,
	Stop,
}

async fn supervise(
	shared: Arc<Shared>,
	listeners: Vec<TcpListener>,
	wakeups: Vec<flume::Sender<Wakeup>>,
	control_rx: flume::Receiver<Control>,
) -> Result<()> {
	let (accept_tx, accept_rx) = flume::unbounded();
	let mut accept_tasks: Option<Vec<smol::Task<()>>> = Some(
		listeners
			.into_iter()
			.map(|listener| smol::spawn(accept_loop(listener, accept_tx.clone())))
			.collect(),
	);
	drop(accept_tx);

	let mut next_conn = 1u64;
	let mut round_robin = 0usize;
	let mut accepting = true;
	loop {
		let step = if accepting {
			futures::select! {
				accepted = accept_rx.recv_async().fuse() => match accepted {
					Ok((stream, peer)) => {
						let conn = ConnId(next_conn);
						next_conn += 1;
						let (tx, rx) = flume::unbounded();
						shared.broker.lock().register_session(conn, peer, tx);
						let target = &wakeups[round_robin % wakeups.len()];
						round_robin = round_robin.wrapping_add(1);
						let _ = target.send(Wakeup::Adopt { conn, stream, outbound: rx });
						Step::Continue
					}
					Err(_) => {
						accepting = false;
						Step::Continue
					}
				},
				msg = control_rx.recv_async().fuse() => {
					handle_control(&shared, msg, &mut accept_tasks, &mut accepting)
				}
			}
		} else {
			let msg = control_rx.recv_async().await;
			handle_control(&shared, msg, &mut accept_tasks, &mut accepting)
		};
		if let Step::Stop = step {
			break;
		}
	}
	Ok(())
}

fn handle_control(
	shared: &Shared,
	msg: Result<Control, flume::RecvError>,
	accept_tasks: &mut Option<Vec<smol::Task<()>>>,
	accepting: &mut bool,
) -> Step {
	match msg {
		Ok(Control::Shutdown { graceful: false }) | Err(_) => {
			log::info!("immediate shutdown");
			Step::Stop
		}
		Ok(Control::Shutdown { graceful: true }) => {
			// cancel the accept tasks; existing connections keep running
			accept_tasks.take();
			*accepting = false;
			if shared.broker.lock().start_draining() {
				log::info!("graceful shutdown: nothing running");
				Step::Stop
			} else {
				log::info!("graceful shutdown: draining running jobs");
				Step::Continue
			}
		}
		Ok(Control::Drained) => {
			log::info!("graceful shutdown: drained");
			Step::Stop
		}
	}
}

async fn accept_loop(listener: TcpListener, tx: flume::Sender<(TcpStream, SocketAddr)>) {
	loop {
		match listener.accept().await {
			Ok((stream, peer)) => {
				let _ = stream.set_nodelay(true);
				if tx.send_async((stream, peer)).await.is_err() {
					break;
				}
			}
			Err(e) => log::warn!("accept failed: {}", e),
		}
	}
}
