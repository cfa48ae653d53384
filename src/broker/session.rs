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

use std::net::SocketAddr;

use hashbrown::HashSet;

use super::function::FunctionId;
use crate::{
	protocol::Packet,
	types::{ConnId, JobId},
};

/// What the writer half of a connection drains. Entries preserve enqueue
/// order; `Close` flushes nothing further and shuts the socket down.
#[derive(Clone, Debug)]
pub enum Outbound {
	Packet(Packet),
	Text(Vec<u8>),
	Close,
}

/// A function a worker has declared, with the optional self-enforced
/// timeout from `CAN_DO_TIMEOUT`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Ability {
	pub function: FunctionId,
	pub timeout: Option<u64>,
}

/// Per-connection attachment. One session can act as client and worker at
/// the same time; both halves live here.
pub(crate) struct Session {
	pub id: ConnId,
	pub peer: SocketAddr,
	outbound: flume::Sender<Outbound>,
	outbound_soft_limit: usize,
	pub client_id: Option<Vec<u8>>,
	/// negotiated via `OPTION_REQ exceptions`
	pub forward_exceptions: bool,
	/// foreground submissions this connection wants result frames for
	pub watched: HashSet<JobId>,
	/// declared capabilities, in declaration order
	pub abilities: Vec<Ability>,
	/// jobs currently assigned to this connection as a worker
	pub assigned: HashSet<JobId>,
	pub sleeping: bool,
	pub noop_queued: bool,
}

impl Session {
	pub fn new(
		id: ConnId,
		peer: SocketAddr,
		outbound: flume::Sender<Outbound>,
		outbound_soft_limit: usize,
	) -> Self {
		Self {
			id,
			peer,
			outbound,
			outbound_soft_limit,
			client_id: None,
			forward_exceptions: false,
			watched: HashSet::new(),
			abilities: Vec::new(),
			assigned: HashSet::new(),
			sleeping: false,
			noop_queued: false,
		}
	}

	/// Queue a packet on the connection's outbound FIFO. A send to a
	/// half-dead connection is dropped silently; the reader side is about
	/// to tear the session down anyway.
	pub fn send(&self, packet: Packet) {
		log::trace!("conn {} <- {}", self.id, packet.command);
		if self.over_soft_limit() {
			log::warn!("conn {} outbound queue over soft limit, closing slow consumer", self.id);
			let _ = self.outbound.send(Outbound::Close);
			return;
		}
		let _ = self.outbound.send(Outbound::Packet(packet));
	}

	pub fn send_text(&self, line: Vec<u8>) {
		let _ = self.outbound.send(Outbound::Text(line));
	}

	fn over_soft_limit(&self) -> bool {
		self.outbound_soft_limit > 0 && self.outbound.len() >= self.outbound_soft_limit
	}
}
