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

use super::function::FunctionId;
use crate::types::{ConnId, JobHandle, JobId, Priority};

/// Key into the by-unique index: the owning function plus the 32-bit
/// mixing hash of the dedup bytes. Byte-exact comparison resolves
/// collisions within a bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct DedupKey {
	pub function: FunctionId,
	pub hash: u32,
}

/// A unit of work. Owned by the broker from creation to destruction;
/// every other structure refers to it by [`JobId`].
pub(crate) struct Job {
	pub id: JobId,
	pub handle: JobHandle,
	/// client-supplied dedup key; `b"-"` means the payload bytes decide
	pub unique: Vec<u8>,
	pub function: FunctionId,
	pub priority: Priority,
	pub data: Vec<u8>,
	/// last `WORK_STATUS` pair, verbatim
	pub status: Option<(Vec<u8>, Vec<u8>)>,
	/// connections registered for foreground frames
	pub clients: Vec<ConnId>,
	pub worker: Option<ConnId>,
	/// a durable copy exists until `done` is invoked
	pub queued: bool,
	/// logically deleted; reaped the next time it reaches the head
	pub ignore: bool,
	pub retry_count: u32,
	pub dedup: DedupKey,
	/// key identifying the durable copy; differs from `unique` when the
	/// unique was empty or payload-derived
	pub persist_key: Vec<u8>,
}

impl Job {
	pub fn is_queued_state(&self) -> bool {
		self.worker.is_none()
	}

	pub fn numerator(&self) -> &[u8] {
		self.status.as_ref().map(|(n, _)| n.as_slice()).unwrap_or(b"0")
	}

	pub fn denominator(&self) -> &[u8] {
		self.status.as_ref().map(|(_, d)| d.as_slice()).unwrap_or(b"0")
	}
}
