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

use std::collections::VecDeque;

use crate::types::{ConnId, JobId, Priority};

/// Index of an interned function name. Functions are created lazily on
/// first reference and live until the broker is torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct FunctionId(pub usize);

/// A named capability workers declare and clients target. Holds the
/// per-priority FIFO of queued jobs and the accounting the administrative
/// protocol reports.
pub(crate) struct Function {
	pub name: Vec<u8>,
	/// 0 = unbounded
	pub max_queue_size: u32,
	/// jobs of this function still in existence, any state
	pub job_total: u32,
	/// jobs of this function currently assigned to a worker
	pub job_running: u32,
	queues: [VecDeque<JobId>; 3],
	/// connections that declared capability, in arrival order
	pub workers: Vec<ConnId>,
}

impl Function {
	pub fn new(name: Vec<u8>) -> Self {
		Self {
			name,
			max_queue_size: 0,
			job_total: 0,
			job_running: 0,
			queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
			workers: Vec::new(),
		}
	}

	pub fn enqueue(&mut self, priority: Priority, id: JobId) {
		self.queues[priority.index()].push_back(id);
	}

	/// Return a job to the head of its priority list (worker loss, retry).
	pub fn requeue(&mut self, priority: Priority, id: JobId) {
		self.queues[priority.index()].push_front(id);
	}

	pub fn peek(&self, priority: Priority) -> Option<JobId> {
		self.queues[priority.index()].front().copied()
	}

	pub fn pop(&mut self, priority: Priority) -> Option<JobId> {
		self.queues[priority.index()].pop_front()
	}

	pub fn has_queued(&self) -> bool {
		self.queues.iter().any(|q| !q.is_empty())
	}

	pub fn add_worker(&mut self, conn: ConnId) {
		if !self.workers.contains(&conn) {
			self.workers.push(conn);
		}
	}

	pub fn remove_worker(&mut self, conn: ConnId) {
		self.workers.retain(|w| *w != conn);
	}

	#[cfg(test)]
	pub fn queue_len(&self, priority: Priority) -> usize {
		self.queues[priority.index()].len()
	}

	#[cfg(test)]
	pub fn contains_queued(&self, id: JobId) -> usize {
		self.queues.iter().map(|q| q.iter().filter(|j| **j == id).count()).sum()
	}
}
