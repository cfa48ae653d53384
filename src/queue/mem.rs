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

//! In-process adapter. Not durable across restarts; exists so tests (and
//! embedders) can observe the broker's persistence traffic.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{PersistentQueue, QueueError, ReplaySink};
use crate::types::Priority;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Entry {
	unique: Vec<u8>,
	function: Vec<u8>,
	data: Vec<u8>,
	priority: Priority,
}

#[derive(Default)]
pub struct MemoryQueue {
	entries: Mutex<Vec<Entry>>,
	add_calls: AtomicUsize,
	done_calls: AtomicUsize,
}

impl MemoryQueue {
	pub fn new() -> Self {
		Self::default()
	}

	/// Pre-load a record, as if it had been persisted by a previous run.
	/// Does not count as an `add` call.
	pub fn seed(&self, unique: &[u8], function: &[u8], data: &[u8], priority: Priority) {
		self.entries.lock().push(Entry {
			unique: unique.to_vec(),
			function: function.to_vec(),
			data: data.to_vec(),
			priority,
		});
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn add_calls(&self) -> usize {
		self.add_calls.load(Ordering::SeqCst)
	}

	pub fn done_calls(&self) -> usize {
		self.done_calls.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl PersistentQueue for MemoryQueue {
	async fn add(
		&self,
		unique: &[u8],
		function: &[u8],
		data: &[u8],
		priority: Priority,
	) -> Result<(), QueueError> {
		self.add_calls.fetch_add(1, Ordering::SeqCst);
		let mut entries = self.entries.lock();
		entries.retain(|e| !(e.unique == unique && e.function == function));
		entries.push(Entry {
			unique: unique.to_vec(),
			function: function.to_vec(),
			data: data.to_vec(),
			priority,
		});
		Ok(())
	}

	async fn flush(&self) -> Result<(), QueueError> {
		Ok(())
	}

	async fn done(&self, unique: &[u8], function: &[u8]) -> Result<(), QueueError> {
		self.done_calls.fetch_add(1, Ordering::SeqCst);
		self.entries.lock().retain(|e| !(e.unique == unique && e.function == function));
		Ok(())
	}

	async fn replay(&self, sink: &mut (dyn ReplaySink + Send)) -> Result<u64, QueueError> {
		let entries = self.entries.lock().clone();
		let count = entries.len() as u64;
		for e in entries {
			sink.replay_add(&e.function, &e.unique, &e.data, e.priority);
		}
		Ok(count)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Collect(Vec<(Vec<u8>, Vec<u8>)>);

	impl ReplaySink for Collect {
		fn replay_add(&mut self, function: &[u8], unique: &[u8], _data: &[u8], _priority: Priority) {
			self.0.push((function.to_vec(), unique.to_vec()));
		}
	}

	#[test]
	fn add_done_replay_round_trip() {
		smol::block_on(async {
			let q = MemoryQueue::new();
			q.add(b"u1", b"f", b"a", Priority::Normal).await.unwrap();
			q.add(b"u2", b"f", b"b", Priority::High).await.unwrap();
			q.flush().await.unwrap();
			q.done(b"u1", b"f").await.unwrap();
			assert_eq!(q.len(), 1);

			let mut sink = Collect(Vec::new());
			let replayed = q.replay(&mut sink).await.unwrap();
			assert_eq!(replayed, 1);
			assert_eq!(sink.0, vec![(b"f".to_vec(), b"u2".to_vec())]);
			// replay must not have touched the add counter
			assert_eq!(q.add_calls(), 2);
		});
	}

	#[test]
	fn re_adding_a_unique_replaces_the_record() {
		smol::block_on(async {
			let q = MemoryQueue::new();
			q.add(b"u", b"f", b"a", Priority::Normal).await.unwrap();
			q.add(b"u", b"f", b"b", Priority::Normal).await.unwrap();
			assert_eq!(q.len(), 1);
		});
	}
}
