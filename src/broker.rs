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

//! The authoritative registry of functions, jobs and sessions, and every
//! state transition the protocol can trigger on them. One `Broker` value
//! exists per process, behind a single lock; handlers running on any I/O
//! thread lock it for the duration of a mutation. Persistence runs outside
//! the lock: mutators hand back [`PersistRecord`]/[`PersistDelete`] values
//! describing what the caller must write through to the durable queue.

mod function;
mod job;
mod session;

use std::net::SocketAddr;

use hashbrown::HashMap;

pub(crate) use self::{
	function::{Function, FunctionId},
	job::{DedupKey, Job},
	session::{Ability, Session},
};
pub use self::session::Outbound;
use crate::{
	protocol::{Command, Packet},
	types::{key_hash, ConnId, JobHandle, JobId, Priority},
};

/// What a freshly created job needs written to the persistent queue.
#[derive(Clone, Debug)]
pub struct PersistRecord {
	pub unique: Vec<u8>,
	pub function: Vec<u8>,
	pub data: Vec<u8>,
	pub priority: Priority,
}

/// A durable entry to delete after a terminal transition.
#[derive(Clone, Debug)]
pub struct PersistDelete {
	pub unique: Vec<u8>,
	pub function: Vec<u8>,
}

/// Result of the in-memory half of a submission.
pub(crate) enum SubmitOutcome {
	/// Deduplicated onto a live job; the submitter was attached if foreground.
	Existing { handle: JobHandle },
	/// New job created but not yet takeable. The caller persists `persist`
	/// (when a queue is installed), then commits or aborts.
	Created { job: JobId, handle: JobHandle, persist: Option<PersistRecord> },
	QueueFull,
}

pub(crate) enum TakeOutcome {
	NoJob,
	Assigned(Packet),
}

#[derive(Debug)]
pub(crate) struct CompleteOutcome {
	pub delete: Option<PersistDelete>,
	/// graceful drain finished with this transition
	pub drained: bool,
}

#[derive(Debug)]
pub(crate) enum FailOutcome {
	/// retry budget left; job went back to the head of its priority list
	Retried,
	Done { delete: Option<PersistDelete>, drained: bool },
}

/// A work frame referenced a job this broker does not know, or one that is
/// not assigned to the sending connection.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct UnknownJob;

pub struct Broker {
	handle_prefix: String,
	job_retries: u32,
	worker_wakeup: usize,
	outbound_soft_limit: usize,
	handle_seq: u64,
	job_seq: u64,
	replaying: bool,
	draining: bool,
	functions: HashMap<Vec<u8>, FunctionId>,
	function_table: Vec<Function>,
	jobs: HashMap<JobId, Job>,
	by_handle: HashMap<Vec<u8>, JobId>,
	by_unique: HashMap<DedupKey, Vec<JobId>>,
	sessions: HashMap<ConnId, Session>,
}

impl Broker {
	pub fn new(server_id: &str, job_retries: u32, worker_wakeup: usize, outbound_soft_limit: usize) -> Self {
		Self {
			handle_prefix: format!("H:{}", server_id),
			job_retries,
			worker_wakeup,
			outbound_soft_limit,
			handle_seq: 1,
			job_seq: 1,
			replaying: false,
			draining: false,
			functions: HashMap::new(),
			function_table: Vec::new(),
			jobs: HashMap::new(),
			by_handle: HashMap::new(),
			by_unique: HashMap::new(),
			sessions: HashMap::new(),
		}
	}

	// ---- sessions -------------------------------------------------------

	pub(crate) fn register_session(&mut self, id: ConnId, peer: SocketAddr, outbound: flume::Sender<Outbound>) {
		log::debug!("conn {} registered ({})", id, peer);
		self.sessions.insert(id, Session::new(id, peer, outbound, self.outbound_soft_limit));
	}

	pub(crate) fn session(&self, id: ConnId) -> Option<&Session> {
		self.sessions.get(&id)
	}

	pub(crate) fn session_mut(&mut self, id: ConnId) -> Option<&mut Session> {
		self.sessions.get_mut(&id)
	}

	/// Tear a connection down: detach it from watched jobs (marking
	/// orphaned foreground jobs IGNORE), return its assigned jobs to their
	/// queues, and withdraw its capabilities.
	pub(crate) fn remove_session(&mut self, id: ConnId) {
		let session = match self.sessions.remove(&id) {
			Some(s) => s,
			None => return,
		};
		for job_id in session.watched {
			if let Some(job) = self.jobs.get_mut(&job_id) {
				job.clients.retain(|c| *c != id);
				if job.clients.is_empty() && job.is_queued_state() {
					log::debug!("job {} orphaned by conn {}, marking ignore", job_id.0, id);
					job.ignore = true;
				}
			}
		}
		let mut to_wake = Vec::new();
		for job_id in session.assigned {
			if let Some(job) = self.jobs.get_mut(&job_id) {
				log::debug!("conn {} lost while running job {}, re-queueing", id, job_id.0);
				job.worker = None;
				let (function, priority) = (job.function, job.priority);
				let f = &mut self.function_table[function.0];
				f.job_running -= 1;
				f.requeue(priority, job_id);
				to_wake.push(function);
			}
		}
		for ability in session.abilities {
			self.function_table[ability.function.0].remove_worker(id);
		}
		for function in to_wake {
			self.wake_workers(function);
		}
		log::debug!("conn {} removed", id);
	}

	// ---- capabilities ---------------------------------------------------

	pub(crate) fn can_do(&mut self, conn: ConnId, name: &[u8], timeout: Option<u64>) {
		let function = self.intern(name);
		self.function_table[function.0].add_worker(conn);
		if let Some(s) = self.sessions.get_mut(&conn) {
			if let Some(existing) = s.abilities.iter_mut().find(|a| a.function == function) {
				existing.timeout = timeout;
			} else {
				s.abilities.push(Ability { function, timeout });
			}
		}
	}

	pub(crate) fn cant_do(&mut self, conn: ConnId, name: &[u8]) {
		if let Some(&function) = self.functions.get(name) {
			self.function_table[function.0].remove_worker(conn);
			if let Some(s) = self.sessions.get_mut(&conn) {
				s.abilities.retain(|a| a.function != function);
			}
		}
	}

	pub(crate) fn reset_abilities(&mut self, conn: ConnId) {
		let abilities = match self.sessions.get_mut(&conn) {
			Some(s) => std::mem::take(&mut s.abilities),
			None => return,
		};
		for ability in abilities {
			self.function_table[ability.function.0].remove_worker(conn);
		}
	}

	/// `PRE_SLEEP`: the worker naps until woken. If a declared function
	/// already has work queued the NOOP goes out immediately; the
	/// submission may have raced the sleep.
	pub(crate) fn pre_sleep(&mut self, conn: ConnId) {
		let session = match self.sessions.get_mut(&conn) {
			Some(s) => s,
			None => return,
		};
		session.sleeping = true;
		if session.noop_queued {
			return;
		}
		let function_table = &self.function_table;
		let pending = session.abilities.iter().any(|a| function_table[a.function.0].has_queued());
		if pending {
			session.send(Packet::response(Command::Noop, Vec::new()));
			session.noop_queued = true;
		}
	}

	// ---- submission -----------------------------------------------------

	/// In-memory half of `job_add`: dedup, queue-size enforcement, job
	/// construction. The job is registered in both hash tables but not on
	/// any priority list; `commit_job` makes it takeable, `abort_job`
	/// unwinds it if persistence fails.
	pub(crate) fn prepare_job(
		&mut self,
		client: Option<ConnId>,
		function_name: &[u8],
		unique: &[u8],
		data: &[u8],
		priority: Priority,
	) -> SubmitOutcome {
		let function = self.intern(function_name);

		let dedup_by_data = unique == b"-" && !data.is_empty();
		let dedup_bytes: &[u8] = if dedup_by_data { data } else { unique };
		let dedup = DedupKey { function, hash: key_hash(dedup_bytes) };

		if !unique.is_empty() {
			if let Some(existing) = self.find_duplicate(dedup, dedup_by_data, dedup_bytes) {
				let job = self.jobs.get_mut(&existing).expect("index holds live jobs only");
				let handle = job.handle.clone();
				if let Some(client) = client {
					if !job.clients.contains(&client) {
						job.clients.push(client);
					}
					if let Some(s) = self.sessions.get_mut(&client) {
						s.watched.insert(existing);
					}
				}
				log::debug!("job {:?} deduplicated onto handle {}", unique, String::from_utf8_lossy(&handle));
				return SubmitOutcome::Existing { handle };
			}
		}

		{
			let f = &self.function_table[function.0];
			if f.max_queue_size > 0 && f.job_total >= f.max_queue_size {
				return SubmitOutcome::QueueFull;
			}
		}

		let id = JobId(self.job_seq);
		self.job_seq += 1;
		let handle: JobHandle = format!("{}:{}", self.handle_prefix, self.handle_seq).into_bytes();
		self.handle_seq += 1;

		let persist_key = if dedup_by_data {
			format!("-{:08x}", dedup.hash).into_bytes()
		} else if unique.is_empty() {
			handle.clone()
		} else {
			unique.to_vec()
		};

		let job = Job {
			id,
			handle: handle.clone(),
			unique: unique.to_vec(),
			function,
			priority,
			data: data.to_vec(),
			status: None,
			clients: client.into_iter().collect(),
			worker: None,
			queued: false,
			ignore: false,
			retry_count: 0,
			dedup,
			persist_key,
		};
		self.by_handle.insert(handle.clone(), id);
		self.by_unique.entry(dedup).or_default().push(id);
		self.jobs.insert(id, job);
		self.function_table[function.0].job_total += 1;
		if let Some(client) = client {
			if let Some(s) = self.sessions.get_mut(&client) {
				s.watched.insert(id);
			}
		}

		// Background submissions are written through to the durable queue
		// before they become takeable; replay must not re-persist.
		let persist = if client.is_none() && !self.replaying {
			Some(PersistRecord {
				unique: self.jobs[&id].persist_key.clone(),
				function: self.function_table[function.0].name.clone(),
				data: data.to_vec(),
				priority,
			})
		} else {
			None
		};
		SubmitOutcome::Created { job: id, handle, persist }
	}

	/// Place a prepared job on its function's priority list and wake
	/// capable sleeping workers.
	pub(crate) fn commit_job(&mut self, id: JobId, queued: bool) {
		let (function, priority) = {
			let job = self.jobs.get_mut(&id).expect("commit of a job that was prepared");
			job.queued = queued || self.replaying;
			(job.function, job.priority)
		};
		self.function_table[function.0].enqueue(priority, id);
		log::debug!(
			"job {} queued on {} at {}",
			id.0,
			String::from_utf8_lossy(&self.function_table[function.0].name),
			priority
		);
		self.wake_workers(function);
	}

	/// Unwind `prepare_job` after the persistent queue refused the record.
	pub(crate) fn abort_job(&mut self, id: JobId) {
		if let Some(job) = self.jobs.get(&id) {
			debug_assert!(job.is_queued_state());
			self.free_job(id);
		}
	}

	/// Reconstruct one job from the persistent queue at startup.
	pub(crate) fn replay_job(
		&mut self,
		function: &[u8],
		unique: &[u8],
		data: &[u8],
		priority: Priority,
	) {
		debug_assert!(self.replaying);
		match self.prepare_job(None, function, unique, data, priority) {
			SubmitOutcome::Created { job, .. } => self.commit_job(job, true),
			SubmitOutcome::Existing { .. } => {
				log::warn!("duplicate durable record for unique {:?}, skipped", String::from_utf8_lossy(unique))
			}
			SubmitOutcome::QueueFull => {
				log::warn!("durable record dropped: queue full for {:?}", String::from_utf8_lossy(function))
			}
		}
	}

	pub(crate) fn set_replaying(&mut self, replaying: bool) {
		self.replaying = replaying;
	}

	// ---- dispatch -------------------------------------------------------

	/// `GRAB_JOB[_UNIQ]`: walk the worker's declared functions in
	/// declaration order, priorities HIGH to LOW within each, and assign
	/// the first live head. IGNORE'd heads are reaped along the way; their
	/// durable deletes come back to the caller.
	pub(crate) fn take_job(&mut self, conn: ConnId, with_unique: bool) -> (TakeOutcome, Vec<PersistDelete>) {
		let mut reaped = Vec::new();
		let abilities: Vec<FunctionId> = match self.sessions.get_mut(&conn) {
			Some(s) => {
				s.sleeping = false;
				s.noop_queued = false;
				s.abilities.iter().map(|a| a.function).collect()
			}
			None => return (TakeOutcome::NoJob, reaped),
		};

		for function in abilities {
			for &priority in Priority::ALL.iter() {
				while let Some(id) = self.function_table[function.0].peek(priority) {
					if self.jobs[&id].ignore {
						self.function_table[function.0].pop(priority);
						log::debug!("reaping ignored job {} on take", id.0);
						if let Some(delete) = self.free_job(id) {
							reaped.push(delete);
						}
						continue;
					}
					self.function_table[function.0].pop(priority);
					self.function_table[function.0].job_running += 1;
					let job = self.jobs.get_mut(&id).expect("queued job is live");
					job.worker = Some(conn);
					let packet = if with_unique {
						Packet::response(
							Command::JobAssignUniq,
							vec![
								job.handle.clone(),
								self.function_table[function.0].name.clone(),
								job.unique.clone(),
								job.data.clone(),
							],
						)
					} else {
						Packet::response(
							Command::JobAssign,
							vec![
								job.handle.clone(),
								self.function_table[function.0].name.clone(),
								job.data.clone(),
							],
						)
					};
					if let Some(s) = self.sessions.get_mut(&conn) {
						s.assigned.insert(id);
					}
					return (TakeOutcome::Assigned(packet), reaped);
				}
			}
		}
		(TakeOutcome::NoJob, reaped)
	}

	// ---- work results ---------------------------------------------------

	/// `WORK_DATA`/`WORK_WARNING`/`WORK_EXCEPTION`: forward a progress
	/// frame to every registered client. Exceptions only reach clients
	/// that negotiated them.
	pub(crate) fn work_forward(
		&mut self,
		conn: ConnId,
		command: Command,
		handle: &[u8],
		payload: Vec<u8>,
	) -> Result<(), UnknownJob> {
		let id = self.assigned_job(conn, handle)?;
		let clients = self.jobs[&id].clients.clone();
		let packet = Packet::response(command, vec![handle.to_vec(), payload]);
		for client in clients {
			if let Some(s) = self.sessions.get(&client) {
				if command == Command::WorkException && !s.forward_exceptions {
					continue;
				}
				s.send(packet.clone());
			}
		}
		Ok(())
	}

	/// `WORK_STATUS`: record the pair on the job, then forward.
	pub(crate) fn work_status(
		&mut self,
		conn: ConnId,
		handle: &[u8],
		numerator: Vec<u8>,
		denominator: Vec<u8>,
	) -> Result<(), UnknownJob> {
		let id = self.assigned_job(conn, handle)?;
		let job = self.jobs.get_mut(&id).expect("assigned job is live");
		job.status = Some((numerator.clone(), denominator.clone()));
		let clients = job.clients.clone();
		let packet =
			Packet::response(Command::WorkStatus, vec![handle.to_vec(), numerator, denominator]);
		for client in clients {
			if let Some(s) = self.sessions.get(&client) {
				s.send(packet.clone());
			}
		}
		Ok(())
	}

	pub(crate) fn work_complete(
		&mut self,
		conn: ConnId,
		handle: &[u8],
		data: Vec<u8>,
	) -> Result<CompleteOutcome, UnknownJob> {
		let id = self.assigned_job(conn, handle)?;
		let clients = self.jobs[&id].clients.clone();
		let packet = Packet::response(Command::WorkComplete, vec![handle.to_vec(), data]);
		for client in clients {
			if let Some(s) = self.sessions.get(&client) {
				s.send(packet.clone());
			}
		}
		self.detach_worker(id, conn);
		let delete = self.free_job(id);
		Ok(CompleteOutcome { delete, drained: self.drain_finished() })
	}

	pub(crate) fn work_fail(&mut self, conn: ConnId, handle: &[u8]) -> Result<FailOutcome, UnknownJob> {
		let id = self.assigned_job(conn, handle)?;
		if self.jobs[&id].retry_count < self.job_retries {
			self.detach_worker(id, conn);
			let job = self.jobs.get_mut(&id).expect("assigned job is live");
			job.retry_count += 1;
			let (function, priority) = (job.function, job.priority);
			log::debug!("job {} failed, retry {}/{}", id.0, job.retry_count, self.job_retries);
			self.function_table[function.0].requeue(priority, id);
			self.wake_workers(function);
			return Ok(FailOutcome::Retried);
		}
		let clients = self.jobs[&id].clients.clone();
		let packet = Packet::response(Command::WorkFail, vec![handle.to_vec()]);
		for client in clients {
			if let Some(s) = self.sessions.get(&client) {
				s.send(packet.clone());
			}
		}
		self.detach_worker(id, conn);
		let delete = self.free_job(id);
		Ok(FailOutcome::Done { delete, drained: self.drain_finished() })
	}

	/// `GET_STATUS` reply fields: known, running, numerator, denominator.
	pub(crate) fn job_status(&self, handle: &[u8]) -> (bool, bool, Vec<u8>, Vec<u8>) {
		match self.by_handle.get(handle).and_then(|id| self.jobs.get(id)) {
			Some(job) => {
				(true, job.worker.is_some(), job.numerator().to_vec(), job.denominator().to_vec())
			}
			None => (false, false, b"0".to_vec(), b"0".to_vec()),
		}
	}

	// ---- administrative -------------------------------------------------

	/// Per-function counters for the `status` text command.
	pub(crate) fn function_stats(&self) -> Vec<(Vec<u8>, u32, u32, usize)> {
		self.function_table
			.iter()
			.map(|f| (f.name.clone(), f.job_total, f.job_running, f.workers.len()))
			.collect()
	}

	/// Per-connection capability listing for the `workers` text command.
	pub(crate) fn worker_stats(&self) -> Vec<(ConnId, SocketAddr, Option<Vec<u8>>, Vec<Vec<u8>>)> {
		let mut out: Vec<_> = self
			.sessions
			.values()
			.map(|s| {
				let functions = s
					.abilities
					.iter()
					.map(|a| self.function_table[a.function.0].name.clone())
					.collect();
				(s.id, s.peer, s.client_id.clone(), functions)
			})
			.collect();
		out.sort_by_key(|(id, ..)| id.0);
		out
	}

	pub(crate) fn set_max_queue(&mut self, function_name: &[u8], size: u32) {
		let function = self.intern(function_name);
		self.function_table[function.0].max_queue_size = size;
	}

	/// Enter graceful drain. Returns true when nothing is running and the
	/// server may exit at once.
	pub(crate) fn start_draining(&mut self) -> bool {
		self.draining = true;
		self.total_running() == 0
	}

	pub(crate) fn total_running(&self) -> u32 {
		self.function_table.iter().map(|f| f.job_running).sum()
	}

	// ---- internals ------------------------------------------------------

	fn intern(&mut self, name: &[u8]) -> FunctionId {
		if let Some(&id) = self.functions.get(name) {
			return id;
		}
		let id = FunctionId(self.function_table.len());
		self.functions.insert(name.to_vec(), id);
		self.function_table.push(Function::new(name.to_vec()));
		log::debug!("function {} created", String::from_utf8_lossy(name));
		id
	}

	fn find_duplicate(&self, dedup: DedupKey, by_data: bool, bytes: &[u8]) -> Option<JobId> {
		let bucket = self.by_unique.get(&dedup)?;
		bucket
			.iter()
			.copied()
			.find(|id| {
				let job = &self.jobs[id];
				if job.ignore {
					return false;
				}
				if by_data {
					job.data == bytes
				} else {
					job.unique == bytes
				}
			})
	}

	fn wake_workers(&mut self, function: FunctionId) {
		let workers = self.function_table[function.0].workers.clone();
		let mut woken = 0usize;
		for conn in workers {
			if self.worker_wakeup > 0 && woken >= self.worker_wakeup {
				break;
			}
			if let Some(s) = self.sessions.get_mut(&conn) {
				if s.sleeping && !s.noop_queued {
					s.send(Packet::response(Command::Noop, Vec::new()));
					s.noop_queued = true;
					woken += 1;
				}
			}
		}
	}

	/// Resolve a work frame's handle to a job assigned to `conn`.
	fn assigned_job(&self, conn: ConnId, handle: &[u8]) -> Result<JobId, UnknownJob> {
		let id = *self.by_handle.get(handle).ok_or(UnknownJob)?;
		if self.jobs[&id].worker != Some(conn) {
			return Err(UnknownJob);
		}
		Ok(id)
	}

	fn detach_worker(&mut self, id: JobId, conn: ConnId) {
		let job = self.jobs.get_mut(&id).expect("caller resolved the job");
		job.worker = None;
		self.function_table[job.function.0].job_running -= 1;
		if let Some(s) = self.sessions.get_mut(&conn) {
			s.assigned.remove(&id);
		}
	}

	/// Remove a job from every registry. Returns the durable delete the
	/// caller owes the persistent queue, if any.
	fn free_job(&mut self, id: JobId) -> Option<PersistDelete> {
		let job = self.jobs.remove(&id)?;
		self.by_handle.remove(&job.handle);
		if let Some(bucket) = self.by_unique.get_mut(&job.dedup) {
			bucket.retain(|j| *j != id);
			if bucket.is_empty() {
				self.by_unique.remove(&job.dedup);
			}
		}
		self.function_table[job.function.0].job_total -= 1;
		for client in &job.clients {
			if let Some(s) = self.sessions.get_mut(client) {
				s.watched.remove(&id);
			}
		}
		if let Some(worker) = job.worker {
			self.function_table[job.function.0].job_running -= 1;
			if let Some(s) = self.sessions.get_mut(&worker) {
				s.assigned.remove(&id);
			}
		}
		if job.queued {
			Some(PersistDelete {
				unique: job.persist_key,
				function: self.function_table[job.function.0].name.clone(),
			})
		} else {
			None
		}
	}

	pub(crate) fn drain_finished(&self) -> bool {
		self.draining && self.total_running() == 0
	}

	/// Walk every registry and cross-check the counters against the jobs
	/// that actually exist. Called after each transition in tests.
	#[cfg(test)]
	pub(crate) fn assert_invariants(&self) {
		for (i, f) in self.function_table.iter().enumerate() {
			let total = self.jobs.values().filter(|j| j.function.0 == i).count() as u32;
			assert_eq!(f.job_total, total, "job_total out of sync for function {}", i);
			let running =
				self.jobs.values().filter(|j| j.function.0 == i && j.worker.is_some()).count() as u32;
			assert_eq!(f.job_running, running, "job_running out of sync for function {}", i);
		}

		assert_eq!(self.by_handle.len(), self.jobs.len());
		for (handle, id) in &self.by_handle {
			assert_eq!(&self.jobs[id].handle, handle);
		}

		let indexed: usize = self.by_unique.values().map(Vec::len).sum();
		assert_eq!(indexed, self.jobs.len(), "by-unique index out of sync");
		for (key, bucket) in &self.by_unique {
			for id in bucket {
				assert_eq!(self.jobs[id].dedup, *key);
			}
		}

		for job in self.jobs.values() {
			let on_lists = self.function_table[job.function.0].contains_queued(job.id);
			if job.worker.is_some() {
				assert_eq!(on_lists, 0, "running job {} still on a priority list", job.id.0);
			} else {
				assert!(on_lists <= 1, "job {} on {} priority lists", job.id.0, on_lists);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn broker() -> Broker {
		crate::initialize();
		Broker::new("s1", 0, 0, 0)
	}

	fn connect(broker: &mut Broker, id: u64) -> flume::Receiver<Outbound> {
		let (tx, rx) = flume::unbounded();
		broker.register_session(ConnId(id), "127.0.0.1:0".parse().unwrap(), tx);
		rx
	}

	fn submit(
		broker: &mut Broker,
		client: Option<ConnId>,
		function: &[u8],
		unique: &[u8],
		data: &[u8],
		priority: Priority,
	) -> JobHandle {
		match broker.prepare_job(client, function, unique, data, priority) {
			SubmitOutcome::Existing { handle } => handle,
			SubmitOutcome::Created { job, handle, persist } => {
				broker.commit_job(job, persist.is_some());
				handle
			}
			SubmitOutcome::QueueFull => panic!("queue full"),
		}
	}

	fn recv_packet(rx: &flume::Receiver<Outbound>) -> Packet {
		match rx.try_recv().expect("expected an outbound entry") {
			Outbound::Packet(p) => p,
			other => panic!("expected packet, got {:?}", other),
		}
	}

	fn assigned_handle(outcome: TakeOutcome) -> Vec<u8> {
		match outcome {
			TakeOutcome::Assigned(packet) => packet.args[0].clone(),
			TakeOutcome::NoJob => panic!("expected an assignment"),
		}
	}

	#[test]
	fn dispatch_orders_by_priority_then_submission() {
		let mut b = broker();
		let _w = connect(&mut b, 1);
		b.can_do(ConnId(1), b"f", None);

		let low = submit(&mut b, None, b"f", b"", b"1", Priority::Low);
		let normal = submit(&mut b, None, b"f", b"", b"2", Priority::Normal);
		let high = submit(&mut b, None, b"f", b"", b"3", Priority::High);
		b.assert_invariants();

		let (first, _) = b.take_job(ConnId(1), false);
		let (second, _) = b.take_job(ConnId(1), false);
		let (third, _) = b.take_job(ConnId(1), false);
		assert_eq!(assigned_handle(first), high);
		assert_eq!(assigned_handle(second), normal);
		assert_eq!(assigned_handle(third), low);
		b.assert_invariants();

		let (none, _) = b.take_job(ConnId(1), false);
		assert!(matches!(none, TakeOutcome::NoJob));
	}

	#[test]
	fn duplicate_unique_reuses_the_job() {
		let mut b = broker();
		let _c = connect(&mut b, 1);
		let first = submit(&mut b, Some(ConnId(1)), b"f", b"u", b"A", Priority::Normal);
		let second = submit(&mut b, Some(ConnId(1)), b"f", b"u", b"B", Priority::Normal);
		assert_eq!(first, second);
		b.assert_invariants();

		// the payload handed to a worker is the original one
		let _w = connect(&mut b, 2);
		b.can_do(ConnId(2), b"f", None);
		let (outcome, _) = b.take_job(ConnId(2), false);
		match outcome {
			TakeOutcome::Assigned(packet) => assert_eq!(packet.args[2], b"A".to_vec()),
			TakeOutcome::NoJob => panic!("job should be queued"),
		}
	}

	#[test]
	fn dash_unique_dedups_on_payload_bytes() {
		let mut b = broker();
		let first = submit(&mut b, None, b"f", b"-", b"payload", Priority::Normal);
		let second = submit(&mut b, None, b"f", b"-", b"payload", Priority::Normal);
		let third = submit(&mut b, None, b"f", b"-", b"different", Priority::Normal);
		assert_eq!(first, second);
		assert_ne!(first, third);
		b.assert_invariants();
	}

	#[test]
	fn empty_unique_never_dedups() {
		let mut b = broker();
		let first = submit(&mut b, None, b"f", b"", b"same", Priority::Normal);
		let second = submit(&mut b, None, b"f", b"", b"same", Priority::Normal);
		assert_ne!(first, second);
		b.assert_invariants();
	}

	#[test]
	fn max_queue_size_rejects_the_overflowing_submission() {
		let mut b = broker();
		b.set_max_queue(b"f", 2);
		submit(&mut b, None, b"f", b"a", b"", Priority::Normal);
		submit(&mut b, None, b"f", b"b", b"", Priority::Normal);
		let outcome = b.prepare_job(None, b"f", b"c", b"", Priority::Normal);
		assert!(matches!(outcome, SubmitOutcome::QueueFull));
		b.assert_invariants();
	}

	#[test]
	fn submission_wakes_sleeping_workers_once() {
		let mut b = broker();
		let rx = connect(&mut b, 1);
		b.can_do(ConnId(1), b"f", None);
		b.pre_sleep(ConnId(1));
		assert!(rx.is_empty(), "no work yet, no NOOP");

		submit(&mut b, None, b"f", b"", b"x", Priority::Normal);
		assert_eq!(recv_packet(&rx).command, Command::Noop);

		// a second submission while the first NOOP is still pending stays quiet
		submit(&mut b, None, b"f", b"", b"y", Priority::Normal);
		assert!(rx.is_empty());
	}

	#[test]
	fn pre_sleep_with_pending_work_wakes_immediately() {
		let mut b = broker();
		submit(&mut b, None, b"f", b"", b"x", Priority::Normal);
		let rx = connect(&mut b, 1);
		b.can_do(ConnId(1), b"f", None);
		b.pre_sleep(ConnId(1));
		assert_eq!(recv_packet(&rx).command, Command::Noop);
	}

	#[test]
	fn worker_wakeup_limits_the_herd() {
		let mut b = Broker::new("s1", 0, 1, 0);
		let rx1 = connect(&mut b, 1);
		let rx2 = connect(&mut b, 2);
		for id in 1..=2 {
			b.can_do(ConnId(id), b"f", None);
			b.pre_sleep(ConnId(id));
		}
		submit(&mut b, None, b"f", b"", b"x", Priority::Normal);
		assert_eq!(rx1.len() + rx2.len(), 1, "only one worker should be woken");
	}

	#[test]
	fn orphaned_foreground_job_is_reaped_on_take() {
		let mut b = broker();
		let _client = connect(&mut b, 1);
		submit(&mut b, Some(ConnId(1)), b"f", b"u", b"payload", Priority::Normal);
		b.remove_session(ConnId(1));
		b.assert_invariants();

		let _w = connect(&mut b, 2);
		b.can_do(ConnId(2), b"f", None);
		let (outcome, reaped) = b.take_job(ConnId(2), false);
		assert!(matches!(outcome, TakeOutcome::NoJob));
		assert!(reaped.is_empty(), "foreground jobs have no durable copy");
		assert_eq!(b.job_status(b"H:s1:1").0, false, "job must be gone");
		b.assert_invariants();
	}

	#[test]
	fn worker_loss_requeues_the_assignment() {
		let mut b = broker();
		let _w1 = connect(&mut b, 1);
		b.can_do(ConnId(1), b"f", None);
		let handle = submit(&mut b, None, b"f", b"u", b"payload", Priority::Normal);
		let (outcome, _) = b.take_job(ConnId(1), false);
		assert_eq!(assigned_handle(outcome), handle);

		b.remove_session(ConnId(1));
		b.assert_invariants();

		let _w2 = connect(&mut b, 2);
		b.can_do(ConnId(2), b"f", None);
		let (outcome, _) = b.take_job(ConnId(2), false);
		assert_eq!(assigned_handle(outcome), handle);
		b.assert_invariants();
	}

	#[test]
	fn work_complete_forwards_to_the_client_and_frees() {
		let mut b = broker();
		let client_rx = connect(&mut b, 1);
		let _w = connect(&mut b, 2);
		b.can_do(ConnId(2), b"f", None);
		let handle = submit(&mut b, Some(ConnId(1)), b"f", b"u", b"hello", Priority::Normal);
		let (outcome, _) = b.take_job(ConnId(2), false);
		assert_eq!(assigned_handle(outcome), handle);

		let done = b.work_complete(ConnId(2), &handle, b"olleh".to_vec()).unwrap();
		assert!(done.delete.is_none());
		let forwarded = recv_packet(&client_rx);
		assert_eq!(forwarded.command, Command::WorkComplete);
		assert_eq!(forwarded.args, vec![handle.clone(), b"olleh".to_vec()]);
		assert_eq!(b.job_status(&handle).0, false);
		b.assert_invariants();
	}

	#[test]
	fn background_jobs_carry_their_durable_delete() {
		let mut b = broker();
		let _w = connect(&mut b, 1);
		b.can_do(ConnId(1), b"f", None);
		let (job, handle) = match b.prepare_job(None, b"f", b"u", b"x", Priority::Normal) {
			SubmitOutcome::Created { job, handle, persist } => {
				let persist = persist.expect("background submissions persist");
				assert_eq!(persist.unique, b"u".to_vec());
				assert_eq!(persist.function, b"f".to_vec());
				(job, handle)
			}
			_ => panic!("expected creation"),
		};
		b.commit_job(job, true);

		let (outcome, _) = b.take_job(ConnId(1), false);
		assert_eq!(assigned_handle(outcome), handle);
		let done = b.work_complete(ConnId(1), &handle, Vec::new()).unwrap();
		let delete = done.delete.expect("durable copy must be deleted");
		assert_eq!(delete.unique, b"u".to_vec());
		b.assert_invariants();
	}

	#[test]
	fn work_fail_retries_until_the_budget_is_spent() {
		let mut b = Broker::new("s1", 1, 0, 0);
		let _w = connect(&mut b, 1);
		b.can_do(ConnId(1), b"f", None);
		let handle = submit(&mut b, None, b"f", b"u", b"x", Priority::Normal);

		let (outcome, _) = b.take_job(ConnId(1), false);
		assert_eq!(assigned_handle(outcome), handle);
		assert!(matches!(b.work_fail(ConnId(1), &handle).unwrap(), FailOutcome::Retried));
		b.assert_invariants();

		let (outcome, _) = b.take_job(ConnId(1), false);
		assert_eq!(assigned_handle(outcome), handle);
		assert!(matches!(b.work_fail(ConnId(1), &handle).unwrap(), FailOutcome::Done { .. }));
		assert_eq!(b.job_status(&handle).0, false);
		b.assert_invariants();
	}

	#[test]
	fn status_passthrough_and_query() {
		let mut b = broker();
		let client_rx = connect(&mut b, 1);
		let _w = connect(&mut b, 2);
		b.can_do(ConnId(2), b"f", None);
		let handle = submit(&mut b, Some(ConnId(1)), b"f", b"u", b"x", Priority::Normal);
		let (_, _) = b.take_job(ConnId(2), false);

		b.work_status(ConnId(2), &handle, b"3".to_vec(), b"10".to_vec()).unwrap();
		let forwarded = recv_packet(&client_rx);
		assert_eq!(forwarded.command, Command::WorkStatus);
		assert_eq!(forwarded.args, vec![handle.clone(), b"3".to_vec(), b"10".to_vec()]);

		let (known, running, num, den) = b.job_status(&handle);
		assert!(known && running);
		assert_eq!((num, den), (b"3".to_vec(), b"10".to_vec()));
	}

	#[test]
	fn exceptions_only_reach_consenting_clients() {
		let mut b = broker();
		let client_rx = connect(&mut b, 1);
		let _w = connect(&mut b, 2);
		b.can_do(ConnId(2), b"f", None);
		let handle = submit(&mut b, Some(ConnId(1)), b"f", b"u", b"x", Priority::Normal);
		let (_, _) = b.take_job(ConnId(2), false);

		b.work_forward(ConnId(2), Command::WorkException, &handle, b"boom".to_vec()).unwrap();
		assert!(client_rx.is_empty(), "client did not negotiate exceptions");

		b.session_mut(ConnId(1)).unwrap().forward_exceptions = true;
		b.work_forward(ConnId(2), Command::WorkException, &handle, b"boom".to_vec()).unwrap();
		assert_eq!(recv_packet(&client_rx).command, Command::WorkException);
	}

	#[test]
	fn work_frames_from_strangers_are_rejected() {
		let mut b = broker();
		let _w = connect(&mut b, 1);
		let _stranger = connect(&mut b, 2);
		b.can_do(ConnId(1), b"f", None);
		let handle = submit(&mut b, None, b"f", b"u", b"x", Priority::Normal);
		let (_, _) = b.take_job(ConnId(1), false);

		assert_eq!(b.work_complete(ConnId(2), &handle, Vec::new()).unwrap_err(), UnknownJob);
		assert_eq!(b.work_complete(ConnId(1), b"H:s1:999", Vec::new()).unwrap_err(), UnknownJob);
		b.assert_invariants();
	}

	#[test]
	fn replayed_jobs_are_queued_and_not_repersisted() {
		let mut b = broker();
		b.set_replaying(true);
		b.replay_job(b"f", b"u1", b"a", Priority::Normal);
		b.replay_job(b"f", b"u2", b"b", Priority::High);
		b.replay_job(b"g", b"u3", b"c", Priority::Low);
		b.set_replaying(false);
		b.assert_invariants();

		let stats = b.function_stats();
		let total: u32 = stats.iter().map(|(_, total, ..)| *total).sum();
		assert_eq!(total, 3);

		// completing a replayed job owes the store a delete
		let _w = connect(&mut b, 1);
		b.can_do(ConnId(1), b"f", None);
		let (outcome, _) = b.take_job(ConnId(1), false);
		let handle = assigned_handle(outcome);
		let done = b.work_complete(ConnId(1), &handle, Vec::new()).unwrap();
		assert!(done.delete.is_some());
	}

	#[test]
	fn cant_do_withdraws_the_capability() {
		let mut b = broker();
		let _w = connect(&mut b, 1);
		b.can_do(ConnId(1), b"f", None);
		submit(&mut b, None, b"f", b"u", b"x", Priority::Normal);
		b.cant_do(ConnId(1), b"f");
		let (outcome, _) = b.take_job(ConnId(1), false);
		assert!(matches!(outcome, TakeOutcome::NoJob));
		b.assert_invariants();
	}

	#[test]
	fn graceful_drain_completes_with_the_last_running_job() {
		let mut b = broker();
		let _w = connect(&mut b, 1);
		b.can_do(ConnId(1), b"f", None);
		let handle = submit(&mut b, None, b"f", b"u", b"x", Priority::Normal);
		let (_, _) = b.take_job(ConnId(1), false);

		assert!(!b.start_draining(), "a job is still running");
		let done = b.work_complete(ConnId(1), &handle, Vec::new()).unwrap();
		assert!(done.drained);
	}
}
