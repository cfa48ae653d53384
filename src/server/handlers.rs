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

//! Per-command protocol effects. Each handler locks the broker for the
//! in-memory transition and talks to the persistent queue outside the
//! lock; request-level failures become `ERROR` responses, never closed
//! connections.

use std::sync::Arc;

use super::{admin, Control, Shared};
use crate::{
	broker::{FailOutcome, SubmitOutcome, TakeOutcome},
	error::Result,
	protocol::{codec::Frame, Command, Packet},
	types::{ConnId, Priority, MAX_HANDLE_SIZE, MAX_UNIQUE_SIZE},
};

pub(crate) async fn dispatch(shared: &Arc<Shared>, conn: ConnId, frame: Frame) -> Result<()> {
	match frame {
		Frame::Admin(line) => {
			admin::handle(shared, conn, &line);
			Ok(())
		}
		Frame::Unknown(code) => {
			log::warn!("conn {} sent unknown command code {}", conn, code);
			respond(shared, conn, Packet::error("unknown_command", "Unknown server command"));
			Ok(())
		}
		Frame::Malformed(command) => {
			log::warn!("conn {} sent {} with a bad argument region", conn, command);
			respond(shared, conn, Packet::error("bad_args", "Arguments do not match command"));
			Ok(())
		}
		Frame::Packet(packet) => handle_packet(shared, conn, packet).await,
	}
}

async fn handle_packet(shared: &Arc<Shared>, conn: ConnId, packet: Packet) -> Result<()> {
	log::trace!("conn {} -> {}", conn, packet.command);
	let command = packet.command;
	let mut args = packet.args;
	match command {
		Command::SubmitJob => submit(shared, conn, args, Priority::Normal, false).await,
		Command::SubmitJobBg => submit(shared, conn, args, Priority::Normal, true).await,
		Command::SubmitJobHigh => submit(shared, conn, args, Priority::High, false).await,
		Command::SubmitJobHighBg => submit(shared, conn, args, Priority::High, true).await,
		Command::SubmitJobLow => submit(shared, conn, args, Priority::Low, false).await,
		Command::SubmitJobLowBg => submit(shared, conn, args, Priority::Low, true).await,

		Command::GrabJob => grab(shared, conn, false).await,
		Command::GrabJobUniq => grab(shared, conn, true).await,
		Command::PreSleep => {
			shared.broker.lock().pre_sleep(conn);
			Ok(())
		}

		Command::CanDo => {
			shared.broker.lock().can_do(conn, &args[0], None);
			Ok(())
		}
		Command::CanDoTimeout => {
			match ascii_u64(&args[1]) {
				Some(timeout) => shared.broker.lock().can_do(conn, &args[0], Some(timeout)),
				None => respond(shared, conn, Packet::error("bad_args", "Timeout is not a number")),
			}
			Ok(())
		}
		Command::CantDo => {
			shared.broker.lock().cant_do(conn, &args[0]);
			Ok(())
		}
		Command::ResetAbilities => {
			shared.broker.lock().reset_abilities(conn);
			Ok(())
		}

		Command::WorkData | Command::WorkWarning | Command::WorkException => {
			let payload = args.pop().expect("codec validated arity; qed");
			let handle = args.pop().expect("codec validated arity; qed");
			if oversized_handle(shared, conn, &handle) {
				return Ok(());
			}
			if shared.broker.lock().work_forward(conn, command, &handle, payload).is_err() {
				respond_job_not_found(shared, conn);
			}
			Ok(())
		}
		Command::WorkStatus => {
			let denominator = args.pop().expect("codec validated arity; qed");
			let numerator = args.pop().expect("codec validated arity; qed");
			let handle = args.pop().expect("codec validated arity; qed");
			if oversized_handle(shared, conn, &handle) {
				return Ok(());
			}
			if shared.broker.lock().work_status(conn, &handle, numerator, denominator).is_err() {
				respond_job_not_found(shared, conn);
			}
			Ok(())
		}
		Command::WorkComplete => {
			let data = args.pop().expect("codec validated arity; qed");
			let handle = args.pop().expect("codec validated arity; qed");
			if oversized_handle(shared, conn, &handle) {
				return Ok(());
			}
			work_complete(shared, conn, handle, data).await
		}
		Command::WorkFail => {
			let handle = args.pop().expect("codec validated arity; qed");
			if oversized_handle(shared, conn, &handle) {
				return Ok(());
			}
			work_fail(shared, conn, handle).await
		}

		Command::GetStatus => {
			let handle = args.pop().expect("codec validated arity; qed");
			if oversized_handle(shared, conn, &handle) {
				return Ok(());
			}
			let (known, running, numerator, denominator) = shared.broker.lock().job_status(&handle);
			respond(
				shared,
				conn,
				Packet::response(
					Command::StatusRes,
					vec![handle, flag(known), flag(running), numerator, denominator],
				),
			);
			Ok(())
		}
		Command::EchoReq => {
			let payload = args.pop().expect("codec validated arity; qed");
			respond(shared, conn, Packet::response(Command::EchoRes, vec![payload]));
			Ok(())
		}
		Command::SetClientId => {
			let id = args.pop().expect("codec validated arity; qed");
			if let Some(s) = shared.broker.lock().session_mut(conn) {
				s.client_id = Some(id);
			}
			Ok(())
		}
		Command::OptionReq => {
			let option = args.pop().expect("codec validated arity; qed");
			if option == b"exceptions" {
				if let Some(s) = shared.broker.lock().session_mut(conn) {
					s.forward_exceptions = true;
				}
				respond(shared, conn, Packet::response(Command::OptionRes, vec![option]));
			} else {
				respond(shared, conn, Packet::error("unknown_option", "Server option not recognized"));
			}
			Ok(())
		}
		// reserved for worker affinity; accepted and ignored
		Command::AllYours => Ok(()),

		// response-only commands arriving inbound
		_ => {
			log::warn!("conn {} sent response-only command {}", conn, command);
			respond(shared, conn, Packet::error("unknown_command", "Command not expected from a peer"));
			Ok(())
		}
	}
}

/// `SUBMIT_JOB*`: dedup or create, write background jobs through to the
/// durable queue, then make the job takeable and wake workers.
async fn submit(
	shared: &Arc<Shared>,
	conn: ConnId,
	mut args: Vec<Vec<u8>>,
	priority: Priority,
	background: bool,
) -> Result<()> {
	let data = args.pop().expect("codec validated arity; qed");
	let unique = args.pop().expect("codec validated arity; qed");
	let function = args.pop().expect("codec validated arity; qed");
	if unique.len() > MAX_UNIQUE_SIZE {
		respond(shared, conn, Packet::error("args_too_large", "Unique value is too large"));
		return Ok(());
	}

	let client = if background { None } else { Some(conn) };
	let outcome = shared.broker.lock().prepare_job(client, &function, &unique, &data, priority);
	match outcome {
		SubmitOutcome::Existing { handle } => {
			respond(shared, conn, Packet::response(Command::JobCreated, vec![handle]));
		}
		SubmitOutcome::QueueFull => {
			respond(shared, conn, Packet::error("queue_full", "Job queue is full"));
		}
		SubmitOutcome::Created { job, handle, persist } => {
			if let (Some(record), Some(queue)) = (persist, shared.queue.as_ref()) {
				let stored = async {
					queue
						.add(&record.unique, &record.function, &record.data, record.priority)
						.await?;
					queue.flush().await
				}
				.await;
				if let Err(e) = stored {
					log::error!("persistent queue rejected job: {}", e);
					// best-effort cleanup of a half-written record
					let _ = queue.done(&record.unique, &record.function).await;
					shared.broker.lock().abort_job(job);
					respond(shared, conn, Packet::error("queue_error", "Could not persist job"));
					return Ok(());
				}
				shared.broker.lock().commit_job(job, true);
			} else {
				shared.broker.lock().commit_job(job, false);
			}
			respond(shared, conn, Packet::response(Command::JobCreated, vec![handle]));
		}
	}
	Ok(())
}

/// `GRAB_JOB[_UNIQ]`: assign the next eligible job, deleting durable
/// copies of any IGNORE'd jobs reaped along the way.
async fn grab(shared: &Arc<Shared>, conn: ConnId, with_unique: bool) -> Result<()> {
	let (outcome, reaped) = shared.broker.lock().take_job(conn, with_unique);
	if let Some(queue) = shared.queue.as_ref() {
		for delete in &reaped {
			if let Err(e) = queue.done(&delete.unique, &delete.function).await {
				log::error!("persistent queue done failed for reaped job: {}", e);
			}
		}
	}
	match outcome {
		TakeOutcome::Assigned(packet) => respond(shared, conn, packet),
		TakeOutcome::NoJob => respond(shared, conn, Packet::response(Command::NoJob, Vec::new())),
	}
	Ok(())
}

async fn work_complete(shared: &Arc<Shared>, conn: ConnId, handle: Vec<u8>, data: Vec<u8>) -> Result<()> {
	let outcome = shared.broker.lock().work_complete(conn, &handle, data);
	match outcome {
		Ok(done) => {
			if let (Some(delete), Some(queue)) = (done.delete, shared.queue.as_ref()) {
				if let Err(e) = queue.done(&delete.unique, &delete.function).await {
					log::error!("persistent queue done failed: {}", e);
				}
			}
			if done.drained {
				let _ = shared.control.send(Control::Drained);
			}
		}
		Err(_) => respond_job_not_found(shared, conn),
	}
	Ok(())
}

async fn work_fail(shared: &Arc<Shared>, conn: ConnId, handle: Vec<u8>) -> Result<()> {
	let outcome = shared.broker.lock().work_fail(conn, &handle);
	match outcome {
		Ok(FailOutcome::Retried) => {}
		Ok(FailOutcome::Done { delete, drained }) => {
			if let (Some(delete), Some(queue)) = (delete, shared.queue.as_ref()) {
				if let Err(e) = queue.done(&delete.unique, &delete.function).await {
					log::error!("persistent queue done failed: {}", e);
				}
			}
			if drained {
				let _ = shared.control.send(Control::Drained);
			}
		}
		Err(_) => respond_job_not_found(shared, conn),
	}
	Ok(())
}

fn respond(shared: &Shared, conn: ConnId, packet: Packet) {
	if let Some(session) = shared.broker.lock().session(conn) {
		session.send(packet);
	}
}

fn respond_job_not_found(shared: &Shared, conn: ConnId) {
	respond(shared, conn, Packet::error("job_not_found", "Job given in work result not found"));
}

/// Handles are broker-issued and bounded; anything longer is a bad argument.
fn oversized_handle(shared: &Shared, conn: ConnId, handle: &[u8]) -> bool {
	if handle.len() > MAX_HANDLE_SIZE {
		respond(shared, conn, Packet::error("args_too_large", "Job handle is too large"));
		return true;
	}
	false
}

fn flag(value: bool) -> Vec<u8> {
	if value {
		b"1".to_vec()
	} else {
		b"0".to_vec()
	}
}

fn ascii_u64(bytes: &[u8]) -> Option<u64> {
	std::str::from_utf8(bytes).ok()?.parse().ok()
}
