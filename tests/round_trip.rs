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

//! End-to-end scenarios over real sockets: a broker with its I/O threads,
//! exercised by minimal blocking clients speaking the wire protocol.

use std::{
	io::{Read, Write},
	net::{Shutdown, SocketAddr, TcpStream},
	sync::Arc,
	thread,
	time::Duration,
};

use job_broker::{
	protocol::{
		codec::{try_parse, Frame},
		Command, Packet,
	},
	MemoryQueue, Priority, ServerBuilder, ServerHandle,
};

struct Broker {
	handle: ServerHandle,
	addr: SocketAddr,
	join: thread::JoinHandle<()>,
}

fn start(builder: ServerBuilder) -> Broker {
	let server = builder
		.listen(Some(vec!["127.0.0.1".to_string()]))
		.port(Some(0))
		.io_threads(Some(2))
		.server_id(Some("s1".to_string()))
		.build()
		.expect("broker should start");
	let addr = server.local_addrs()[0];
	let handle = server.handle();
	let join = thread::spawn(move || server.run().expect("broker run"));
	Broker { handle, addr, join }
}

impl Broker {
	fn stop(self) {
		self.handle.shutdown(false);
		self.join.join().expect("broker thread");
	}
}

struct Conn {
	stream: TcpStream,
	buf: Vec<u8>,
}

impl Conn {
	fn connect(addr: SocketAddr) -> Self {
		let stream = TcpStream::connect(addr).expect("connect to broker");
		stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
		Self { stream, buf: Vec::new() }
	}

	fn send(&mut self, command: Command, args: &[&[u8]]) {
		let packet = Packet::request(command, args.iter().map(|a| a.to_vec()).collect());
		self.stream.write_all(&packet.encode()).expect("send frame");
	}

	fn send_line(&mut self, line: &str) {
		self.stream.write_all(line.as_bytes()).expect("send line");
		self.stream.write_all(b"\n").expect("send newline");
	}

	fn recv(&mut self) -> Packet {
		loop {
			if let Some(frame) = try_parse(&mut self.buf).expect("well-formed reply") {
				match frame {
					Frame::Packet(packet) => return packet,
					other => panic!("expected a packet, got {:?}", other),
				}
			}
			self.fill();
		}
	}

	/// Read one line of an administrative reply.
	fn recv_line(&mut self) -> String {
		loop {
			if let Some(end) = self.buf.iter().position(|&b| b == b'\n') {
				let line = String::from_utf8(self.buf[..end].to_vec()).unwrap();
				self.buf.drain(..=end);
				return line;
			}
			self.fill();
		}
	}

	fn fill(&mut self) {
		let mut chunk = [0u8; 4096];
		let n = self.stream.read(&mut chunk).expect("read from broker");
		assert!(n > 0, "broker closed the connection unexpectedly");
		self.buf.extend_from_slice(&chunk[..n]);
	}
}

#[test]
fn simple_round_trip() {
	let broker = start(ServerBuilder::new());

	let mut worker = Conn::connect(broker.addr);
	worker.send(Command::CanDo, &[b"reverse"]);
	worker.send(Command::PreSleep, &[]);

	let mut client = Conn::connect(broker.addr);
	client.send(Command::SubmitJob, &[b"reverse", b"", b"hello"]);
	let created = client.recv();
	assert_eq!(created.command, Command::JobCreated);
	let handle = created.args[0].clone();
	assert_eq!(handle, b"H:s1:1".to_vec());

	assert_eq!(worker.recv().command, Command::Noop);
	worker.send(Command::GrabJob, &[]);
	let assign = worker.recv();
	assert_eq!(assign.command, Command::JobAssign);
	assert_eq!(assign.args, vec![handle.clone(), b"reverse".to_vec(), b"hello".to_vec()]);

	worker.send(Command::WorkComplete, &[&handle, b"olleh"]);
	let complete = client.recv();
	assert_eq!(complete.command, Command::WorkComplete);
	assert_eq!(complete.args, vec![handle, b"olleh".to_vec()]);

	broker.stop();
}

#[test]
fn priority_ordering() {
	let broker = start(ServerBuilder::new());

	let mut client = Conn::connect(broker.addr);
	client.send(Command::SubmitJobLowBg, &[b"f", b"", b"low"]);
	assert_eq!(client.recv().command, Command::JobCreated);
	client.send(Command::SubmitJobBg, &[b"f", b"", b"normal"]);
	assert_eq!(client.recv().command, Command::JobCreated);
	client.send(Command::SubmitJobHighBg, &[b"f", b"", b"high"]);
	assert_eq!(client.recv().command, Command::JobCreated);

	let mut worker = Conn::connect(broker.addr);
	worker.send(Command::CanDo, &[b"f"]);
	for expected in [&b"high"[..], &b"normal"[..], &b"low"[..]].iter() {
		worker.send(Command::GrabJob, &[]);
		let assign = worker.recv();
		assert_eq!(assign.command, Command::JobAssign);
		assert_eq!(assign.args[2], expected.to_vec());
	}

	broker.stop();
}

#[test]
fn unique_submissions_deduplicate() {
	let broker = start(ServerBuilder::new());

	let mut client = Conn::connect(broker.addr);
	client.send(Command::SubmitJob, &[b"f", b"u", b"A"]);
	let first = client.recv();
	client.send(Command::SubmitJob, &[b"f", b"u", b"B"]);
	let second = client.recv();
	assert_eq!(first.args[0], second.args[0], "same unique must reuse the job");

	let mut worker = Conn::connect(broker.addr);
	worker.send(Command::CanDo, &[b"f"]);
	worker.send(Command::GrabJobUniq, &[]);
	let assign = worker.recv();
	assert_eq!(assign.command, Command::JobAssignUniq);
	assert_eq!(assign.args[2], b"u".to_vec());
	assert_eq!(assign.args[3], b"A".to_vec(), "the first payload wins");

	broker.stop();
}

#[test]
fn orphaned_foreground_job_is_never_dispatched() {
	let broker = start(ServerBuilder::new());

	let mut client = Conn::connect(broker.addr);
	client.send(Command::SubmitJob, &[b"f", b"u", b"payload"]);
	assert_eq!(client.recv().command, Command::JobCreated);
	client.stream.shutdown(Shutdown::Both).unwrap();
	drop(client);

	// give the broker a moment to observe the disconnect
	thread::sleep(Duration::from_millis(200));

	let mut worker = Conn::connect(broker.addr);
	worker.send(Command::CanDo, &[b"f"]);
	worker.send(Command::GrabJob, &[]);
	assert_eq!(worker.recv().command, Command::NoJob);

	broker.stop();
}

#[test]
fn background_jobs_survive_in_the_durable_queue() {
	let queue = Arc::new(MemoryQueue::new());
	let broker = start(ServerBuilder::new().queue_adapter(queue.clone()));

	let mut client = Conn::connect(broker.addr);
	client.send(Command::SubmitJobBg, &[b"f", b"u", b"payload"]);
	let created = client.recv();
	assert_eq!(created.command, Command::JobCreated);
	assert_eq!(queue.add_calls(), 1);
	assert_eq!(queue.len(), 1);

	let mut worker = Conn::connect(broker.addr);
	worker.send(Command::CanDo, &[b"f"]);
	worker.send(Command::GrabJob, &[]);
	let assign = worker.recv();
	worker.send(Command::WorkComplete, &[&assign.args[0], b""]);

	// the durable record is deleted once the job completes
	for _ in 0..50 {
		if queue.is_empty() {
			break;
		}
		thread::sleep(Duration::from_millis(20));
	}
	assert!(queue.is_empty(), "terminal completion must delete the durable record");

	broker.stop();
}

#[test]
fn replay_reconstructs_without_repersisting() {
	let queue = Arc::new(MemoryQueue::new());
	queue.seed(b"u1", b"f", b"a", Priority::Normal);
	queue.seed(b"u2", b"f", b"b", Priority::High);
	queue.seed(b"u3", b"g", b"c", Priority::Low);

	let broker = start(ServerBuilder::new().queue_adapter(queue.clone()));
	assert_eq!(queue.add_calls(), 0, "replay must not call add");

	let mut worker = Conn::connect(broker.addr);
	worker.send(Command::CanDo, &[b"f"]);
	worker.send(Command::CanDo, &[b"g"]);
	let mut payloads = Vec::new();
	for _ in 0..3 {
		worker.send(Command::GrabJob, &[]);
		let assign = worker.recv();
		assert_eq!(assign.command, Command::JobAssign);
		payloads.push(assign.args[2].clone());
	}
	payloads.sort();
	assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

	worker.send(Command::GrabJob, &[]);
	assert_eq!(worker.recv().command, Command::NoJob, "exactly three jobs replayed");

	broker.stop();
}

#[test]
fn status_frames_pass_through_and_update_the_job() {
	let broker = start(ServerBuilder::new());

	let mut client = Conn::connect(broker.addr);
	client.send(Command::SubmitJob, &[b"f", b"u", b"payload"]);
	let handle = client.recv().args[0].clone();

	let mut worker = Conn::connect(broker.addr);
	worker.send(Command::CanDo, &[b"f"]);
	worker.send(Command::GrabJob, &[]);
	assert_eq!(worker.recv().command, Command::JobAssign);

	worker.send(Command::WorkStatus, &[&handle, b"3", b"10"]);
	let status = client.recv();
	assert_eq!(status.command, Command::WorkStatus);
	assert_eq!(status.args, vec![handle.clone(), b"3".to_vec(), b"10".to_vec()]);

	client.send(Command::GetStatus, &[&handle]);
	let reply = client.recv();
	assert_eq!(reply.command, Command::StatusRes);
	assert_eq!(
		reply.args,
		vec![handle, b"1".to_vec(), b"1".to_vec(), b"3".to_vec(), b"10".to_vec()]
	);

	broker.stop();
}

#[test]
fn echo_and_version() {
	let broker = start(ServerBuilder::new());

	let mut conn = Conn::connect(broker.addr);
	conn.send(Command::EchoReq, &[b"hello"]);
	let echo = conn.recv();
	assert_eq!(echo.command, Command::EchoRes);
	assert_eq!(echo.args[0], b"hello".to_vec());

	conn.send_line("version");
	let line = conn.recv_line();
	assert!(line.starts_with("OK "), "unexpected version reply: {}", line);

	broker.stop();
}

#[test]
fn queue_full_rejects_the_overflow() {
	let broker = start(ServerBuilder::new());

	let mut admin = Conn::connect(broker.addr);
	admin.send_line("maxqueue f 1");
	assert_eq!(admin.recv_line(), "OK");

	let mut client = Conn::connect(broker.addr);
	client.send(Command::SubmitJobBg, &[b"f", b"a", b""]);
	assert_eq!(client.recv().command, Command::JobCreated);
	client.send(Command::SubmitJobBg, &[b"f", b"b", b""]);
	let reply = client.recv();
	assert_eq!(reply.command, Command::Error);
	assert_eq!(reply.args[0], b"queue_full".to_vec());

	broker.stop();
}

#[test]
fn option_request_negotiates_exception_forwarding() {
	let broker = start(ServerBuilder::new());

	let mut client = Conn::connect(broker.addr);
	client.send(Command::OptionReq, &[b"exceptions"]);
	let accepted = client.recv();
	assert_eq!(accepted.command, Command::OptionRes);
	assert_eq!(accepted.args[0], b"exceptions".to_vec());

	client.send(Command::OptionReq, &[b"telemetry"]);
	let rejected = client.recv();
	assert_eq!(rejected.command, Command::Error);
	assert_eq!(rejected.args[0], b"unknown_option".to_vec());

	client.send(Command::SubmitJob, &[b"f", b"u", b"payload"]);
	let handle = client.recv().args[0].clone();

	let mut worker = Conn::connect(broker.addr);
	worker.send(Command::CanDo, &[b"f"]);
	worker.send(Command::GrabJob, &[]);
	assert_eq!(worker.recv().command, Command::JobAssign);

	worker.send(Command::WorkException, &[&handle, b"boom"]);
	let exception = client.recv();
	assert_eq!(exception.command, Command::WorkException);
	assert_eq!(exception.args, vec![handle, b"boom".to_vec()]);

	broker.stop();
}

#[test]
fn can_do_timeout_declares_the_capability() {
	let broker = start(ServerBuilder::new());

	let mut worker = Conn::connect(broker.addr);
	worker.send(Command::CanDoTimeout, &[b"f", b"30"]);
	// a non-numeric timeout is a request-level error, the connection stays up
	worker.send(Command::CanDoTimeout, &[b"g", b"soon"]);
	let rejected = worker.recv();
	assert_eq!(rejected.command, Command::Error);
	assert_eq!(rejected.args[0], b"bad_args".to_vec());

	let mut client = Conn::connect(broker.addr);
	client.send(Command::SubmitJobBg, &[b"f", b"u", b"payload"]);
	assert_eq!(client.recv().command, Command::JobCreated);

	worker.send(Command::GrabJob, &[]);
	let assign = worker.recv();
	assert_eq!(assign.command, Command::JobAssign, "CAN_DO_TIMEOUT must register the capability");
	assert_eq!(assign.args[1], b"f".to_vec());

	broker.stop();
}

#[test]
fn set_client_id_shows_in_the_workers_listing() {
	let broker = start(ServerBuilder::new());

	let mut worker = Conn::connect(broker.addr);
	worker.send(Command::SetClientId, &[b"w-1"]);
	worker.send(Command::CanDo, &[b"reverse"]);
	// echo round-trip so the listing below observes the frames above
	worker.send(Command::EchoReq, &[b"sync"]);
	assert_eq!(worker.recv().command, Command::EchoRes);

	let mut admin = Conn::connect(broker.addr);
	admin.send_line("workers");
	let mut lines = Vec::new();
	loop {
		let line = admin.recv_line();
		if line == "." {
			break;
		}
		lines.push(line);
	}
	assert!(
		lines.iter().any(|l| l.contains(" w-1 :") && l.contains("reverse")),
		"workers listing must carry the client id and functions: {:?}",
		lines
	);

	broker.stop();
}

#[test]
fn all_yours_is_accepted_without_a_response() {
	let broker = start(ServerBuilder::new());

	let mut conn = Conn::connect(broker.addr);
	conn.send(Command::AllYours, &[]);
	conn.send(Command::EchoReq, &[b"after"]);
	let reply = conn.recv();
	// the first frame back is the echo: ALL_YOURS produced nothing
	assert_eq!(reply.command, Command::EchoRes);
	assert_eq!(reply.args[0], b"after".to_vec());

	broker.stop();
}

#[test]
fn oversized_arguments_are_rejected() {
	let broker = start(ServerBuilder::new());

	let long = vec![b'x'; 65];
	let mut conn = Conn::connect(broker.addr);
	conn.send(Command::SubmitJob, &[b"f", &long, b"payload"]);
	let unique_err = conn.recv();
	assert_eq!(unique_err.command, Command::Error);
	assert_eq!(unique_err.args[0], b"args_too_large".to_vec());

	conn.send(Command::WorkComplete, &[&long, b""]);
	let handle_err = conn.recv();
	assert_eq!(handle_err.command, Command::Error);
	assert_eq!(handle_err.args[0], b"args_too_large".to_vec());

	conn.send(Command::GetStatus, &[&long]);
	let status_err = conn.recv();
	assert_eq!(status_err.command, Command::Error);
	assert_eq!(status_err.args[0], b"args_too_large".to_vec());

	broker.stop();
}

#[test]
fn graceful_shutdown_waits_for_the_running_job() {
	let broker = start(ServerBuilder::new());

	let mut client = Conn::connect(broker.addr);
	client.send(Command::SubmitJob, &[b"f", b"u", b"payload"]);
	let handle = client.recv().args[0].clone();

	let mut worker = Conn::connect(broker.addr);
	worker.send(Command::CanDo, &[b"f"]);
	worker.send(Command::GrabJob, &[]);
	assert_eq!(worker.recv().command, Command::JobAssign);

	broker.handle.shutdown(true);
	thread::sleep(Duration::from_millis(200));
	assert!(!broker.join.is_finished(), "broker must wait for the running job");

	worker.send(Command::WorkComplete, &[&handle, b"done"]);
	assert_eq!(client.recv().command, Command::WorkComplete);

	broker.join.join().expect("broker thread");
}
