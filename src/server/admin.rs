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

//! Line-based administrative protocol: `workers`, `status`, `maxqueue`,
//! `shutdown [graceful]`, `version`. Listings end with a lone `.` line.

use super::{Control, Shared};
use crate::types::ConnId;

pub(crate) fn handle(shared: &Shared, conn: ConnId, line: &[u8]) {
	let text = String::from_utf8_lossy(line).into_owned();
	let mut parts = text.split_whitespace();
	let reply = match parts.next() {
		Some("status") => status(shared),
		Some("workers") => workers(shared),
		Some("maxqueue") => max_queue(shared, parts.next(), parts.next()),
		Some("shutdown") => {
			let graceful = parts.next() == Some("graceful");
			let _ = shared.control.send(Control::Shutdown { graceful });
			"OK\n".to_string()
		}
		Some("version") => format!("OK {}\n", env!("CARGO_PKG_VERSION")),
		_ => "ERR unknown_command Unknown+server+command\n".to_string(),
	};
	send(shared, conn, reply);
}

fn status(shared: &Shared) -> String {
	let stats = shared.broker.lock().function_stats();
	let mut out = String::new();
	for (name, total, running, workers) in stats {
		out.push_str(&format!(
			"{}\t{}\t{}\t{}\n",
			String::from_utf8_lossy(&name),
			total,
			running,
			workers
		));
	}
	out.push_str(".\n");
	out
}

fn workers(shared: &Shared) -> String {
	let stats = shared.broker.lock().worker_stats();
	let mut out = String::new();
	for (id, peer, client_id, functions) in stats {
		let client_id = client_id
			.map(|id| String::from_utf8_lossy(&id).into_owned())
			.unwrap_or_else(|| "-".to_string());
		out.push_str(&format!("{} {} {} :", id, peer.ip(), client_id));
		for function in functions {
			out.push(' ');
			out.push_str(&String::from_utf8_lossy(&function));
		}
		out.push('\n');
	}
	out.push_str(".\n");
	out
}

fn max_queue(shared: &Shared, function: Option<&str>, size: Option<&str>) -> String {
	let function = match function {
		Some(f) => f,
		None => return "ERR incomplete_args Missing+function+name\n".to_string(),
	};
	// omitting the size resets the function to unbounded
	let size = match size {
		Some(s) => match s.parse::<u32>() {
			Ok(size) => size,
			Err(_) => return "ERR bad_args Queue+size+is+not+a+number\n".to_string(),
		},
		None => 0,
	};
	shared.broker.lock().set_max_queue(function.as_bytes(), size);
	"OK\n".to_string()
}

fn send(shared: &Shared, conn: ConnId, reply: String) {
	if let Some(session) = shared.broker.lock().session(conn) {
		session.send_text(reply.into_bytes());
	}
}
