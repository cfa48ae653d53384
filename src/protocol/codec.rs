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

//! Incremental frame decoding. The connection task appends raw bytes to a
//! buffer and calls [`try_parse`] until it yields `None`; partial frames
//! stay buffered across reads.

use crate::{
	error::{Error, Result},
	protocol::{Command, Magic, Packet, HEADER_SIZE, MAX_ARG_REGION, REQ_MAGIC, RES_MAGIC},
};

/// Administrative lines are short; anything longer is a stray binary stream.
const MAX_ADMIN_LINE: usize = 1024;

/// One unit of inbound traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
	Packet(Packet),
	/// Well-framed packet with an unrecognized command code. The argument
	/// region has been consumed; the peer gets an `ERROR` response.
	Unknown(u32),
	/// Recognized command whose argument region did not split into the
	/// expected argument count.
	Malformed(Command),
	/// A line of the administrative text protocol, terminator stripped.
	Admin(Vec<u8>),
}

/// Try to take one complete frame off the front of `buf`.
///
/// `Ok(None)` means more bytes are needed. `Err` means the stream is
/// desynchronized and the connection must be closed.
pub fn try_parse(buf: &mut Vec<u8>) -> Result<Option<Frame>> {
	if buf.is_empty() {
		return Ok(None);
	}

	// Text magic: the administrative protocol is line-based and never
	// begins with a NUL byte.
	if buf[0] != 0 {
		return parse_admin_line(buf);
	}

	if buf.len() < HEADER_SIZE {
		return Ok(None);
	}
	if buf[..4] != REQ_MAGIC && buf[..4] != RES_MAGIC {
		return Err(Error::Protocol(format!("bad magic {:x?}", &buf[..4])));
	}
	let magic = if buf[..4] == REQ_MAGIC { Magic::Request } else { Magic::Response };
	let code = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
	let len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
	if len > MAX_ARG_REGION {
		return Err(Error::FrameTooLarge(len));
	}
	if buf.len() < HEADER_SIZE + len {
		return Ok(None);
	}

	let region = buf[HEADER_SIZE..HEADER_SIZE + len].to_vec();
	buf.drain(..HEADER_SIZE + len);

	let command = match Command::from_code(code) {
		Some(command) => command,
		None => return Ok(Some(Frame::Unknown(code))),
	};
	match split_args(&region, command.arg_count()) {
		Some(args) => Ok(Some(Frame::Packet(Packet { magic, command, args }))),
		None => Ok(Some(Frame::Malformed(command))),
	}
}

fn parse_admin_line(buf: &mut Vec<u8>) -> Result<Option<Frame>> {
	match buf.iter().position(|&b| b == b'\n') {
		Some(end) => {
			let mut line = buf[..end].to_vec();
			buf.drain(..=end);
			if line.last() == Some(&b'\r') {
				line.pop();
			}
			Ok(Some(Frame::Admin(line)))
		}
		None if buf.len() > MAX_ADMIN_LINE => {
			Err(Error::Protocol("unterminated administrative line".into()))
		}
		None => Ok(None),
	}
}

/// Split an argument region into `count` arguments: `count - 1` of them
/// NUL-terminated, the final one taking the remainder unterminated.
fn split_args(region: &[u8], count: usize) -> Option<Vec<Vec<u8>>> {
	if count == 0 {
		return if region.is_empty() { Some(Vec::new()) } else { None };
	}
	let mut args = Vec::with_capacity(count);
	let mut rest = region;
	for _ in 0..count - 1 {
		let sep = rest.iter().position(|&b| b == 0)?;
		args.push(rest[..sep].to_vec());
		rest = &rest[sep + 1..];
	}
	args.push(rest.to_vec());
	Some(args)
}
