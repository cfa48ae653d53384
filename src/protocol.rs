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

//! The framed binary protocol spoken on every connection: a 12-byte header
//! (magic, command code, argument-region length, all big-endian) followed by
//! NUL-separated arguments, the last argument unterminated. Lines that do
//! not start with a NUL byte belong to the administrative text protocol and
//! are surfaced as [`codec::Frame::Admin`].

pub mod codec;

use std::fmt;

pub const HEADER_SIZE: usize = 12;
pub const MAX_ARGS: usize = 8;
/// Hard cap on a frame's argument region. Anything larger is treated as a
/// desynchronized stream and closes the connection.
pub const MAX_ARG_REGION: usize = 16 * 1024 * 1024;

pub const REQ_MAGIC: [u8; 4] = *b"\0REQ";
pub const RES_MAGIC: [u8; 4] = *b"\0RES";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Magic {
	Request,
	Response,
}

impl Magic {
	pub fn bytes(self) -> [u8; 4] {
		match self {
			Magic::Request => REQ_MAGIC,
			Magic::Response => RES_MAGIC,
		}
	}
}

macro_rules! commands {
	($($variant:ident = $code:literal, $name:literal, $args:literal;)*) => {
		/// Binary protocol command codes.
		#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
		pub enum Command {
			$($variant,)*
		}

		impl Command {
			pub fn from_code(code: u32) -> Option<Command> {
				match code {
					$($code => Some(Command::$variant),)*
					_ => None,
				}
			}

			pub fn code(self) -> u32 {
				match self {
					$(Command::$variant => $code,)*
				}
			}

			/// Number of arguments this command carries in its argument region.
			pub fn arg_count(self) -> usize {
				match self {
					$(Command::$variant => $args,)*
				}
			}

			pub fn name(self) -> &'static str {
				match self {
					$(Command::$variant => $name,)*
				}
			}
		}
	};
}

commands! {
	CanDo = 1, "CAN_DO", 1;
	CantDo = 2, "CANT_DO", 1;
	ResetAbilities = 3, "RESET_ABILITIES", 0;
	PreSleep = 4, "PRE_SLEEP", 0;
	Noop = 6, "NOOP", 0;
	SubmitJob = 7, "SUBMIT_JOB", 3;
	JobCreated = 8, "JOB_CREATED", 1;
	GrabJob = 9, "GRAB_JOB", 0;
	NoJob = 10, "NO_JOB", 0;
	JobAssign = 11, "JOB_ASSIGN", 3;
	WorkStatus = 12, "WORK_STATUS", 3;
	WorkComplete = 13, "WORK_COMPLETE", 2;
	WorkFail = 14, "WORK_FAIL", 1;
	GetStatus = 15, "GET_STATUS", 1;
	EchoReq = 16, "ECHO_REQ", 1;
	EchoRes = 17, "ECHO_RES", 1;
	SubmitJobBg = 18, "SUBMIT_JOB_BG", 3;
	Error = 19, "ERROR", 2;
	StatusRes = 20, "STATUS_RES", 5;
	SubmitJobHigh = 21, "SUBMIT_JOB_HIGH", 3;
	SetClientId = 22, "SET_CLIENT_ID", 1;
	CanDoTimeout = 23, "CAN_DO_TIMEOUT", 2;
	AllYours = 24, "ALL_YOURS", 0;
	WorkException = 25, "WORK_EXCEPTION", 2;
	OptionReq = 26, "OPTION_REQ", 1;
	OptionRes = 27, "OPTION_RES", 1;
	WorkData = 28, "WORK_DATA", 2;
	WorkWarning = 29, "WORK_WARNING", 2;
	GrabJobUniq = 30, "GRAB_JOB_UNIQ", 0;
	JobAssignUniq = 31, "JOB_ASSIGN_UNIQ", 4;
	SubmitJobHighBg = 32, "SUBMIT_JOB_HIGH_BG", 3;
	SubmitJobLow = 33, "SUBMIT_JOB_LOW", 3;
	SubmitJobLowBg = 34, "SUBMIT_JOB_LOW_BG", 3;
}

impl fmt::Display for Command {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.name())
	}
}

/// A single decoded (or to-be-encoded) protocol frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
	pub magic: Magic,
	pub command: Command,
	pub args: Vec<Vec<u8>>,
}

impl Packet {
	pub fn request(command: Command, args: Vec<Vec<u8>>) -> Self {
		debug_assert_eq!(args.len(), command.arg_count());
		Self { magic: Magic::Request, command, args }
	}

	pub fn response(command: Command, args: Vec<Vec<u8>>) -> Self {
		debug_assert_eq!(args.len(), command.arg_count());
		Self { magic: Magic::Response, command, args }
	}

	/// An `ERROR` response with a machine code and a human message.
	pub fn error(code: &str, message: &str) -> Self {
		Self::response(Command::Error, vec![code.as_bytes().to_vec(), message.as_bytes().to_vec()])
	}

	pub fn arg_region_len(&self) -> usize {
		let data: usize = self.args.iter().map(|a| a.len()).sum();
		data + self.args.len().saturating_sub(1)
	}

	/// Serialize header and argument region into a single buffer.
	pub fn encode(&self) -> Vec<u8> {
		let len = self.arg_region_len();
		let mut buf = Vec::with_capacity(HEADER_SIZE + len);
		buf.extend_from_slice(&self.magic.bytes());
		buf.extend_from_slice(&self.command.code().to_be_bytes());
		buf.extend_from_slice(&(len as u32).to_be_bytes());
		for (i, arg) in self.args.iter().enumerate() {
			if i != 0 {
				buf.push(0);
			}
			buf.extend_from_slice(arg);
		}
		buf
	}
}
