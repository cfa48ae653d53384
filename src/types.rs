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

use std::fmt;

use serde::Deserialize;

/// Broker-issued job identifier, unique for the lifetime of the process.
/// Format: `<prefix>:<monotonic counter>`.
pub type JobHandle = Vec<u8>;

/// Uniques and handles are bounded byte strings; longer arguments are
/// rejected at the protocol layer.
pub const MAX_UNIQUE_SIZE: usize = 64;
pub const MAX_HANDLE_SIZE: usize = 64;

/// Execution priority of a job. Dispatch drains `High` before `Normal`
/// before `Low` within a function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
	High,
	Normal,
	Low,
}

impl Priority {
	/// All priorities, in dispatch order.
	pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

	pub(crate) fn index(self) -> usize {
		match self {
			Priority::High => 0,
			Priority::Normal => 1,
			Priority::Low => 2,
		}
	}

	pub fn as_u8(self) -> u8 {
		self.index() as u8
	}

	pub fn from_u8(v: u8) -> Option<Self> {
		match v {
			0 => Some(Priority::High),
			1 => Some(Priority::Normal),
			2 => Some(Priority::Low),
			_ => None,
		}
	}
}

impl Default for Priority {
	fn default() -> Self {
		Priority::Normal
	}
}

impl fmt::Display for Priority {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Priority::High => write!(f, "high"),
			Priority::Normal => write!(f, "normal"),
			Priority::Low => write!(f, "low"),
		}
	}
}

/// Identifier of an accepted connection. Doubles as the "fd" column in the
/// administrative `workers` listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ConnId(pub u64);

impl fmt::Display for ConnId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Internal index of a job in the broker registries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct JobId(pub u64);

/// 32-bit incremental mixing hash over a byte string. Keys the by-unique
/// index; zero maps to one so a hash of 0 can mean "unset".
pub(crate) fn key_hash(bytes: &[u8]) -> u32 {
	let mut v: u32 = 0;
	for &b in bytes {
		v = v.wrapping_add(b as u32);
		v = v.wrapping_add(v << 10);
		v ^= v >> 6;
	}
	v = v.wrapping_add(v << 3);
	v ^= v >> 11;
	v = v.wrapping_add(v << 15);
	if v == 0 {
		1
	} else {
		v
	}
}
