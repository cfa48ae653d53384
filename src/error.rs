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

use std::io;

use thiserror::Error;

use crate::queue::QueueError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Broker Error Enum
#[derive(Debug, Error)]
pub enum Error {
	// Rust std io error
	#[error(transparent)]
	Io(#[from] io::Error),

	// wire-level error; closes the offending connection
	#[error("protocol desync: {0}")]
	Protocol(String),

	#[error("frame of {0} bytes exceeds the maximum argument region")]
	FrameTooLarge(usize),

	// persistent queue error
	#[error("persistent queue: {0}")]
	Queue(#[from] QueueError),

	// channel error
	#[error("sending on a disconnected channel")]
	Channel,

	#[error("{0}")]
	Shutdown(String),

	#[error("invalid configuration: {0}")]
	Config(String),
}

impl<T> From<flume::SendError<T>> for Error {
	fn from(_: flume::SendError<T>) -> Self {
		Self::Channel
	}
}

impl From<flume::RecvError> for Error {
	fn from(_: flume::RecvError) -> Self {
		Self::Channel
	}
}
