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

#![forbid(unsafe_code)]

pub mod broker;
mod error;
pub mod logger;
pub mod protocol;
pub mod queue;
pub mod server;
mod types;

pub use self::broker::Broker;
pub use self::error::{Error, Result};
pub use self::queue::{MemoryQueue, PersistentQueue, QueueError, QueueSettings, SqliteQueue};
pub use self::server::{Server, ServerBuilder, ServerConfig, ServerHandle};
pub use self::types::{JobHandle, Priority};

#[cfg(test)]
pub(crate) use test::initialize;

#[cfg(test)]
mod test {
	use std::sync::Once;

	static INIT: Once = Once::new();
	/// Guard that should be called at the beginning of every test.
	pub fn initialize() {
		INIT.call_once(|| {
			let _ = pretty_env_logger::try_init();
		});
	}
}
