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

//! Durable storage behind background jobs. The broker drives adapters
//! through a four-operation contract and never interprets their contents:
//! `add` before a job becomes takeable, `flush` as the commit boundary,
//! `done` after terminal completion or rollback, `replay` once at startup.

mod mem;
mod sqlite;

use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

pub use self::{mem::MemoryQueue, sqlite::SqliteQueue};
use crate::types::Priority;

#[derive(Debug, Error)]
pub enum QueueError {
	#[error("sqlx error: {0}")]
	Sql(#[from] sqlx::Error),
	#[error("corrupt durable record: {0}")]
	Corrupt(String),
	#[error("{0}")]
	Backend(String),
}

/// Receives reconstructed jobs during startup replay. The broker-side
/// implementation re-creates each job with its replay flag set, so nothing
/// is written back to the adapter.
pub trait ReplaySink {
	fn replay_add(&mut self, function: &[u8], unique: &[u8], data: &[u8], priority: Priority);
}

#[async_trait::async_trait]
pub trait PersistentQueue: Send + Sync {
	/// Persist one freshly created background job.
	async fn add(
		&self,
		unique: &[u8],
		function: &[u8],
		data: &[u8],
		priority: Priority,
	) -> Result<(), QueueError>;

	/// Commit boundary: `add` + `flush` make the record durable.
	async fn flush(&self) -> Result<(), QueueError>;

	/// Drop the record for a job that reached terminal status (or whose
	/// creation is being rolled back).
	async fn done(&self, unique: &[u8], function: &[u8]) -> Result<(), QueueError>;

	/// Iterate every persisted job into `sink`. Returns how many records
	/// were replayed.
	async fn replay(&self, sink: &mut (dyn ReplaySink + Send)) -> Result<u64, QueueError>;
}

/// Which durable backend to install, from config/CLI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
	None,
	Sqlite,
}

impl Default for QueueKind {
	fn default() -> Self {
		QueueKind::None
	}
}

impl std::str::FromStr for QueueKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"none" => Ok(QueueKind::None),
			"sqlite" => Ok(QueueKind::Sqlite),
			other => Err(format!("unknown queue type `{}`", other)),
		}
	}
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct QueueSettings {
	#[serde(default)]
	pub kind: QueueKind,
	/// backend-specific location, e.g. the SQLite database file
	#[serde(default)]
	pub file: Option<PathBuf>,
}

/// Construct the configured adapter, if any.
pub async fn init(settings: &QueueSettings) -> Result<Option<Arc<dyn PersistentQueue>>, QueueError> {
	match settings.kind {
		QueueKind::None => Ok(None),
		QueueKind::Sqlite => {
			let file = settings
				.file
				.as_ref()
				.ok_or_else(|| QueueError::Backend("sqlite queue requires a file path".into()))?;
			let queue = SqliteQueue::open(file).await?;
			Ok(Some(Arc::new(queue)))
		}
	}
}
