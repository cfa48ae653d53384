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

//! SQLite-backed durable queue. One row per background job keyed by
//! (function, unique); job handles are never stored, they are regenerated
//! on replay.

use std::path::Path;

use sqlx::{
	sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
	Row,
};

use super::{PersistentQueue, QueueError, ReplaySink};
use crate::types::Priority;

const CREATE_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS durable_jobs ( \
	function   BLOB    NOT NULL, \
	unique_key BLOB    NOT NULL, \
	data       BLOB    NOT NULL, \
	priority   INTEGER NOT NULL, \
	PRIMARY KEY (function, unique_key) \
)";

pub struct SqliteQueue {
	pool: SqlitePool,
}

impl SqliteQueue {
	pub async fn open(path: &Path) -> Result<Self, QueueError> {
		let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
		let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
		sqlx::query(CREATE_TABLE).execute(&pool).await?;
		log::info!("sqlite queue open at {}", path.display());
		Ok(Self { pool })
	}
}

#[async_trait::async_trait]
impl PersistentQueue for SqliteQueue {
	async fn add(
		&self,
		unique: &[u8],
		function: &[u8],
		data: &[u8],
		priority: Priority,
	) -> Result<(), QueueError> {
		sqlx::query(
			"INSERT OR REPLACE INTO durable_jobs (function, unique_key, data, priority) \
			 VALUES (?1, ?2, ?3, ?4)",
		)
		.bind(function)
		.bind(unique)
		.bind(data)
		.bind(priority.as_u8() as i64)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	// Statements run in autocommit mode; the row is durable once `add`
	// returns.
	async fn flush(&self) -> Result<(), QueueError> {
		Ok(())
	}

	async fn done(&self, unique: &[u8], function: &[u8]) -> Result<(), QueueError> {
		sqlx::query("DELETE FROM durable_jobs WHERE function = ?1 AND unique_key = ?2")
			.bind(function)
			.bind(unique)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn replay(&self, sink: &mut (dyn ReplaySink + Send)) -> Result<u64, QueueError> {
		let rows = sqlx::query("SELECT function, unique_key, data, priority FROM durable_jobs")
			.fetch_all(&self.pool)
			.await?;
		let mut count = 0u64;
		for row in rows {
			let function: Vec<u8> = row.get(0);
			let unique: Vec<u8> = row.get(1);
			let data: Vec<u8> = row.get(2);
			let raw_priority: i64 = row.get(3);
			let priority = Priority::from_u8(raw_priority as u8).ok_or_else(|| {
				QueueError::Corrupt(format!("priority {} out of range", raw_priority))
			})?;
			sink.replay_add(&function, &unique, &data, priority);
			count += 1;
		}
		Ok(count)
	}
}
