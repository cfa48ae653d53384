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

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::Deserialize;

use job_broker::{queue::QueueSettings, ServerConfig};

use crate::cli_opts::CliOpts;

#[derive(Clone, Debug, Default, Deserialize)]
struct TomlConfig {
	listen: Option<Vec<String>>,
	port: Option<u16>,
	backlog: Option<i32>,
	io_threads: Option<usize>,
	server_id: Option<String>,
	job_retries: Option<u32>,
	worker_wakeup: Option<usize>,
	outbound_soft_limit: Option<usize>,
	queue: Option<QueueSettings>,
}

#[derive(Clone)]
pub struct Config {
	cli: CliOpts,
	toml: TomlConfig,
}

impl Config {
	pub fn new() -> Result<Self> {
		let cli = CliOpts::parse()?;
		let toml = cli.file.clone().map(|f| Self::parse_file(f.as_path())).transpose()?;
		Ok(Self { cli, toml: toml.unwrap_or_default() })
	}

	fn parse_file(path: &Path) -> Result<TomlConfig> {
		let toml_str = std::fs::read_to_string(path)?;
		Ok(toml::from_str(toml_str.as_str())?)
	}

	pub fn cli(&self) -> &CliOpts {
		&self.cli
	}

	pub fn log_file(&self) -> Option<(log::LevelFilter, PathBuf)> {
		self.cli.log_file.clone().map(|path| (log::LevelFilter::Debug, path))
	}

	/// Merge the TOML file and the command line, flags winning.
	pub fn server_config(&self) -> Result<ServerConfig> {
		let mut config = ServerConfig::default();
		let toml = &self.toml;
		if let Some(listen) = &toml.listen {
			config.listen = listen.clone();
		}
		if let Some(port) = toml.port {
			config.port = port;
		}
		if let Some(backlog) = toml.backlog {
			config.backlog = backlog;
		}
		if let Some(threads) = toml.io_threads {
			config.io_threads = threads;
		}
		if let Some(id) = &toml.server_id {
			config.server_id = id.clone();
		}
		if let Some(retries) = toml.job_retries {
			config.job_retries = retries;
		}
		if let Some(wakeup) = toml.worker_wakeup {
			config.worker_wakeup = wakeup;
		}
		if let Some(limit) = toml.outbound_soft_limit {
			config.outbound_soft_limit = limit;
		}
		if let Some(queue) = &toml.queue {
			config.queue = queue.clone();
		}

		let cli = &self.cli;
		if let Some(listen) = &cli.listen {
			config.listen = listen.clone();
		}
		if let Some(port) = cli.port {
			config.port = port;
		}
		if let Some(backlog) = cli.backlog {
			config.backlog = backlog;
		}
		if let Some(threads) = cli.threads {
			config.io_threads = threads;
		}
		if let Some(id) = &cli.server_id {
			config.server_id = id.clone();
		}
		if let Some(retries) = cli.job_retries {
			config.job_retries = retries;
		}
		if let Some(wakeup) = cli.worker_wakeup {
			config.worker_wakeup = wakeup;
		}
		if let Some(kind) = cli.queue_kind {
			config.queue.kind = kind;
		}
		if let Some(file) = &cli.queue_file {
			config.queue.file = Some(file.clone());
		}

		if config.io_threads == 0 {
			bail!("at least one I/O thread is required");
		}
		Ok(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use job_broker::queue::QueueKind;

	#[test]
	fn toml_round_trip() {
		let parsed: TomlConfig = toml::from_str(
			r#"
			port = 4731
			io_threads = 2
			server_id = "s1"

			[queue]
			kind = "sqlite"
			file = "/tmp/queue.db"
			"#,
		)
		.unwrap();
		assert_eq!(parsed.port, Some(4731));
		assert_eq!(parsed.io_threads, Some(2));
		assert_eq!(parsed.queue.as_ref().unwrap().kind, QueueKind::Sqlite);
	}
}
