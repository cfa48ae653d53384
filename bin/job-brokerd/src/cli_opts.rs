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

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{load_yaml, App};

use job_broker::queue::QueueKind;

#[derive(Clone)]
pub struct CliOpts {
	pub file: Option<PathBuf>,
	pub log_level: log::LevelFilter,
	pub log_file: Option<PathBuf>,
	pub listen: Option<Vec<String>>,
	pub port: Option<u16>,
	pub threads: Option<usize>,
	pub backlog: Option<i32>,
	pub job_retries: Option<u32>,
	pub worker_wakeup: Option<usize>,
	pub queue_kind: Option<QueueKind>,
	pub queue_file: Option<PathBuf>,
	pub server_id: Option<String>,
}

impl CliOpts {
	pub fn parse() -> Result<Self> {
		let yaml = load_yaml!("cli_opts.yaml");
		let matches = App::from(yaml).get_matches();
		let log_level = match matches.occurrences_of("verbose") {
			0 => log::LevelFilter::Info,
			1 => log::LevelFilter::Debug,
			_ => log::LevelFilter::Trace,
		};
		Ok(CliOpts {
			file: matches.value_of("config").map(PathBuf::from),
			log_level,
			log_file: matches.value_of("log-file").map(PathBuf::from),
			listen: matches
				.values_of("listen")
				.map(|values| values.map(str::to_string).collect()),
			port: parse(&matches, "port")?,
			threads: parse(&matches, "threads")?,
			backlog: parse(&matches, "backlog")?,
			job_retries: parse(&matches, "job-retries")?,
			worker_wakeup: parse(&matches, "worker-wakeup")?,
			queue_kind: matches
				.value_of("queue-type")
				.map(|value| value.parse().map_err(anyhow::Error::msg))
				.transpose()?,
			queue_file: matches.value_of("queue-file").map(PathBuf::from),
			server_id: matches.value_of("server-id").map(str::to_string),
		})
	}
}

fn parse<T>(matches: &clap::ArgMatches, name: &str) -> Result<Option<T>>
where
	T: std::str::FromStr,
	T::Err: std::error::Error + Send + Sync + 'static,
{
	matches
		.value_of(name)
		.map(|value| value.parse().with_context(|| format!("invalid --{}", name)))
		.transpose()
}
