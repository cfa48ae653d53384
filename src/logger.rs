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

//! logging

use std::{io, path::PathBuf};

use fern::colors::{Color, ColoredLevelConfig};

pub fn init(std: log::LevelFilter, file: Option<(log::LevelFilter, PathBuf)>) -> io::Result<()> {
	let colors = ColoredLevelConfig::new()
		.info(Color::Green)
		.warn(Color::Yellow)
		.error(Color::Red)
		.debug(Color::Blue)
		.trace(Color::Magenta);

	let stdout_dispatcher = fern::Dispatch::new()
		.level_for("job_broker", std)
		.level_for("sqlx", log::LevelFilter::Error)
		.level_for("async_io", log::LevelFilter::Warn)
		.level_for("polling", log::LevelFilter::Warn)
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} {} {}",
				chrono::Local::now().format("[%H:%M]"),
				colors.color(record.level()),
				message,
			))
		})
		.chain(fern::Dispatch::new().level(std).chain(std::io::stdout()));

	let dispatcher = fern::Dispatch::new().chain(stdout_dispatcher);
	let dispatcher = if let Some((level, path)) = file {
		dispatcher.chain(
			fern::Dispatch::new()
				.level(level)
				.level_for("job_broker", level)
				.level_for("sqlx", log::LevelFilter::Warn)
				.format(move |out, message, record| {
					out.finish(format_args!(
						"{} [{}][{}] {}",
						chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
						record.target(),
						record.level(),
						message,
					))
				})
				.chain(fern::log_file(path)?),
		)
	} else {
		dispatcher
	};

	dispatcher.apply().expect("Could not init logging");
	Ok(())
}
