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

mod cli_opts;
mod config;

use anyhow::Result;
use job_broker::ServerBuilder;

fn main() -> Result<()> {
	let config = config::Config::new()?;
	job_broker::logger::init(config.cli().log_level, config.log_file())?;

	let server = ServerBuilder::from_config(config.server_config()?).build()?;
	let handle = server.handle();

	let ctrlc = async_ctrlc::CtrlC::new().expect("failed to install the ctrl-c handler");
	std::thread::spawn(move || {
		smol::block_on(ctrlc);
		println!("\nShutting down ...");
		handle.shutdown(true);
	});

	server.run()?;
	Ok(())
}
