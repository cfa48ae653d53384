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

//! One accepted socket: a reader task decoding frames and running protocol
//! handlers, and a writer task draining the connection's outbound FIFO.
//! Both run on the adopting thread's local executor, so the connection's
//! state machine is never driven from two threads at once.

use std::sync::Arc;

use smol::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpStream,
};

use super::{handlers, Shared};
use crate::{
	broker::Outbound,
	error::Result,
	protocol::codec,
	types::ConnId,
};

const READ_CHUNK: usize = 8 * 1024;

pub(crate) async fn run(
	shared: Arc<Shared>,
	conn: ConnId,
	stream: TcpStream,
	outbound: flume::Receiver<Outbound>,
) {
	let reader = async {
		match read_loop(&shared, conn, stream.clone()).await {
			Ok(()) => log::debug!("conn {} closed by peer", conn),
			Err(e) => log::debug!("conn {} dropped: {}", conn, e),
		}
		// Removing the session drops the broker's outbound sender; the
		// writer flushes whatever is queued and exits.
		let drained = {
			let mut broker = shared.broker.lock();
			broker.remove_session(conn);
			broker.drain_finished()
		};
		if drained {
			let _ = shared.control.send(super::Control::Drained);
		}
	};
	let writer = write_loop(stream.clone(), outbound);
	futures::join!(reader, writer);
}

async fn read_loop(shared: &Arc<Shared>, conn: ConnId, mut stream: TcpStream) -> Result<()> {
	let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
	let mut chunk = [0u8; READ_CHUNK];
	loop {
		while let Some(frame) = codec::try_parse(&mut buf)? {
			handlers::dispatch(shared, conn, frame).await?;
		}
		let n = stream.read(&mut chunk).await?;
		if n == 0 {
			return Ok(());
		}
		buf.extend_from_slice(&chunk[..n]);
	}
}

async fn write_loop(stream: TcpStream, outbound: flume::Receiver<Outbound>) {
	let mut stream = stream;
	while let Ok(entry) = outbound.recv_async().await {
		let bytes = match entry {
			Outbound::Packet(packet) => packet.encode(),
			Outbound::Text(line) => line,
			Outbound::Close => break,
		};
		if stream.write_all(&bytes).await.is_err() {
			break;
		}
	}
	let _ = stream.shutdown(std::net::Shutdown::Both);
}
