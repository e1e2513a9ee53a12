//! End-to-end scenarios over loopback TCP.

use std::sync::Arc;
use std::time::{Duration, Instant};

use wirebound::{
	BulkSource, Buffer, Error, IpEndpoint, Patience, Readiness, SocketOptions, TcpConnection,
	TcpEndpoint, TcpListener, TcpSocket,
};

fn loopback_listener(backlog: i32) -> (TcpListener, TcpEndpoint) {
	let endpoint = TcpEndpoint::new(IpEndpoint::LOOPBACK_V4, 0);
	let listener = TcpSocket::bound(endpoint, SocketOptions::default())
		.expect("bind")
		.listen(backlog)
		.expect("listen");
	let local = listener.local().expect("local endpoint");
	(listener, local)
}

fn connect(endpoint: TcpEndpoint) -> TcpConnection {
	let mut patience = Patience::deadline_after(Duration::from_secs(10)).unwrap();
	TcpSocket::new(endpoint.address().version())
		.expect("socket")
		.connect(endpoint, &mut patience)
		.expect("connect")
}

/// Reads and writes back everything until the peer shuts down, then closes
/// gracefully.
fn echo_peer(connection: TcpConnection) {
	let mut patience = Patience::deadline_after(Duration::from_secs(30)).unwrap();
	let mut buffer = Buffer::new();
	loop {
		buffer.reserve(1 << 14);
		let count = connection
			.read_some(buffer.cold(), &mut patience)
			.expect("echo read");
		if count == 0 {
			break;
		}
		buffer.produce(count).unwrap();
		while buffer.available() > 0 {
			let written = connection
				.write_some(buffer.warm(), &mut patience)
				.expect("echo write");
			buffer.consume(written).unwrap();
		}
	}
	connection
		.graceful_close(&mut patience)
		.expect("echo graceful close");
}

#[test]
fn plaintext_echo_roundtrip() {
	let (listener, endpoint) = loopback_listener(1);
	let payload: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();

	std::thread::scope(|scope| {
		scope.spawn(|| {
			let mut patience = Patience::deadline_after(Duration::from_secs(10)).unwrap();
			let connection = listener.accept(&mut patience).expect("accept");
			echo_peer(connection);
		});

		let connection = Arc::new(connect(endpoint));
		let writer = {
			let connection = connection.clone();
			let payload = payload.clone();
			scope.spawn(move || {
				let mut patience = Patience::deadline_after(Duration::from_secs(30)).unwrap();
				connection
					.write_all(&payload, &mut patience)
					.expect("write_all");
			})
		};

		let mut patience = Patience::deadline_after(Duration::from_secs(30)).unwrap();
		let mut received = Vec::with_capacity(payload.len());
		let mut chunk = [0u8; 4096];
		while received.len() < payload.len() {
			let count = connection
				.read_some(&mut chunk, &mut patience)
				.expect("read back");
			assert_ne!(count, 0, "peer closed early after {} bytes", received.len());
			received.extend_from_slice(&chunk[..count]);
		}
		assert_eq!(received, payload);
		writer.join().unwrap();

		let connection = Arc::into_inner(connection).unwrap();
		connection
			.graceful_close(&mut patience)
			.expect("client graceful close");
	});
}

#[test]
fn scatter_write_skips_empty_chunks() {
	let (listener, endpoint) = loopback_listener(1);

	std::thread::scope(|scope| {
		scope.spawn(|| {
			let mut patience = Patience::deadline_after(Duration::from_secs(10)).unwrap();
			let connection = listener.accept(&mut patience).expect("accept");
			let mut received = Vec::new();
			let mut chunk = [0u8; 16];
			loop {
				let count = connection
					.read_some(&mut chunk, &mut patience)
					.expect("read");
				if count == 0 {
					break;
				}
				received.extend_from_slice(&chunk[..count]);
			}
			assert_eq!(received, b"AAABBBB");
			connection.graceful_close(&mut patience).expect("close");
		});

		let connection = connect(endpoint);
		let mut patience = Patience::deadline_after(Duration::from_secs(10)).unwrap();
		let mut parts: [&[u8]; 3] = [b"AAA", b"", b"BBBB"];
		let mut bulk = BulkSource::new(&mut parts);
		assert_eq!(bulk.total(), 7);
		assert_eq!(bulk.count(), 2);
		connection
			.write_all_bulk(&mut bulk, &mut patience)
			.expect("scatter write");
		connection
			.graceful_close(&mut patience)
			.expect("graceful close");
	});
}

#[test]
fn accept_times_out_without_connections() {
	let (listener, _endpoint) = loopback_listener(1);
	let mut patience = Patience::deadline_after(Duration::from_millis(100)).unwrap();
	let start = Instant::now();
	let err = listener.accept(&mut patience).unwrap_err();
	let elapsed = start.elapsed();
	assert!(matches!(err, Error::Timeout(Readiness::Read)), "{err:?}");
	assert!(elapsed >= Duration::from_millis(80), "elapsed {elapsed:?}");
	assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
}

#[test]
fn read_times_out_on_idle_peer() {
	let (listener, endpoint) = loopback_listener(1);
	std::thread::scope(|scope| {
		scope.spawn(|| {
			let mut patience = Patience::infinite();
			let connection = listener.accept(&mut patience).expect("accept");
			// hold the connection open without sending anything until the
			// client has observed its timeout
			std::thread::sleep(Duration::from_millis(500));
			drop(connection);
		});

		let connection = connect(endpoint);
		let mut patience = Patience::deadline_after(Duration::from_millis(100)).unwrap();
		let mut chunk = [0u8; 8];
		let err = connection.read_some(&mut chunk, &mut patience).unwrap_err();
		assert!(matches!(err, Error::Timeout(Readiness::Read)), "{err:?}");
	});
}

/// With the accept backlog saturated, a further handshake gets no answer
/// and the connect attempt runs into its deadline.
#[test]
fn connect_times_out_on_saturated_backlog() {
	let (listener, endpoint) = loopback_listener(1);
	let mut pending = Vec::new();
	let start = Instant::now();
	let mut timed_out = false;
	for _ in 0..16 {
		let socket = TcpSocket::new(endpoint.address().version()).expect("socket");
		let mut patience = Patience::deadline_after(Duration::from_millis(200)).unwrap();
		match socket.connect(endpoint, &mut patience) {
			Ok(connection) => pending.push(connection),
			Err(Error::Timeout(Readiness::Write)) => {
				timed_out = true;
				break;
			},
			Err(err) => panic!("unexpected connect failure: {err:?}"),
		}
	}
	assert!(timed_out, "no connect attempt hit the deadline");
	assert!(start.elapsed() < Duration::from_secs(10));
	drop(pending);
	drop(listener);
}

#[test]
fn contended_accept_times_out_exactly_one_loser() {
	let (listener, endpoint) = loopback_listener(4);
	let listener = Arc::new(listener);

	std::thread::scope(|scope| {
		let accepters: Vec<_> = (0..2)
			.map(|_| {
				let listener = listener.clone();
				scope.spawn(move || {
					let mut patience =
						Patience::steady(Instant::now(), Duration::from_millis(500));
					listener.accept(&mut patience)
				})
			})
			.collect();

		std::thread::sleep(Duration::from_millis(100));
		let client = connect(endpoint);

		let outcomes: Vec<_> = accepters
			.into_iter()
			.map(|handle| handle.join().unwrap())
			.collect();
		let winners = outcomes.iter().filter(|o| o.is_ok()).count();
		let timeouts = outcomes
			.iter()
			.filter(|o| matches!(o, Err(Error::Timeout(_))))
			.count();
		assert_eq!(winners, 1, "exactly one accepter wins: {outcomes:?}");
		assert_eq!(timeouts, 1, "the loser times out: {outcomes:?}");
		drop(outcomes);
		drop(client);

		// the listener remains usable afterwards
		let second = connect(endpoint);
		let mut patience = Patience::deadline_after(Duration::from_secs(5)).unwrap();
		let accepted = listener.accept(&mut patience).expect("listener reusable");
		drop(accepted);
		drop(second);
	});
}

#[test]
fn keepalive_and_qos_apply_cleanly() {
	let (listener, endpoint) = loopback_listener(1);
	std::thread::scope(|scope| {
		scope.spawn(|| {
			let mut patience = Patience::infinite();
			let connection = listener.accept(&mut patience).expect("accept");
			connection
				.keepalive(Duration::from_secs(30), 4, Duration::from_secs(5))
				.expect("keepalive");
			connection
				.qos(wirebound::QosPriority::Class2, wirebound::QosDrop::Low)
				.expect("qos");
			let cpu = connection.incoming_cpu().expect("incoming cpu");
			assert!(cpu >= 0);
			let local = connection.local().expect("local");
			assert_eq!(*local.address(), IpEndpoint::LOOPBACK_V4);
			drop(connection);
		});

		let connection = connect(endpoint);
		assert_eq!(*connection.remote().address(), IpEndpoint::LOOPBACK_V4);
		drop(connection);
	});
}
