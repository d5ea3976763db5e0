use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use trestle::conn::Stream;
use trestle::instrument::{Instrument, InstrumentFactory};
use trestle::{dial, listen, Profile, TrestleError, WireMessage};

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn read_exact(stream: &Stream, total: usize) -> Vec<u8> {
    let mut out = vec![0u8; total];
    let mut off = 0;
    while off < total {
        let n = stream.read(&mut out[off..]).expect("read");
        assert!(n > 0, "read returned no bytes");
        off += n;
    }
    out
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn test_handshake_and_single_segment_each_way() {
    let listener = listen(loopback(), Profile::default()).unwrap();
    let client = dial(listener.local_addr(), Profile::default()).unwrap();
    let server = listener.accept().unwrap();

    assert_eq!(client.peer_addr(), listener.local_addr());
    assert_eq!(server.peer_addr().port(), client.local_addr().port());

    client.write(&[0xaa, 0xbb]).unwrap();
    assert_eq!(read_exact(&server, 2), vec![0xaa, 0xbb]);

    server.write(&[0xcc]).unwrap();
    assert_eq!(read_exact(&client, 1), vec![0xcc]);

    client.close().unwrap();
    server.close().unwrap();
}

#[test]
fn test_large_write_is_segmented_and_reassembled() {
    let listener = listen(loopback(), Profile::default()).unwrap();
    let client = dial(listener.local_addr(), Profile::default()).unwrap();
    let server = listener.accept().unwrap();

    let payload = pattern(100 * 1024);
    let writer_payload = payload.clone();
    let writer = std::thread::spawn(move || {
        client.write(&writer_payload).unwrap();
        client
    });

    let got = read_exact(&server, payload.len());
    assert_eq!(got, payload);
    let client = writer.join().unwrap();

    client.close().unwrap();
}

#[test]
fn test_reads_smaller_than_a_segment_consume_the_remainder() {
    let listener = listen(loopback(), Profile::default()).unwrap();
    let client = dial(listener.local_addr(), Profile::default()).unwrap();
    let server = listener.accept().unwrap();

    client.write(&[1, 2, 3, 4, 5, 6]).unwrap();

    let mut small = [0u8; 2];
    let mut got = Vec::new();
    while got.len() < 6 {
        let n = server.read(&mut small).unwrap();
        got.extend_from_slice(&small[..n]);
    }
    assert_eq!(got, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn test_handshake_times_out_against_a_silent_peer() {
    // a bare socket that never answers
    let silent = UdpSocket::bind(loopback()).unwrap();
    let peer = silent.local_addr().unwrap();

    let started = Instant::now();
    let err = dial(peer, Profile::default()).unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, TrestleError::Handshake(_)), "got {:?}", err);
    assert!(elapsed >= Duration::from_secs(4), "gave up too early");
    assert!(elapsed < Duration::from_secs(10), "timeout never fired");
}

#[test]
fn test_write_after_close_fails() {
    let listener = listen(loopback(), Profile::default()).unwrap();
    let client = dial(listener.local_addr(), Profile::default()).unwrap();
    let _server = listener.accept().unwrap();

    client.close().unwrap();
    let err = client.write(&[1]).unwrap_err();
    assert!(matches!(err, TrestleError::Closed));
}

#[test]
fn test_read_surfaces_closed_after_local_shutdown() {
    let listener = listen(loopback(), Profile::default()).unwrap();
    let client = dial(listener.local_addr(), Profile::default()).unwrap();
    let _server = listener.accept().unwrap();

    client.close().unwrap();
    // the reader worker notices within its poll interval and the queue
    // chain winds down
    let mut buf = [0u8; 4];
    let started = Instant::now();
    loop {
        match client.read(&mut buf) {
            Err(TrestleError::Closed) => break,
            Err(e) => panic!("unexpected error: {:?}", e),
            Ok(_) => {}
        }
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "read never observed the shutdown"
        );
    }
}

#[test]
fn test_accept_fails_after_listener_close() {
    let listener = listen(loopback(), Profile::default()).unwrap();
    listener.close().unwrap();
    // once the demux worker exits, the accept queue must report closure
    // rather than block forever
    let err = listener.accept().unwrap_err();
    assert!(matches!(err, TrestleError::Closed));
}

#[derive(Default)]
struct CountingInstrument {
    tx: AtomicU64,
    rx: AtomicU64,
    connected: AtomicU64,
}

impl Instrument for CountingInstrument {
    fn connected(&self, _peer: SocketAddr) {
        self.connected.fetch_add(1, Ordering::Relaxed);
    }
    fn wire_message_tx(&self, _peer: SocketAddr, _wm: &WireMessage) {
        self.tx.fetch_add(1, Ordering::Relaxed);
    }
    fn wire_message_rx(&self, _peer: SocketAddr, _wm: &WireMessage) {
        self.rx.fetch_add(1, Ordering::Relaxed);
    }
}

struct CountingFactory(Arc<CountingInstrument>);

impl InstrumentFactory for CountingFactory {
    fn new_instance(&self, _id: &str, _addr: SocketAddr) -> Arc<dyn Instrument> {
        Arc::clone(&self.0) as Arc<dyn Instrument>
    }
}

#[test]
fn test_instrument_observes_the_wire() {
    let counts = Arc::new(CountingInstrument::default());
    let profile = Profile {
        instrument: Arc::new(CountingFactory(Arc::clone(&counts))),
        ..Profile::default()
    };

    let listener = listen(loopback(), profile.clone()).unwrap();
    let client = dial(listener.local_addr(), profile).unwrap();
    let server = listener.accept().unwrap();

    client.write(&[9, 9, 9]).unwrap();
    assert_eq!(read_exact(&server, 3), vec![9, 9, 9]);

    // both ends connected, and hello/ack/data all crossed the instrument
    let started = Instant::now();
    while counts.connected.load(Ordering::Relaxed) < 2 {
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "connected events never arrived"
        );
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(counts.connected.load(Ordering::Relaxed), 2);
    assert!(counts.tx.load(Ordering::Relaxed) >= 4);
    assert!(counts.rx.load(Ordering::Relaxed) >= 4);
}
