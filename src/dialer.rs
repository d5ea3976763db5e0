use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, info};

use crate::buffer::Pool;
use crate::conn::{
    configure_socket, decode_datagram, pool_capacity, socket_reader, write_wire_message, Pending,
    Stream, HANDSHAKE_TIMEOUT,
};
use crate::error::{Result, TrestleError};
use crate::message::{AckRange, Hello, MessageType, WireMessage};
use crate::profile::{Profile, PROTOCOL_VERSION};

/// Connects to a listening peer and runs the client side of the HELLO
/// exchange. Returns an established [`Stream`] or a handshake error.
pub fn dial(peer: SocketAddr, profile: Profile) -> Result<Stream> {
    profile.validate()?;
    let profile = Arc::new(profile);

    let bind_addr: SocketAddr = if peer.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind_addr)?;
    configure_socket(&socket, &profile)?;
    let socket = Arc::new(socket);
    let local = socket.local_addr()?;

    let instrument = profile
        .instrument
        .new_instance(&format!("dialer_{}", local), local);
    let pool = Pool::new("dialer", pool_capacity(&profile), Arc::clone(&instrument));

    let pending = Pending::new(
        Arc::clone(&socket),
        peer,
        Arc::clone(&profile),
        Arc::clone(&instrument),
        pool.clone(),
        None,
    );

    let hello_seq = pending.seq.next();
    let hello = WireMessage::hello(
        hello_seq,
        Hello {
            version: PROTOCOL_VERSION,
            profile: profile.profile_id,
        },
        None,
        &pool,
    )?;
    write_wire_message(&hello, &socket, peer, &instrument)?;
    debug!("hello -> {}", peer);

    let hello_ack = match await_hello_ack(&socket, peer, &pool, hello_seq, &instrument) {
        Ok(wm) => wm,
        Err(e) => {
            instrument.connection_error(peer, &e);
            return Err(e);
        }
    };
    let accepted = hello_ack.seq;
    socket.set_read_timeout(None)?;

    let ack = WireMessage::ack(&[AckRange::single(accepted)], 0, None, &pool)?;
    write_wire_message(&ack, &socket, peer, &instrument)?;
    debug!("ack -> {}", peer);

    let reader_socket = Arc::clone(&socket);
    let reader_queue = pending.rx_queue_tx.clone();
    let reader_pool = pool.clone();
    let reader_instrument = Arc::clone(&instrument);
    let reader_closed = Arc::clone(&pending.closed);
    thread::spawn(move || {
        socket_reader(
            reader_socket,
            peer,
            reader_queue,
            reader_pool,
            reader_instrument,
            reader_closed,
        )
    });

    let stream = pending.start(accepted);
    instrument.connected(peer);
    info!("connection established, peer {}", peer);
    Ok(stream)
}

/// Waits up to the handshake timeout for a HELLO whose inline ack closes
/// the loop on our own hello sequence.
fn await_hello_ack(
    socket: &UdpSocket,
    peer: SocketAddr,
    pool: &Pool,
    hello_seq: i32,
    instrument: &Arc<dyn crate::instrument::Instrument>,
) -> Result<WireMessage> {
    socket.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

    loop {
        if Instant::now() >= deadline {
            return Err(TrestleError::Handshake("timeout awaiting hello ack".into()));
        }
        let mut buffer = pool.get();
        let (n, from) = match socket.recv_from(buffer.raw_mut()) {
            Ok(x) => x,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(TrestleError::Handshake("timeout awaiting hello ack".into()));
            }
            Err(e) => return Err(e.into()),
        };
        if from != peer {
            instrument.unknown_peer(from);
            continue;
        }
        let wm = match decode_datagram(n, buffer) {
            Ok(wm) => wm,
            Err(e) => {
                instrument.read_error(Some(peer), &e);
                continue;
            }
        };
        instrument.wire_message_rx(peer, &wm);

        if wm.message_type() != Some(MessageType::Hello) {
            return Err(TrestleError::Handshake(format!(
                "unexpected response type [{}]",
                wm.raw_type()
            )));
        }
        let (hello, acks) = wm.as_hello()?;
        if hello.version != PROTOCOL_VERSION {
            return Err(TrestleError::VersionMismatch(hello.version));
        }
        match acks.first() {
            Some(ack) if ack.end == hello_seq => return Ok(wm),
            _ => return Err(TrestleError::Handshake("invalid hello ack".into())),
        }
    }
}
