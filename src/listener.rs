use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::buffer::Pool;
use crate::conn::{
    configure_socket, decode_datagram, pool_capacity, write_wire_message, Pending, Stream,
    HANDSHAKE_TIMEOUT,
};
use crate::error::{Result, TrestleError};
use crate::instrument::Instrument;
use crate::message::{AckRange, Hello, MessageType, WireMessage};
use crate::peers::PeerIndex;
use crate::profile::{Profile, PROTOCOL_VERSION};

type PeerMap = Arc<Mutex<PeerIndex<Sender<WireMessage>>>>;

/// Accepts trestle connections on one UDP socket.
///
/// A single demux worker decodes every inbound datagram and routes it by
/// peer address; a HELLO from an unknown address spawns a handshake that,
/// on success, lands an established [`Stream`] on the accept queue.
pub struct Listener {
    accept_rx: Receiver<Stream>,
    local: SocketAddr,
    peers: PeerMap,
    closed: Arc<AtomicBool>,
}

pub fn listen(addr: SocketAddr, profile: Profile) -> Result<Listener> {
    profile.validate()?;
    let profile = Arc::new(profile);

    let socket = UdpSocket::bind(addr)?;
    configure_socket(&socket, &profile)?;
    socket.set_read_timeout(Some(Duration::from_secs(1)))?;
    let socket = Arc::new(socket);
    let local = socket.local_addr()?;

    let instrument = profile
        .instrument
        .new_instance(&format!("listener_{}", local), local);
    let pool = Pool::new("listener", pool_capacity(&profile), Arc::clone(&instrument));

    let (accept_tx, accept_rx) = bounded(profile.accept_queue_len);
    let peers: PeerMap = Arc::new(Mutex::new(PeerIndex::with_capacity(
        profile.listener_peers_tree_len,
    )));
    let closed = Arc::new(AtomicBool::new(false));

    {
        let socket = Arc::clone(&socket);
        let peers = Arc::clone(&peers);
        let closed = Arc::clone(&closed);
        let instrument = Arc::clone(&instrument);
        let profile = Arc::clone(&profile);
        thread::spawn(move || demux(socket, pool, peers, accept_tx, profile, instrument, closed));
    }

    Ok(Listener {
        accept_rx,
        local,
        peers,
        closed,
    })
}

impl Listener {
    /// Blocks until a peer completes its handshake.
    pub fn accept(&self) -> Result<Stream> {
        self.accept_rx.recv().map_err(|_| TrestleError::Closed)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Stops the demux worker and drops every tracked peer; established
    /// streams observe [`TrestleError::Closed`] as their queues drain.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.peers.lock().unwrap().clear();
        Ok(())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[allow(clippy::too_many_arguments)]
fn demux(
    socket: Arc<UdpSocket>,
    pool: Pool,
    peers: PeerMap,
    accept_tx: Sender<Stream>,
    profile: Arc<Profile>,
    instrument: Arc<dyn Instrument>,
    closed: Arc<AtomicBool>,
) {
    info!("started");
    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let mut buffer = pool.get();
        let (n, from) = match socket.recv_from(buffer.raw_mut()) {
            Ok(x) => x,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                instrument.read_error(None, &e.into());
                continue;
            }
        };
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let wm = match decode_datagram(n, buffer) {
            Ok(wm) => wm,
            Err(e) => {
                instrument.read_error(Some(from), &e);
                continue;
            }
        };
        instrument.wire_message_rx(from, &wm);

        let route = peers.lock().unwrap().get(&from).cloned();
        if let Some(queue) = route {
            if queue.send(wm).is_err() {
                // the connection tore down without pruning itself
                peers.lock().unwrap().remove(&from);
            }
        } else if wm.message_type() == Some(MessageType::Hello) {
            let socket = Arc::clone(&socket);
            let pool = pool.clone();
            let peers = Arc::clone(&peers);
            let accept_tx = accept_tx.clone();
            let profile = Arc::clone(&profile);
            let instrument = Arc::clone(&instrument);
            thread::spawn(move || {
                handshake(wm, from, socket, pool, peers, accept_tx, profile, instrument)
            });
        } else {
            instrument.unknown_peer(from);
        }
    }
    warn!("exited");
}

/// Server side of the HELLO exchange, run once per new peer.
#[allow(clippy::too_many_arguments)]
fn handshake(
    hello_wm: WireMessage,
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    pool: Pool,
    peers: PeerMap,
    accept_tx: Sender<Stream>,
    profile: Arc<Profile>,
    instrument: Arc<dyn Instrument>,
) {
    let hello = match hello_wm.as_hello() {
        Ok((hello, _)) => hello,
        Err(e) => {
            instrument.connection_error(peer, &e);
            return;
        }
    };
    if hello.version != PROTOCOL_VERSION {
        warn!("rejecting {}: protocol version {}", peer, hello.version);
        instrument.connection_error(peer, &TrestleError::VersionMismatch(hello.version));
        return;
    }

    let hook_peers = Arc::clone(&peers);
    let hook: Box<dyn Fn() + Send + Sync> = Box::new(move || {
        let mut peers = hook_peers.lock().unwrap();
        peers.remove(&peer);
        debug!("removed peer {}, {} remaining", peer, peers.len());
    });
    let pending = Pending::new(
        Arc::clone(&socket),
        peer,
        Arc::clone(&profile),
        Arc::clone(&instrument),
        pool.clone(),
        Some(hook),
    );
    peers
        .lock()
        .unwrap()
        .insert(peer, pending.rx_queue_tx.clone());

    let accepted = hello_wm.seq;
    drop(hello_wm);

    let hello_ack_seq = pending.seq.next();
    let result = respond_and_await_ack(&pending, accepted, hello_ack_seq);
    if let Err(e) = result {
        warn!("handshake with {} failed: {}", peer, e);
        instrument.connection_error(peer, &e);
        pending.abort();
        return;
    }

    let stream = pending.start(accepted);
    if accept_tx.send(stream).is_err() {
        return;
    }
    instrument.connected(peer);
    info!("connection established, peer {}", peer);
}

/// Sends our HELLO (inline-acking the peer's) and waits for the plain ACK
/// that completes the exchange.
fn respond_and_await_ack(pending: &Pending, accepted: i32, hello_ack_seq: i32) -> Result<()> {
    let hello_ack = WireMessage::hello(
        hello_ack_seq,
        Hello {
            version: PROTOCOL_VERSION,
            profile: pending.profile.profile_id,
        },
        Some(AckRange::single(accepted)),
        &pending.pool,
    )?;
    write_wire_message(
        &hello_ack,
        &pending.socket,
        pending.peer,
        &pending.instrument,
    )?;
    debug!("hello (ack {}) -> {}", accepted, pending.peer);

    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let remaining = deadline.saturating_duration_since(Instant::now());
    match pending.rx_queue_rx.recv_timeout(remaining) {
        Ok(wm) => {
            if wm.message_type() != Some(MessageType::Ack) {
                return Err(TrestleError::Handshake(format!(
                    "expected ACK, got type [{}]",
                    wm.raw_type()
                )));
            }
            let (ranges, _rx_portal_sz, _rtt) = wm.as_ack()?;
            if ranges.iter().any(|r| r.contains(hello_ack_seq)) {
                Ok(())
            } else {
                Err(TrestleError::Handshake("invalid hello ack".into()))
            }
        }
        Err(_) => Err(TrestleError::Handshake("timeout awaiting ack".into())),
    }
}
