use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::buffer::{Buffer, Pool};
use crate::error::{Result, TrestleError};
use crate::instrument::Instrument;
use crate::message::{MessageType, WireMessage, HEADER_SZ};
use crate::profile::Profile;
use crate::rx_portal::{RxPortal, RxRecord};
use crate::seq::Sequence;
use crate::tx_portal::{LocalAck, PeerAck, TxPortal};

/// Wall-clock bound on either side of the HELLO exchange.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const RX_QUEUE_LEN: usize = 1024;

/// Runs once, no matter how the connection ends: user close, CLOSE from
/// the peer, or a failed handshake. Gives the listener its chance to
/// prune the peer index.
pub(crate) struct CloseHook {
    peer: SocketAddr,
    instrument: Arc<dyn Instrument>,
    hook: Option<Box<dyn Fn() + Send + Sync>>,
    done: AtomicBool,
}

impl CloseHook {
    pub(crate) fn run(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            if let Some(hook) = &self.hook {
                hook();
            }
            self.instrument.closed(self.peer);
        }
    }
}

/// A connection that has a peer and a datagram queue but no running
/// workers yet: the handshake happens in this state, and `start` brings
/// the portals up once both sides agree on the initial sequence.
pub(crate) struct Pending {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
    pub profile: Arc<Profile>,
    pub instrument: Arc<dyn Instrument>,
    pub pool: Pool,
    pub seq: Arc<Sequence>,
    pub rx_queue_tx: Sender<WireMessage>,
    pub rx_queue_rx: Receiver<WireMessage>,
    pub closed: Arc<AtomicBool>,
    pub close_hook: Arc<CloseHook>,
}

impl Pending {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        profile: Arc<Profile>,
        instrument: Arc<dyn Instrument>,
        pool: Pool,
        hook: Option<Box<dyn Fn() + Send + Sync>>,
    ) -> Pending {
        let (rx_queue_tx, rx_queue_rx) = bounded(RX_QUEUE_LEN);
        Pending {
            socket,
            peer,
            profile,
            pool,
            seq: Arc::new(Sequence::new(0)),
            rx_queue_tx,
            rx_queue_rx,
            closed: Arc::new(AtomicBool::new(false)),
            close_hook: Arc::new(CloseHook {
                peer,
                instrument: Arc::clone(&instrument),
                hook,
                done: AtomicBool::new(false),
            }),
            instrument,
        }
    }

    /// Aborts a half-open connection: runs the close hook without ever
    /// starting workers.
    pub(crate) fn abort(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_hook.run();
    }

    /// Brings the portals and the receiver loop up. `accepted` is the
    /// peer's handshake sequence; the first DATA the peer sends will be
    /// `accepted + 1`.
    pub(crate) fn start(self, accepted: i32) -> Stream {
        let tx = TxPortal::start(
            Arc::clone(&self.socket),
            self.peer,
            Arc::clone(&self.profile),
            self.pool.clone(),
            Arc::clone(&self.instrument),
        );
        let (rx, data_rx) = RxPortal::start(
            accepted,
            self.pool.clone(),
            tx.ack_out_sender(),
            Arc::clone(&self.instrument),
            self.peer,
        );
        let rx_portal_sz = rx.buffered();

        {
            let rx_queue = self.rx_queue_rx;
            let wm_in = rx.sender();
            let acks = tx.rx_acks_sender();
            let instrument = Arc::clone(&self.instrument);
            let peer = self.peer;
            let closed = Arc::clone(&self.closed);
            let close_hook = Arc::clone(&self.close_hook);
            thread::spawn(move || rxer(rx_queue, wm_in, acks, instrument, peer, closed, close_hook));
        }

        let local = self
            .socket
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        Stream {
            peer: self.peer,
            local,
            seq: self.seq,
            reader: Mutex::new(ReadHalf {
                data_rx,
                current: None,
                rx_portal_sz,
                ack_out: tx.ack_out_sender(),
                update_quantum: self.profile.max_segment_sz,
                consumed_since_update: 0,
            }),
            pool: self.pool,
            profile: self.profile,
            tx,
            closed: self.closed,
            close_hook: self.close_hook,
        }
    }
}

/// Per-connection receiver loop: takes decoded messages from the demux
/// (or the dialer's socket reader) and routes them to the portals.
fn rxer(
    rx_queue: Receiver<WireMessage>,
    wm_in: Sender<WireMessage>,
    acks: Sender<PeerAck>,
    instrument: Arc<dyn Instrument>,
    peer: SocketAddr,
    closed: Arc<AtomicBool>,
    close_hook: Arc<CloseHook>,
) {
    while let Ok(wm) = rx_queue.recv() {
        match wm.message_type() {
            Some(MessageType::Data) => {
                let ranges = match wm.as_data() {
                    Ok((ranges, _)) => ranges,
                    Err(e) => {
                        instrument.read_error(Some(peer), &e);
                        continue;
                    }
                };
                if !ranges.is_empty() {
                    let _ = acks.send(PeerAck {
                        ranges,
                        rx_portal_sz: None,
                    });
                }
                if wm_in.send(wm).is_err() {
                    break;
                }
            }
            Some(MessageType::Ack) => match wm.as_ack() {
                Ok((ranges, rx_portal_sz, _rtt)) => {
                    let _ = acks.send(PeerAck {
                        ranges,
                        rx_portal_sz: Some(rx_portal_sz),
                    });
                }
                Err(e) => instrument.read_error(Some(peer), &e),
            },
            Some(MessageType::Close) => {
                debug!("close from {}", peer);
                closed.store(true, Ordering::SeqCst);
                break;
            }
            Some(_) | None => instrument.unexpected_message_type(peer, wm.raw_type()),
        }
    }
    close_hook.run();
    debug!("rxer for {} exited", peer);
}

struct ReadHalf {
    data_rx: Receiver<RxRecord>,
    current: Option<PartialRecord>,
    rx_portal_sz: Arc<AtomicI64>,
    ack_out: Sender<LocalAck>,
    /// Consuming this many bytes since the last advertisement triggers a
    /// window-update ack, so a drained receiver reopens the peer's send
    /// window even when no new DATA is arriving to ack.
    update_quantum: usize,
    consumed_since_update: usize,
}

struct PartialRecord {
    buffer: Buffer,
    offset: usize,
}

/// A reliable, ordered byte stream to one peer, running over UDP.
///
/// Four workers serve each stream: the transmit loop, the receiver loop,
/// the reassembly loop, and the retransmission monitor. All methods take
/// `&self`; reads are serialized internally.
pub struct Stream {
    peer: SocketAddr,
    local: SocketAddr,
    seq: Arc<Sequence>,
    pool: Pool,
    profile: Arc<Profile>,
    tx: TxPortal,
    reader: Mutex<ReadHalf>,
    closed: Arc<AtomicBool>,
    close_hook: Arc<CloseHook>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("peer", &self.peer)
            .field("local", &self.local)
            .finish()
    }
}

impl Stream {
    /// Blocks until in-order bytes are available, then copies up to
    /// `buf.len()` of them. A record larger than `buf` is consumed across
    /// several calls.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut half = self.reader.lock().unwrap();
        if half.current.is_none() {
            match half.data_rx.recv() {
                Ok(record) => {
                    half.current = Some(PartialRecord {
                        buffer: record.buffer,
                        offset: 0,
                    })
                }
                Err(_) => return Err(TrestleError::Closed),
            }
        }
        let mut exhausted = false;
        let mut n = 0;
        if let Some(record) = half.current.as_mut() {
            n = buf.len().min(record.buffer.used() - record.offset);
            buf[..n].copy_from_slice(&record.buffer.bytes()[record.offset..record.offset + n]);
            record.offset += n;
            exhausted = record.offset >= record.buffer.used();
        }
        if exhausted {
            // drops the record's buffer back to the pool
            half.current = None;
        }
        half.rx_portal_sz.fetch_sub(n as i64, Ordering::Relaxed);
        half.consumed_since_update += n;
        if half.consumed_since_update >= half.update_quantum {
            half.consumed_since_update = 0;
            let sz = half
                .rx_portal_sz
                .load(Ordering::Relaxed)
                .clamp(0, i32::MAX as i64) as i32;
            // best effort; the next read tries again if the queue is full
            let _ = half.ack_out.try_send(LocalAck {
                range: None,
                rx_portal_sz: sz,
            });
        }
        Ok(n)
    }

    /// Segments `buf` into DATA messages and queues them for the transmit
    /// loop, blocking when the queue is full. A transmit failure from an
    /// earlier write surfaces here.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TrestleError::Closed);
        }
        if let Some(e) = self.tx.error() {
            return Err(e);
        }
        for chunk in buf.chunks(self.profile.max_segment_sz) {
            let wm = WireMessage::data(self.seq.next(), chunk, &self.pool)?;
            self.tx.enqueue(wm)?;
        }
        if let Some(e) = self.tx.error() {
            return Err(e);
        }
        Ok(buf.len())
    }

    /// Shuts the stream down. In-flight reads observe buffered data, then
    /// [`TrestleError::Closed`]; writes fail immediately.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.close_hook.run();
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Reserved; deadlines are not yet enforced.
    pub fn set_deadline(&self, _deadline: Option<Duration>) -> Result<()> {
        Ok(())
    }

    /// Reserved; deadlines are not yet enforced.
    pub fn set_read_deadline(&self, _deadline: Option<Duration>) -> Result<()> {
        Ok(())
    }

    /// Reserved; deadlines are not yet enforced.
    pub fn set_write_deadline(&self, _deadline: Option<Duration>) -> Result<()> {
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_hook.run();
    }
}

impl io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Stream::read(self, buf).map_err(into_io)
    }
}

impl io::Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Stream::write(self, buf).map_err(into_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn into_io(err: TrestleError) -> io::Error {
    match err {
        TrestleError::Io(e) => e,
        TrestleError::Closed => io::Error::new(io::ErrorKind::UnexpectedEof, err),
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// Applies the profile's kernel buffer hints to a freshly bound socket.
#[cfg(unix)]
pub(crate) fn configure_socket(socket: &UdpSocket, profile: &Profile) -> Result<()> {
    set_buffer(socket, libc::SO_RCVBUF, profile.rx_buffer_sz)?;
    set_buffer(socket, libc::SO_SNDBUF, profile.tx_buffer_sz)?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn configure_socket(_socket: &UdpSocket, _profile: &Profile) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_buffer(socket: &UdpSocket, opt: libc::c_int, sz: usize) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let value = sz as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            opt,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Decodes one received datagram from pool-backed storage.
pub(crate) fn decode_datagram(bytes_read: usize, mut buffer: Buffer) -> Result<WireMessage> {
    buffer.set_used(bytes_read);
    WireMessage::decode(buffer)
}

/// Pool capacity that fits a header plus one full segment.
pub(crate) fn pool_capacity(profile: &Profile) -> usize {
    HEADER_SZ + profile.max_segment_sz
}

/// Sends an already-encoded message and reports it to the instrument.
pub(crate) fn write_wire_message(
    wm: &WireMessage,
    socket: &UdpSocket,
    peer: SocketAddr,
    instrument: &Arc<dyn Instrument>,
) -> Result<()> {
    socket.send_to(wm.wire_bytes(), peer)?;
    instrument.wire_message_tx(peer, wm);
    Ok(())
}

/// Dialer-side socket reader: decodes datagrams from the connection's
/// peer and feeds the receiver loop. Exits when the stream closes or the
/// queue consumer goes away.
pub(crate) fn socket_reader(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    queue: Sender<WireMessage>,
    pool: Pool,
    instrument: Arc<dyn Instrument>,
    closed: Arc<AtomicBool>,
) {
    if socket
        .set_read_timeout(Some(Duration::from_secs(1)))
        .is_err()
    {
        warn!("reader for {} could not arm its read timeout", peer);
    }
    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let mut buffer = pool.get();
        match socket.recv_from(buffer.raw_mut()) {
            Ok((n, from)) => {
                if from != peer {
                    instrument.unknown_peer(from);
                    continue;
                }
                match decode_datagram(n, buffer) {
                    Ok(wm) => {
                        instrument.wire_message_rx(peer, &wm);
                        if queue.send(wm).is_err() {
                            break;
                        }
                    }
                    Err(e) => instrument.read_error(Some(peer), &e),
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                // recv failures on UDP are frequently transient
                instrument.read_error(None, &e.into());
            }
        }
    }
    debug!("reader for {} exited", peer);
}
