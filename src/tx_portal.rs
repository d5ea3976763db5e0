use std::collections::BTreeMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::select;
use tracing::{debug, error};

use crate::buffer::Pool;
use crate::error::{Result, TrestleError};
use crate::instrument::Instrument;
use crate::message::{encode_acks, AckList, AckRange, WireMessage, FLAG_INLINE_ACK, INLINE_ACK_SZ};
use crate::profile::Profile;
use crate::retransmitter::Retransmitter;

pub(crate) const TX_QUEUE_LEN: usize = 1024;
const RX_ACKS_LEN: usize = 4 * 1024;
const ACK_OUT_LEN: usize = 1024;
const RETX_EVENTS_LEN: usize = 1024;
const TX_ERRORS_LEN: usize = 1;

/// Ack information received from the peer, routed in by the receiver loop.
/// `rx_portal_sz` is present only when it arrived in an ACK message;
/// inline acks carry ranges alone.
#[derive(Debug)]
pub struct PeerAck {
    pub ranges: AckList,
    pub rx_portal_sz: Option<i32>,
}

/// An ack produced by the local rx side, awaiting piggyback or standalone
/// emission. `range` is `None` for a pure window update: the reader
/// drained buffered bytes and the peer should learn the new figure even
/// though no fresh sequence needs acknowledging.
#[derive(Debug, Clone, Copy)]
pub struct LocalAck {
    pub range: Option<AckRange>,
    pub rx_portal_sz: i32,
}

/// Handle to the per-connection transmit worker.
///
/// The worker owns the in-flight window and all window-evolution state;
/// the handle only feeds its queues. Write-path failures land in a
/// single-slot error channel surfaced by [`TxPortal::error`].
pub struct TxPortal {
    tx_queue: Sender<WireMessage>,
    rx_acks: Sender<PeerAck>,
    ack_out: Sender<LocalAck>,
    errors: Receiver<TrestleError>,
}

impl TxPortal {
    pub fn start(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        profile: Arc<Profile>,
        pool: Pool,
        instrument: Arc<dyn Instrument>,
    ) -> TxPortal {
        let (tx_queue, tx_queue_rx) = bounded(TX_QUEUE_LEN);
        let (rx_acks, rx_acks_rx) = bounded(RX_ACKS_LEN);
        let (ack_out, ack_out_rx) = bounded(ACK_OUT_LEN);
        let (errors_tx, errors) = bounded(TX_ERRORS_LEN);
        let (retx_events_tx, retx_events_rx) = bounded(RETX_EVENTS_LEN);

        let retx = Retransmitter::start(
            Arc::clone(&socket),
            peer,
            profile.retx_timeout,
            retx_events_tx,
            Arc::clone(&instrument),
        );
        let worker = Worker {
            socket,
            peer,
            capacity: profile.tx_portal_start_sz,
            profile,
            pool,
            instrument,
            retx,
            window: BTreeMap::new(),
            window_used: 0,
            peer_rx_portal_sz: 0,
            successful_acks: 0,
            dup_acks: 0,
            retx_count: 0,
            errors: errors_tx,
        };
        thread::spawn(move || worker.run(tx_queue_rx, rx_acks_rx, ack_out_rx, retx_events_rx));

        TxPortal {
            tx_queue,
            rx_acks,
            ack_out,
            errors,
        }
    }

    /// Queues a DATA message for transmission; blocks when the queue is
    /// full (write-side back-pressure).
    pub fn enqueue(&self, wm: WireMessage) -> Result<()> {
        self.tx_queue.send(wm).map_err(|_| TrestleError::Closed)
    }

    /// Sender the receiver loop uses to route peer acks in.
    pub fn rx_acks_sender(&self) -> Sender<PeerAck> {
        self.rx_acks.clone()
    }

    /// Sender the rx portal uses to deliver locally produced acks.
    pub fn ack_out_sender(&self) -> Sender<LocalAck> {
        self.ack_out.clone()
    }

    /// Takes the pending write-path error, if one occurred.
    pub fn error(&self) -> Option<TrestleError> {
        self.errors.try_recv().ok()
    }
}

struct InFlight {
    wm: Arc<WireMessage>,
    sz: usize,
}

struct Worker {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    profile: Arc<Profile>,
    pool: Pool,
    instrument: Arc<dyn Instrument>,
    retx: Retransmitter,
    window: BTreeMap<i32, InFlight>,
    window_used: usize,
    capacity: usize,
    peer_rx_portal_sz: i32,
    successful_acks: u32,
    dup_acks: u32,
    retx_count: u32,
    errors: Sender<TrestleError>,
}

impl Worker {
    fn run(
        mut self,
        tx_queue: Receiver<WireMessage>,
        rx_acks: Receiver<PeerAck>,
        ack_out: Receiver<LocalAck>,
        retx_events: Receiver<()>,
    ) {
        loop {
            // Only dequeue DATA when a full segment fits under the window;
            // acks and retx notifications always flow.
            if self.available() >= self.profile.max_segment_sz as i64 {
                select! {
                    recv(rx_acks) -> m => match m {
                        Ok(ack) => self.apply_peer_ack(ack),
                        Err(_) => break,
                    },
                    recv(ack_out) -> m => match m {
                        Ok(la) => if self.handle_local_ack(la, &tx_queue).is_err() { break },
                        Err(_) => break,
                    },
                    recv(retx_events) -> m => match m {
                        Ok(()) => self.on_retx(),
                        Err(_) => break,
                    },
                    recv(tx_queue) -> m => match m {
                        Ok(wm) => if self.send_data(wm, &ack_out).is_err() { break },
                        Err(_) => break,
                    },
                }
            } else {
                select! {
                    recv(rx_acks) -> m => match m {
                        Ok(ack) => self.apply_peer_ack(ack),
                        Err(_) => break,
                    },
                    recv(ack_out) -> m => match m {
                        Ok(la) => if self.send_standalone_ack(la).is_err() { break },
                        Err(_) => break,
                    },
                    recv(retx_events) -> m => match m {
                        Ok(()) => self.on_retx(),
                        Err(_) => break,
                    },
                }
            }
        }
        debug!("tx portal for {} exited", self.peer);
    }

    fn available(&self) -> i64 {
        self.capacity as i64 - self.window_used as i64 - self.peer_rx_portal_sz as i64
    }

    /// A locally produced ack: piggyback onto queued DATA when some is
    /// ready to fly, otherwise emit it as a standalone ACK message. Pure
    /// window updates always travel standalone since an inline ack cannot
    /// carry `rx_portal_sz`.
    fn handle_local_ack(
        &mut self,
        la: LocalAck,
        tx_queue: &Receiver<WireMessage>,
    ) -> std::result::Result<(), ()> {
        if la.range.is_some() && self.available() >= self.profile.max_segment_sz as i64 {
            if let Ok(wm) = tx_queue.try_recv() {
                return self.send_data_with_ack(wm, Some(la));
            }
        }
        self.send_standalone_ack(la)
    }

    fn send_data(
        &mut self,
        wm: WireMessage,
        ack_out: &Receiver<LocalAck>,
    ) -> std::result::Result<(), ()> {
        let la = ack_out.try_recv().ok();
        self.send_data_with_ack(wm, la)
    }

    fn send_data_with_ack(
        &mut self,
        mut wm: WireMessage,
        la: Option<LocalAck>,
    ) -> std::result::Result<(), ()> {
        let sz = wm.data_len();
        if let Some(la) = la {
            match la.range {
                Some(range) => {
                    let mut block = [0u8; INLINE_ACK_SZ];
                    // encoding into a scratch block this size cannot fail
                    let _ = encode_acks(&[range], &mut block);
                    if wm.insert_data(&block).is_ok() {
                        wm.set_flag(FLAG_INLINE_ACK);
                    } else {
                        // no room left in the segment; ack travels alone
                        self.send_standalone_ack(la)?;
                    }
                }
                None => self.send_standalone_ack(la)?,
            }
        }
        if let Err(e) = self.socket.send_to(wm.wire_bytes(), self.peer) {
            return self.terminal(e.into());
        }
        self.instrument.wire_message_tx(self.peer, &wm);
        let seq = wm.seq;
        let wm = Arc::new(wm);
        self.retx.monitor(Arc::clone(&wm));
        self.window.insert(seq, InFlight { wm, sz });
        self.window_used += sz;
        Ok(())
    }

    fn send_standalone_ack(&mut self, la: LocalAck) -> std::result::Result<(), ()> {
        let ranges: &[AckRange] = match &la.range {
            Some(range) => std::slice::from_ref(range),
            None => &[],
        };
        let wm = match WireMessage::ack(ranges, la.rx_portal_sz, None, &self.pool) {
            Ok(wm) => wm,
            Err(e) => return self.terminal(e),
        };
        if let Err(e) = self.socket.send_to(wm.wire_bytes(), self.peer) {
            return self.terminal(e.into());
        }
        self.instrument.wire_message_tx(self.peer, &wm);
        Ok(())
    }

    fn terminal(&mut self, err: TrestleError) -> std::result::Result<(), ()> {
        error!("tx portal for {}: {}", self.peer, err);
        let _ = self.errors.try_send(err);
        Err(())
    }

    fn apply_peer_ack(&mut self, ack: PeerAck) {
        if let Some(sz) = ack.rx_portal_sz {
            self.peer_rx_portal_sz = sz.max(0);
        }
        for range in &ack.ranges {
            if range.start > range.end {
                continue;
            }
            let acked: Vec<i32> = self
                .window
                .range(range.start..=range.end)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in &acked {
                if let Some(inflight) = self.window.remove(seq) {
                    self.retx.cancel(*seq);
                    self.window_used -= inflight.sz;
                    self.on_successful_ack();
                }
            }
            // anything the range covers that was no longer in flight is a
            // duplicate ack
            let span = (range.end as i64 - range.start as i64 + 1) as u64;
            let dups = span.saturating_sub(acked.len() as u64);
            for _ in 0..dups.min(self.profile.tx_portal_dup_ack_thresh as u64) {
                self.on_dup_ack();
            }
        }
    }

    fn on_successful_ack(&mut self) {
        self.successful_acks += 1;
        if self.successful_acks >= self.profile.tx_portal_increase_thresh {
            self.successful_acks = 0;
            let step =
                (self.profile.tx_portal_increase_scale * self.profile.max_segment_sz as f64) as usize;
            self.capacity = (self.capacity + step).min(self.profile.tx_portal_max_sz);
        }
    }

    fn on_dup_ack(&mut self) {
        self.dup_acks += 1;
        if self.dup_acks >= self.profile.tx_portal_dup_ack_thresh {
            self.dup_acks = 0;
            self.shrink(self.profile.tx_portal_dup_ack_cap_scale);
        }
    }

    fn on_retx(&mut self) {
        self.retx_count += 1;
        if self.retx_count >= self.profile.tx_portal_retx_thresh {
            self.retx_count = 0;
            self.shrink(self.profile.tx_portal_retx_cap_scale);
        }
    }

    fn shrink(&mut self, scale: f64) {
        let shrunk = (self.capacity as f64 * scale) as usize;
        self.capacity = shrunk.max(self.profile.tx_portal_min_sz);
        debug!("tx window capacity for {} now {}", self.peer, self.capacity);
    }
}
