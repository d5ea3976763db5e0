use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, Receiver, Sender};
use tracing::debug;

use crate::buffer::{Buffer, Pool};
use crate::instrument::Instrument;
use crate::message::{AckRange, WireMessage};
use crate::tx_portal::LocalAck;

const WM_QUEUE_LEN: usize = 1024;
const DATA_QUEUE_LEN: usize = 1024;

/// One in-order chunk of application bytes, backed by pooled storage.
pub struct RxRecord {
    pub buffer: Buffer,
}

/// Handle to the per-connection reassembly worker.
///
/// The worker owns the out-of-order tree and the `accepted` high-water
/// mark; DATA messages are fed in through [`RxPortal::sender`] and ordered
/// payloads come out of the data queue handed back by [`RxPortal::start`].
/// `rx_portal_sz` tracks buffered-but-unread bytes (tree + queue) and is
/// advertised to the peer in every ack this portal produces.
pub struct RxPortal {
    wm_in: Sender<WireMessage>,
    rx_portal_sz: Arc<AtomicI64>,
}

impl RxPortal {
    pub fn start(
        accepted: i32,
        pool: Pool,
        ack_out: Sender<LocalAck>,
        instrument: Arc<dyn Instrument>,
        peer: SocketAddr,
    ) -> (RxPortal, Receiver<RxRecord>) {
        let (wm_in, wm_rx) = bounded(WM_QUEUE_LEN);
        let (data_tx, data_rx) = bounded(DATA_QUEUE_LEN);
        let rx_portal_sz = Arc::new(AtomicI64::new(0));
        let sz = Arc::clone(&rx_portal_sz);
        thread::spawn(move || run(wm_rx, data_tx, ack_out, accepted, pool, sz, instrument, peer));
        (RxPortal { wm_in, rx_portal_sz }, data_rx)
    }

    pub fn sender(&self) -> Sender<WireMessage> {
        self.wm_in.clone()
    }

    /// Shared buffered-bytes counter; the reader decrements it as it
    /// consumes records.
    pub fn buffered(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.rx_portal_sz)
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    wm_rx: Receiver<WireMessage>,
    data_tx: Sender<RxRecord>,
    ack_out: Sender<LocalAck>,
    accepted: i32,
    pool: Pool,
    rx_portal_sz: Arc<AtomicI64>,
    instrument: Arc<dyn Instrument>,
    peer: SocketAddr,
) {
    let mut accepted = accepted;
    let mut tree: BTreeMap<i32, WireMessage> = BTreeMap::new();

    while let Ok(wm) = wm_rx.recv() {
        let payload_len = match wm.as_data() {
            Ok((_, payload)) => payload.len(),
            Err(e) => {
                instrument.read_error(Some(peer), &e);
                continue;
            }
        };
        let seq = wm.seq;

        if seq <= accepted || tree.contains_key(&seq) {
            // duplicate; drop it but acknowledge again so the peer can
            // retire its retransmission entry
            send_ack(&ack_out, &rx_portal_sz, AckRange::single(seq));
            continue;
        }

        if seq == accepted + 1 {
            let run_start = seq;
            rx_portal_sz.fetch_add(payload_len as i64, Ordering::Relaxed);
            if deliver(&wm, &data_tx, &pool).is_err() {
                break;
            }
            accepted = seq;
            // drain any contiguous successors already buffered
            while let Some(next) = tree.remove(&(accepted + 1)) {
                if deliver(&next, &data_tx, &pool).is_err() {
                    return;
                }
                accepted += 1;
            }
            send_ack(
                &ack_out,
                &rx_portal_sz,
                AckRange {
                    start: run_start,
                    end: accepted,
                },
            );
        } else {
            rx_portal_sz.fetch_add(payload_len as i64, Ordering::Relaxed);
            tree.insert(seq, wm);
            send_ack(&ack_out, &rx_portal_sz, AckRange::single(seq));
        }
    }
    debug!("rx portal for {} exited", peer);
}

/// Copies the payload into a fresh pooled record and queues it for the
/// reader. Fails only when the reader side is gone.
fn deliver(wm: &WireMessage, data_tx: &Sender<RxRecord>, pool: &Pool) -> Result<(), ()> {
    let payload = match wm.as_data() {
        Ok((_, payload)) => payload,
        Err(_) => return Ok(()), // validated on entry
    };
    if payload.is_empty() {
        return Ok(());
    }
    let mut buffer = pool.get();
    buffer.raw_mut()[..payload.len()].copy_from_slice(payload);
    buffer.set_used(payload.len());
    data_tx.send(RxRecord { buffer }).map_err(|_| ())
}

fn send_ack(ack_out: &Sender<LocalAck>, rx_portal_sz: &AtomicI64, range: AckRange) {
    let sz = rx_portal_sz
        .load(Ordering::Relaxed)
        .clamp(0, i32::MAX as i64) as i32;
    let _ = ack_out.send(LocalAck {
        range: Some(range),
        rx_portal_sz: sz,
    });
}
