use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError};
use crossbeam::select;
use tracing::{debug, error};

use crate::instrument::Instrument;
use crate::message::WireMessage;

const MONITOR_IN_LEN: usize = 1024;
const CANCEL_IN_LEN: usize = 1024;

/// Timer-driven queue of sent DATA messages awaiting acknowledgement.
///
/// One worker keeps the queue time-ordered (entries all share the same
/// deadline offset, so arrival order is deadline order), sleeps until the
/// head's deadline, and re-sends the head if it was not cancelled in the
/// meantime. A cancelled entry drops its message reference; a re-sent
/// entry gets a fresh deadline and rotates to the tail.
pub struct Retransmitter {
    monitor_tx: Sender<Arc<WireMessage>>,
    cancel_tx: Sender<i32>,
}

struct Entry {
    deadline: Instant,
    wm: Arc<WireMessage>,
}

impl Retransmitter {
    pub fn start(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        retx_timeout: Duration,
        retx_events: Sender<()>,
        instrument: Arc<dyn Instrument>,
    ) -> Retransmitter {
        let (monitor_tx, monitor_rx) = bounded(MONITOR_IN_LEN);
        let (cancel_tx, cancel_rx) = bounded(CANCEL_IN_LEN);
        thread::spawn(move || {
            run(
                monitor_rx,
                cancel_rx,
                socket,
                peer,
                retx_timeout,
                retx_events,
                instrument,
            )
        });
        Retransmitter { monitor_tx, cancel_tx }
    }

    /// Hands a sent message to the monitor. The caller's `Arc` clone is
    /// the monitor's reference; it is released on cancel or shutdown.
    pub fn monitor(&self, wm: Arc<WireMessage>) {
        let _ = self.monitor_tx.send(wm);
    }

    /// Retires an in-flight sequence; its entry (if still queued) is
    /// removed and the message reference dropped.
    pub fn cancel(&self, seq: i32) {
        let _ = self.cancel_tx.send(seq);
    }
}

fn run(
    monitor_rx: Receiver<Arc<WireMessage>>,
    cancel_rx: Receiver<i32>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    retx_timeout: Duration,
    retx_events: Sender<()>,
    instrument: Arc<dyn Instrument>,
) {
    let mut queue: Vec<Entry> = Vec::new();
    loop {
        if drain_monitor(&mut queue, &monitor_rx, retx_timeout).is_err() {
            return;
        }
        if drain_cancels(&mut queue, &cancel_rx).is_err() {
            return;
        }

        if queue.is_empty() {
            select! {
                recv(monitor_rx) -> wm => match wm {
                    Ok(wm) => queue.push(Entry { deadline: Instant::now() + retx_timeout, wm }),
                    Err(_) => return,
                },
                recv(cancel_rx) -> seq => match seq {
                    Ok(seq) => remove_seq(&mut queue, seq),
                    Err(_) => return,
                },
            }
            continue;
        }

        let deadline = queue[0].deadline;
        let now = Instant::now();
        if deadline > now {
            select! {
                recv(monitor_rx) -> wm => match wm {
                    Ok(wm) => queue.push(Entry { deadline: Instant::now() + retx_timeout, wm }),
                    Err(_) => return,
                },
                recv(cancel_rx) -> seq => match seq {
                    Ok(seq) => remove_seq(&mut queue, seq),
                    Err(_) => return,
                },
                default(deadline - now) => {},
            }
            // the head may have been cancelled while we slept
            if drain_cancels(&mut queue, &cancel_rx).is_err() {
                return;
            }
        }

        if let Some(head) = queue.first() {
            if head.deadline <= Instant::now() {
                match socket.send_to(head.wm.wire_bytes(), peer) {
                    Ok(_) => {
                        instrument.wire_message_tx(peer, &head.wm);
                        debug!("retx seq {} -> {}", head.wm.seq, peer);
                    }
                    Err(e) => error!("retx seq {} -> {}: {}", head.wm.seq, peer, e),
                }
                let mut head = queue.remove(0);
                head.deadline = Instant::now() + retx_timeout;
                queue.push(head);
                let _ = retx_events.try_send(());
            }
        }
    }
}

fn drain_monitor(
    queue: &mut Vec<Entry>,
    monitor_rx: &Receiver<Arc<WireMessage>>,
    retx_timeout: Duration,
) -> Result<(), ()> {
    loop {
        match monitor_rx.try_recv() {
            Ok(wm) => queue.push(Entry {
                deadline: Instant::now() + retx_timeout,
                wm,
            }),
            Err(TryRecvError::Empty) => return Ok(()),
            Err(TryRecvError::Disconnected) => return Err(()),
        }
    }
}

fn drain_cancels(queue: &mut Vec<Entry>, cancel_rx: &Receiver<i32>) -> Result<(), ()> {
    loop {
        match cancel_rx.try_recv() {
            Ok(seq) => remove_seq(queue, seq),
            Err(TryRecvError::Empty) => return Ok(()),
            Err(TryRecvError::Disconnected) => return Err(()),
        }
    }
}

fn remove_seq(queue: &mut Vec<Entry>, seq: i32) {
    if let Some(i) = queue.iter().position(|e| e.wm.seq == seq) {
        queue.remove(i);
    }
}
