#![allow(dead_code)]

//! A small impairment relay for exercising streams over a misbehaving
//! path: datagrams from the dialer toward the listener can be dropped,
//! duplicated, or reordered deterministically, while the return path is
//! forwarded untouched.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DATA_TYPE: u8 = 2;
const TYPE_MASK: u8 = 0x07;

#[derive(Default, Clone)]
pub struct Impairments {
    /// Drop the nth (0-based) DATA datagram heading to the listener, once.
    pub drop_data_nth: Option<u64>,
    /// Forward every DATA datagram to the listener twice.
    pub duplicate_data: bool,
    /// Swap every consecutive pair of DATA datagrams to the listener.
    pub reorder_pairs: bool,
    /// Drop DATA datagrams independently with this probability, decided
    /// by a seeded generator so runs are reproducible.
    pub random_loss: Option<(f32, u64)>,
}

pub struct Relay {
    pub addr: SocketAddr,
    stop: Arc<AtomicBool>,
}

impl Relay {
    /// Starts a relay in front of `target`; dial the returned `addr`.
    pub fn start(target: SocketAddr, impairments: Impairments) -> Relay {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let addr = socket.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        thread::spawn(move || run(socket, target, impairments, worker_stop));
        Relay { addr, stop }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_data(pkt: &[u8]) -> bool {
    pkt.len() >= 7 && pkt[4] & TYPE_MASK == DATA_TYPE
}

fn run(socket: UdpSocket, target: SocketAddr, impairments: Impairments, stop: Arc<AtomicBool>) {
    let mut dialer: Option<SocketAddr> = None;
    let mut buf = [0u8; 64 * 1024];
    let mut data_seen: u64 = 0;
    let mut held: Option<Vec<u8>> = None;
    let mut rng = impairments
        .random_loss
        .map(|(probability, seed)| (probability, StdRng::seed_from_u64(seed)));

    while !stop.load(Ordering::SeqCst) {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(x) => x,
            Err(_) => continue,
        };
        let pkt = buf[..n].to_vec();

        if from == target {
            // listener -> dialer: forwarded untouched
            if let Some(dialer) = dialer {
                let _ = socket.send_to(&pkt, dialer);
            }
            continue;
        }

        // dialer -> listener: impairments apply to DATA only, so the
        // handshake and ack paths stay intact
        if dialer.is_none() {
            dialer = Some(from);
        }
        if !is_data(&pkt) {
            let _ = socket.send_to(&pkt, target);
            continue;
        }

        let idx = data_seen;
        data_seen += 1;

        if impairments.drop_data_nth == Some(idx) {
            continue;
        }
        if let Some((probability, rng)) = rng.as_mut() {
            if rng.gen::<f32>() < *probability {
                continue;
            }
        }
        if impairments.reorder_pairs {
            if held.is_none() && idx % 2 == 0 {
                held = Some(pkt);
                continue;
            }
            let _ = socket.send_to(&pkt, target);
            if let Some(first) = held.take() {
                let _ = socket.send_to(&first, target);
            }
            continue;
        }
        let _ = socket.send_to(&pkt, target);
        if impairments.duplicate_data {
            let _ = socket.send_to(&pkt, target);
        }
    }
}
