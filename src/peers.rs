use std::cmp::Ordering;
use std::net::{IpAddr, SocketAddr};

/// Comparison key for peer addresses: family, then the address octets
/// lexicographically, then the port. A total order over every address a
/// datagram can arrive from.
type PeerKey = (u8, [u8; 16], u16);

fn peer_key(addr: &SocketAddr) -> PeerKey {
    match addr.ip() {
        IpAddr::V4(ip) => {
            let mut octets = [0u8; 16];
            octets[..4].copy_from_slice(&ip.octets());
            (4, octets, addr.port())
        }
        IpAddr::V6(ip) => (6, ip.octets(), addr.port()),
    }
}

/// Orders two peer addresses lexicographically on their octets, then port.
pub fn addr_cmp(a: &SocketAddr, b: &SocketAddr) -> Ordering {
    peer_key(a).cmp(&peer_key(b))
}

/// An ordered associative index from peer address to per-peer state.
///
/// Kept as a flat sorted vector with binary-search lookups: the listener
/// touches it once per datagram under a short lock, and peer counts are
/// small enough that cache locality beats pointer-chasing trees.
#[derive(Debug)]
pub struct PeerIndex<V> {
    entries: Vec<(PeerKey, SocketAddr, V)>,
}

impl<V> PeerIndex<V> {
    pub fn with_capacity(capacity: usize) -> Self {
        PeerIndex {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, addr: &SocketAddr) -> std::result::Result<usize, usize> {
        let key = peer_key(addr);
        self.entries.binary_search_by(|(k, _, _)| k.cmp(&key))
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&V> {
        match self.position(addr) {
            Ok(i) => Some(&self.entries[i].2),
            Err(_) => None,
        }
    }

    pub fn insert(&mut self, addr: SocketAddr, value: V) -> Option<V> {
        match self.position(&addr) {
            Ok(i) => Some(std::mem::replace(&mut self.entries[i].2, value)),
            Err(i) => {
                self.entries.insert(i, (peer_key(&addr), addr, value));
                None
            }
        }
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<V> {
        match self.position(addr) {
            Ok(i) => Some(self.entries.remove(i).2),
            Err(_) => None,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn addrs(&self) -> impl Iterator<Item = &SocketAddr> {
        self.entries.iter().map(|(_, addr, _)| addr)
    }
}
