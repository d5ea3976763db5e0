use std::cmp::Ordering;
use std::net::SocketAddr;

use trestle::peers::{addr_cmp, PeerIndex};

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

#[test]
fn test_addr_cmp_is_lexicographic_on_octets_then_port() {
    let ordered = [
        addr("1.2.3.4:9"),
        addr("1.2.3.4:10"),
        addr("1.2.3.5:1"),
        addr("2.0.0.0:1"),
        addr("10.0.0.1:1"),
    ];
    for window in ordered.windows(2) {
        assert_eq!(addr_cmp(&window[0], &window[1]), Ordering::Less);
        assert_eq!(addr_cmp(&window[1], &window[0]), Ordering::Greater);
    }
    for a in &ordered {
        assert_eq!(addr_cmp(a, a), Ordering::Equal);
    }
}

#[test]
fn test_addr_cmp_is_a_total_order() {
    let addrs = [
        addr("127.0.0.1:1000"),
        addr("127.0.0.1:1001"),
        addr("127.0.0.2:1"),
        addr("0.0.0.0:0"),
        addr("255.255.255.255:65535"),
        addr("[::1]:1000"),
        addr("[::1]:1001"),
    ];
    // antisymmetry + transitivity over every triple
    for a in &addrs {
        for b in &addrs {
            assert_eq!(addr_cmp(a, b), addr_cmp(b, a).reverse());
            for c in &addrs {
                if addr_cmp(a, b) == Ordering::Less && addr_cmp(b, c) == Ordering::Less {
                    assert_eq!(addr_cmp(a, c), Ordering::Less);
                }
            }
        }
    }
}

#[test]
fn test_v4_and_v6_peers_never_collide() {
    // ::0102:0304 has the same trailing octets as 1.2.3.4
    let v4 = addr("1.2.3.4:7");
    let v6 = addr("[::102:304]:7");
    assert_ne!(addr_cmp(&v4, &v6), Ordering::Equal);

    let mut index = PeerIndex::with_capacity(4);
    index.insert(v4, "v4");
    index.insert(v6, "v6");
    assert_eq!(index.len(), 2);
    assert_eq!(index.get(&v4), Some(&"v4"));
    assert_eq!(index.get(&v6), Some(&"v6"));
}

#[test]
fn test_insert_get_remove() {
    let mut index = PeerIndex::with_capacity(2);
    assert!(index.is_empty());

    assert_eq!(index.insert(addr("10.0.0.1:5000"), 1), None);
    assert_eq!(index.insert(addr("10.0.0.2:5000"), 2), None);
    assert_eq!(index.insert(addr("10.0.0.1:5001"), 3), None);
    assert_eq!(index.len(), 3);

    // replacing a live peer yields the previous value
    assert_eq!(index.insert(addr("10.0.0.1:5000"), 9), Some(1));
    assert_eq!(index.len(), 3);

    assert_eq!(index.get(&addr("10.0.0.1:5000")), Some(&9));
    assert_eq!(index.get(&addr("10.0.0.3:5000")), None);

    assert_eq!(index.remove(&addr("10.0.0.1:5000")), Some(9));
    assert_eq!(index.remove(&addr("10.0.0.1:5000")), None);
    assert_eq!(index.len(), 2);

    // the index iterates in address order
    let addrs: Vec<_> = index.addrs().cloned().collect();
    assert_eq!(addrs, vec![addr("10.0.0.1:5001"), addr("10.0.0.2:5000")]);
}
