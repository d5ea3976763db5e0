use std::sync::Arc;

use proptest::prelude::*;
use trestle::message::HEADER_SZ;
use trestle::{AckRange, Hello, MessageType, NoopInstrument, Pool, WireMessage};

fn pool(capacity: usize) -> Pool {
    Pool::new("proptest", capacity, Arc::new(NoopInstrument))
}

fn redecode(p: &Pool, wm: &WireMessage) -> WireMessage {
    let bytes = wm.wire_bytes();
    let mut buffer = p.get();
    buffer.raw_mut()[..bytes.len()].copy_from_slice(bytes);
    buffer.set_used(bytes.len());
    WireMessage::decode(buffer).unwrap()
}

proptest! {
    #[test]
    fn test_data_round_trip(
        seq in any::<i32>(),
        payload in prop::collection::vec(any::<u8>(), 0..1400),
    ) {
        let p = pool(HEADER_SZ + 1400);
        let wm = WireMessage::data(seq, &payload, &p).unwrap();
        let out = redecode(&p, &wm);
        prop_assert_eq!(out.seq, seq);
        prop_assert_eq!(out.message_type(), Some(MessageType::Data));
        let (acks, data) = out.as_data().unwrap();
        prop_assert!(acks.is_empty());
        prop_assert_eq!(data, payload.as_slice());
    }

    #[test]
    fn test_ack_round_trip(
        raw_ranges in prop::collection::vec((any::<i32>(), 0..1000i32), 0..12),
        rx_portal_sz in any::<i32>(),
        rtt in prop::option::of(any::<u16>()),
    ) {
        let ranges: Vec<AckRange> = raw_ranges
            .iter()
            .map(|&(start, len)| AckRange { start, end: start.saturating_add(len) })
            .collect();
        let p = pool(1024);
        let wm = WireMessage::ack(&ranges, rx_portal_sz, rtt, &p).unwrap();
        let out = redecode(&p, &wm);
        let (acks, sz, rtt_out) = out.as_ack().unwrap();
        prop_assert_eq!(acks.as_slice(), ranges.as_slice());
        prop_assert_eq!(sz, rx_portal_sz);
        prop_assert_eq!(rtt_out, rtt);
    }

    #[test]
    fn test_hello_round_trip(
        seq in any::<i32>(),
        version in any::<u8>(),
        profile in any::<u8>(),
        ack in prop::option::of((any::<i32>(), 0..100i32)),
    ) {
        let p = pool(64);
        let range = ack.map(|(start, len)| AckRange { start, end: start.saturating_add(len) });
        let wm = WireMessage::hello(seq, Hello { version, profile }, range, &p).unwrap();
        let out = redecode(&p, &wm);
        prop_assert_eq!(out.seq, seq);
        let (hello, acks) = out.as_hello().unwrap();
        prop_assert_eq!(hello.version, version);
        prop_assert_eq!(hello.profile, profile);
        match range {
            Some(r) => {
                prop_assert_eq!(acks.len(), 1);
                prop_assert_eq!(acks[0], r);
            }
            None => prop_assert!(acks.is_empty()),
        }
    }

    #[test]
    fn test_insert_preserves_existing_payload(
        base in prop::collection::vec(any::<u8>(), 1..256),
        extra in prop::collection::vec(any::<u8>(), 1..64),
    ) {
        let p = pool(HEADER_SZ + 512);
        let mut wm = WireMessage::data(1, &base, &p).unwrap();
        wm.insert_data(&extra).unwrap();

        let payload = wm.payload();
        prop_assert_eq!(&payload[..extra.len()], extra.as_slice());
        prop_assert_eq!(&payload[extra.len()..], base.as_slice());
    }

    #[test]
    fn test_append_preserves_existing_payload(
        base in prop::collection::vec(any::<u8>(), 1..256),
        extra in prop::collection::vec(any::<u8>(), 1..64),
    ) {
        let p = pool(HEADER_SZ + 512);
        let mut wm = WireMessage::data(1, &base, &p).unwrap();
        wm.append_data(&extra).unwrap();

        let payload = wm.payload();
        prop_assert_eq!(&payload[..base.len()], base.as_slice());
        prop_assert_eq!(&payload[base.len()..], extra.as_slice());
    }
}
