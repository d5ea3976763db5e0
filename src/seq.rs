use std::sync::atomic::{AtomicI32, Ordering};

/// A monotonically increasing sequence counter shared by everything that
/// stamps outgoing messages on a connection.
///
/// `Sequence::new(0).next()` yields `1`; ACK messages use `-1` as their
/// sequence, meaning "no sequence assigned".
#[derive(Debug)]
pub struct Sequence(AtomicI32);

impl Sequence {
    pub fn new(start: i32) -> Self {
        Sequence(AtomicI32::new(start))
    }

    pub fn next(&self) -> i32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }
}
