use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::TrestleError;
use crate::message::WireMessage;

/// Observer hooks the core invokes at well-known moments.
///
/// Every method has a no-op default so implementations only override what
/// they care about, and hot paths never test for a missing observer.
/// Implementations are supplied by the embedding application; the core
/// ships only [`NoopInstrument`].
pub trait Instrument: Send + Sync {
    fn connected(&self, _peer: SocketAddr) {}
    fn connection_error(&self, _peer: SocketAddr, _err: &TrestleError) {}
    fn closed(&self, _peer: SocketAddr) {}

    fn wire_message_tx(&self, _peer: SocketAddr, _wm: &WireMessage) {}
    fn wire_message_rx(&self, _peer: SocketAddr, _wm: &WireMessage) {}
    fn read_error(&self, _peer: Option<SocketAddr>, _err: &TrestleError) {}
    fn unknown_peer(&self, _peer: SocketAddr) {}
    fn unexpected_message_type(&self, _peer: SocketAddr, _mt: u8) {}

    /// A pool allocated fresh storage (free list was empty).
    fn allocate(&self, _pool: &str) {}
    /// A pool dropped returned storage (free list was full).
    fn release(&self, _pool: &str) {}
}

/// Creates one instrument instance per listener or dialer.
pub trait InstrumentFactory: Send + Sync {
    fn new_instance(&self, id: &str, addr: SocketAddr) -> Arc<dyn Instrument>;
}

#[derive(Debug, Default)]
pub struct NoopInstrument;

impl Instrument for NoopInstrument {}

#[derive(Debug, Default)]
pub struct NoopInstrumentFactory;

impl InstrumentFactory for NoopInstrumentFactory {
    fn new_instance(&self, _id: &str, _addr: SocketAddr) -> Arc<dyn Instrument> {
        Arc::new(NoopInstrument)
    }
}
