//! # Trestle
//!
//! A reliable, ordered, connection-oriented transport running in user
//! space over UDP. Trestle gives callers a TCP-style byte stream
//! (`read`/`write`, peer addressing, a connection lifecycle) while doing
//! its own sequencing, acknowledgement, retransmission, and flow control
//! over a substrate that may lose, duplicate, reorder, or delay
//! datagrams.
//!
//! ## Architecture
//!
//! - **Wire codec**: a fixed 7-byte header (`[seq:i32][mt:u8][dataSz:u16]`,
//!   network byte order) over pooled, fixed-capacity buffers. Acks ride
//!   inside HELLO and DATA payloads when they fit, or as standalone ACK
//!   messages carrying the advertised receive window.
//! - **Portals**: each connection runs a transmit portal (send window,
//!   ack intake, window evolution) and a receive portal (ordered
//!   reassembly, reader queue, window advertisement), plus a
//!   retransmission monitor and a receiver loop. Workers talk over
//!   bounded channels and suspend only on queues, timers, and the socket.
//! - **Handshake**: a three-way HELLO / HELLO+ack / ACK exchange with a
//!   5-second deadline establishes the initial sequence in each
//!   direction; a listener demultiplexes peers through an ordered
//!   address index.

pub mod buffer;
pub mod conn;
pub mod dialer;
pub mod error;
pub mod instrument;
pub mod listener;
pub mod message;
pub mod peers;
pub mod profile;
pub mod retransmitter;
pub mod rx_portal;
pub mod seq;
pub mod tx_portal;

pub use buffer::{Buffer, Pool};
pub use conn::Stream;
pub use dialer::dial;
pub use error::{Result, TrestleError};
pub use instrument::{Instrument, InstrumentFactory, NoopInstrument, NoopInstrumentFactory};
pub use listener::{listen, Listener};
pub use message::{AckRange, Hello, MessageType, WireMessage};
pub use profile::{Profile, PROTOCOL_VERSION};
pub use seq::Sequence;
