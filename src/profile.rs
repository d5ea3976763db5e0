use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, TrestleError};
use crate::instrument::{InstrumentFactory, NoopInstrumentFactory};

/// Carried in every HELLO; a listener drops peers that disagree.
pub const PROTOCOL_VERSION: u8 = 1;

/// The tunables of one protocol deployment.
///
/// A profile is identified on the wire by a 1-byte id carried in HELLO;
/// loading and registering profiles from configuration is the embedding
/// application's job.
#[derive(Clone)]
pub struct Profile {
    /// Maximum DATA payload per datagram.
    pub max_segment_sz: usize,
    /// Kernel receive-buffer hint for the UDP socket.
    pub rx_buffer_sz: usize,
    /// Kernel send-buffer hint for the UDP socket.
    pub tx_buffer_sz: usize,
    /// Initial capacity of the listener's ordered peer index.
    pub listener_peers_tree_len: usize,
    /// Depth of the bounded accept queue.
    pub accept_queue_len: usize,
    /// Deadline before an unacked DATA is retransmitted.
    pub retx_timeout: Duration,
    /// Starting tx window capacity, in bytes.
    pub tx_portal_start_sz: usize,
    /// Floor for the tx window capacity; must cover one segment.
    pub tx_portal_min_sz: usize,
    /// Ceiling for the tx window capacity.
    pub tx_portal_max_sz: usize,
    /// Successful acks required before the capacity grows.
    pub tx_portal_increase_thresh: u32,
    /// Segments-worth of bytes added per growth step.
    pub tx_portal_increase_scale: f64,
    /// Duplicate acks tolerated before the capacity shrinks.
    pub tx_portal_dup_ack_thresh: u32,
    /// Multiplier applied to the capacity on a duplicate-ack shrink.
    pub tx_portal_dup_ack_cap_scale: f64,
    /// Retransmissions tolerated before the capacity shrinks.
    pub tx_portal_retx_thresh: u32,
    /// Multiplier applied to the capacity on a retransmission shrink.
    pub tx_portal_retx_cap_scale: f64,
    /// Wire id of this profile.
    pub profile_id: u8,
    /// Creates the instrument instance for each listener or dialer.
    pub instrument: Arc<dyn InstrumentFactory>,
}

impl Default for Profile {
    fn default() -> Self {
        Profile {
            max_segment_sz: 1420,
            rx_buffer_sz: 4 * 1024 * 1024,
            tx_buffer_sz: 4 * 1024 * 1024,
            listener_peers_tree_len: 16,
            accept_queue_len: 1024,
            retx_timeout: Duration::from_millis(200),
            tx_portal_start_sz: 96 * 1024,
            tx_portal_min_sz: 16 * 1024,
            tx_portal_max_sz: 4 * 1024 * 1024,
            tx_portal_increase_thresh: 224,
            tx_portal_increase_scale: 1.0,
            tx_portal_dup_ack_thresh: 64,
            tx_portal_dup_ack_cap_scale: 0.9,
            tx_portal_retx_thresh: 64,
            tx_portal_retx_cap_scale: 0.75,
            profile_id: 0,
            instrument: Arc::new(NoopInstrumentFactory),
        }
    }
}

impl Profile {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_segment_sz == 0 {
            return Err(TrestleError::Handshake("max_segment_sz must be > 0".into()));
        }
        if self.tx_portal_min_sz < self.max_segment_sz {
            return Err(TrestleError::Handshake(
                "tx_portal_min_sz must cover one segment".into(),
            ));
        }
        if self.tx_portal_start_sz < self.tx_portal_min_sz
            || self.tx_portal_start_sz > self.tx_portal_max_sz
        {
            return Err(TrestleError::Handshake(
                "tx_portal_start_sz outside [min, max]".into(),
            ));
        }
        if self.accept_queue_len == 0 {
            return Err(TrestleError::Handshake("accept_queue_len must be > 0".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("max_segment_sz", &self.max_segment_sz)
            .field("retx_timeout", &self.retx_timeout)
            .field("tx_portal_start_sz", &self.tx_portal_start_sz)
            .field("tx_portal_min_sz", &self.tx_portal_min_sz)
            .field("tx_portal_max_sz", &self.tx_portal_max_sz)
            .field("profile_id", &self.profile_id)
            .finish()
    }
}
