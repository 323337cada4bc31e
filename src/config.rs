use std::time::Duration;

use crate::send_window::SendWindowConfig;
use crate::seq_number::SequenceSpace;
use crate::wire::WireCodec;

/// Everything the engine consumes at construction time.
#[derive(Clone)]
pub struct ProtocolConfig {
    /// Sequence numbers live in `[0, modulus)`.
    pub modulus: u32,
    pub send_window: SendWindowConfig,
    /// Frame delimiter for the text codec.
    pub delimiter: u8,
    /// Upper bound on a single acknowledgment poll. Expiry is a retry, not
    /// an error, so the send path is never starved.
    pub ack_poll_timeout: Duration,
    /// A stats snapshot is recorded every this many packets.
    pub snapshot_interval: u64,
    /// Packets a sender session admits before draining and finishing.
    pub target_packets: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            modulus: 65536,
            send_window: SendWindowConfig::default(),
            delimiter: b'\n',
            ack_poll_timeout: Duration::from_millis(100),
            snapshot_interval: 1000,
            target_packets: 10_000,
        }
    }
}

impl ProtocolConfig {
    pub fn sequence_space(&self) -> SequenceSpace {
        SequenceSpace::new(self.modulus)
    }

    pub fn codec(&self) -> WireCodec {
        WireCodec::new(self.modulus, self.delimiter)
    }
}
