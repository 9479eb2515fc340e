//! Tree-protocol seam between the engine and a protocol implementation.
//!
//! Every protocol control message shares a 5-byte prefix: protocol id and
//! version nibbles, the message length (total bytes minus 3), the message
//! type, and the 32-bit overlay hash. [`dispatch`] performs the checks that
//! are common to all protocols and hands the packet to the installed
//! implementation. SPT is the only implementation in this revision, but the
//! seam is what keeps it swappable.

use crate::buffer::PacketFifo;
use crate::clock::OverlayClock;
use crate::measure::StateReport;
use crate::overlay::OverlayMessage;
use crate::spt::message::SenderTable;
use crate::wire::{self, WireError};

/// Top-nibble tag of overlay data packets.
pub const PROTOCOL_OVERLAY_DATA: u8 = 13;

/// Top-nibble tag of SPT control packets.
pub const PROTOCOL_SPT: u8 = 3;

/// Errors raised while vetting or handling a protocol control packet. All of
/// them are log-and-drop at the engine.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("protocol {got} is not active (expected {expected})")]
    NotActive { expected: u8, got: u8 },
    #[error("overlay hash {got:#010x} does not match ours ({expected:#010x})")]
    OverlayMismatch { expected: u32, got: u32 },
    #[error("declared length {declared} exceeds packet size {actual}")]
    LengthOverrun { declared: usize, actual: usize },
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("sender address length {0} is unsupported")]
    BadAddressLength(u64),
    #[error("adjacency table overruns the packet")]
    AdjacencyOverrun,
    #[error("encoded message of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Operations a tree protocol exposes to the engine. State behind the
/// implementation is touched from the engine task only.
pub trait TreeProtocol: Send {
    /// Wire protocol id carried in every control packet's top nibble.
    fn id(&self) -> u8;

    /// Overlay hash this node participates in.
    fn overlay_hash(&self) -> u32;

    /// Handle one verified control packet of the given message type.
    fn handle_message(
        &mut self,
        packet: &[u8],
        message_type: u8,
        clock: &mut OverlayClock,
    ) -> Result<(), ProtocolError>;

    /// Periodic upkeep: heartbeat emission and table expiry. Outbound
    /// packets go onto the send FIFO.
    fn maintain(&mut self, clock: &mut OverlayClock, identity: &SenderTable, outbound: &PacketFifo);

    /// Whether an overlay message from this sender may be forwarded.
    fn sender_trusted(&self, msg: &OverlayMessage) -> bool;

    /// Immutable snapshot of protocol state for telemetry.
    fn report(&self, now: u64) -> StateReport;
}

/// Vet a protocol control packet's shared prefix and hand it to the
/// installed protocol.
pub fn dispatch(
    packet: &[u8],
    protocol_id: u8,
    protocol: &mut dyn TreeProtocol,
    clock: &mut OverlayClock,
) -> Result<(), ProtocolError> {
    if protocol_id != protocol.id() {
        return Err(ProtocolError::NotActive {
            expected: protocol.id(),
            got: protocol_id,
        });
    }
    let declared = wire::read_uint(packet, 16, 8)? as usize;
    let message_type = wire::read_uint(packet, 8, 24)? as u8;
    let hash = wire::read_uint(packet, 32, 32)? as u32;
    if hash != protocol.overlay_hash() {
        return Err(ProtocolError::OverlayMismatch {
            expected: protocol.overlay_hash(),
            got: hash,
        });
    }
    if declared > packet.len() {
        return Err(ProtocolError::LengthOverrun {
            declared,
            actual: packet.len(),
        });
    }
    protocol.handle_message(packet, message_type, clock)
}
