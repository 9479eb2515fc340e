//! Treecast — a node agent for a shared-spanning-tree multicast overlay.
//!
//! Peers on one UDP multicast group elect a root, attach to ancestors, and
//! forward overlay data along the resulting tree with loop suppression.
//! The engine owns all protocol state; socket tasks talk to it through
//! bounded packet FIFOs.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod engine;
pub mod measure;
pub mod overlay;
pub mod protocol;
pub mod socket;
pub mod spt;
pub mod wire;

pub use buffer::{FifoError, Packet, PacketFifo};
pub use clock::OverlayClock;
pub use engine::{DeliveryCallback, Engine};
pub use measure::{encode_report, AdjacencySample, StateReport, REPORT_INTERVAL};
pub use overlay::{Extension, ExtensionKind, OverlayError, OverlayMessage};
pub use protocol::{ProtocolError, TreeProtocol, PROTOCOL_OVERLAY_DATA, PROTOCOL_SPT};
pub use spt::{Beacon, Goodbye, SenderEntry, SenderTable, SptProtocol};
pub use wire::WireError;
