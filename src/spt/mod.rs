//! SPT — the shared-spanning-tree protocol.

pub mod message;
pub mod protocol;
pub mod tables;

pub use message::{
    AdjacencyInfo, Beacon, Goodbye, SenderEntry, SenderTable, MSG_TYPE_BEACON, MSG_TYPE_GOODBYE,
    MSG_TYPE_ROUTE_REPLY, MSG_TYPE_ROUTE_REQ, SENDER_ADDRESS_LENGTH, SENDER_TABLE_MARKER,
};
pub use protocol::SptProtocol;
pub use tables::{
    AdjacencyEntry, AdjacencyTable, BackupAncestorTable, CoreTable, NeighborEntry,
    NeighborhoodTable, PingBuffer, TreeInfo, ADJACENCY_TIMEOUT_SECS, HEARTBEAT_SECS,
    JUMP_THRESHOLD, NEIGHBORHOOD_CAPACITY, NEIGHBOR_TIMEOUT_SECS, PATH_METRIC_FULL,
    PING_BUFFER_SIZE, RELIABILITY_THRESHOLD,
};
