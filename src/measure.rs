//! Node-state telemetry.
//!
//! The engine publishes an immutable [`StateReport`] snapshot after each
//! maintenance pass; the reporter task serializes the latest snapshot with
//! the wire codec and POSTs it to the collector. Only snapshots cross the
//! task boundary — the reporter never sees live protocol state.

use crate::spt::tables::{NeighborEntry, TreeInfo};
use crate::wire::{self, WireError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Cadence of collector posts.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Node-kind tag in the report header distinguishing this implementation
/// family from the desktop nodes on the same collector.
pub const NODE_KIND: u8 = 1;

/// One adjacency row as it appears in a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjacencySample {
    pub id: u32,
    pub quality: u8,
    pub last_seen: u64,
}

/// Everything the collector learns about a node, frozen at one instant.
#[derive(Debug, Clone)]
pub struct StateReport {
    pub protocol_id: u8,
    pub timestamp: u64,
    pub tree: TreeInfo,
    pub neighbors: Vec<NeighborEntry>,
    pub adjacency: Vec<AdjacencySample>,
}

impl Default for StateReport {
    fn default() -> Self {
        Self {
            protocol_id: 0,
            timestamp: 0,
            tree: TreeInfo::new(0, 0),
            neighbors: Vec::new(),
            adjacency: Vec::new(),
        }
    }
}

/// Binary report layout, field by field:
///
/// ```text
/// kind:4  protocol:4  timestamp:32
/// neighbor_count:8
///   per neighbor: id:16 physical:32 root:16 cost:32 metric:32 seen:32 ancestor:8
/// adjacency_count:8
///   per entry: id:32 quality:8 seen:32
/// tree: id:16 physical:32 root:16 ancestor:32 cost:32 metric:32 seq:32
/// ```
///
/// Timestamps are epoch seconds truncated to 32 bits.
pub fn encode_report(report: &StateReport) -> Result<Vec<u8>, WireError> {
    let total = 5 + 1 + report.neighbors.len() * 21 + 1 + report.adjacency.len() * 9 + 24;
    let mut buf = vec![0u8; total];

    wire::write_uint(&mut buf, u64::from(NODE_KIND), 4, 0)?;
    wire::write_uint(&mut buf, u64::from(report.protocol_id), 4, 4)?;
    wire::write_uint(&mut buf, report.timestamp & 0xFFFF_FFFF, 32, 8)?;

    let mut cursor = 40;
    wire::write_uint(&mut buf, report.neighbors.len() as u64, 8, cursor)?;
    cursor += 8;
    for n in &report.neighbors {
        wire::write_uint(&mut buf, u64::from(n.neighbor_id & 0xFFFF), 16, cursor)?;
        wire::write_uint(&mut buf, u64::from(n.physical_address), 32, cursor + 16)?;
        wire::write_uint(&mut buf, u64::from(n.root_id & 0xFFFF), 16, cursor + 48)?;
        wire::write_uint(&mut buf, u64::from(n.cost), 32, cursor + 64)?;
        wire::write_uint(&mut buf, u64::from(n.path_metric), 32, cursor + 96)?;
        wire::write_uint(&mut buf, n.timestamp & 0xFFFF_FFFF, 32, cursor + 128)?;
        wire::write_uint(&mut buf, u64::from(n.is_ancestor), 8, cursor + 160)?;
        cursor += 21 * 8;
    }

    wire::write_uint(&mut buf, report.adjacency.len() as u64, 8, cursor)?;
    cursor += 8;
    for a in &report.adjacency {
        wire::write_uint(&mut buf, u64::from(a.id), 32, cursor)?;
        wire::write_uint(&mut buf, u64::from(a.quality), 8, cursor + 32)?;
        wire::write_uint(&mut buf, a.last_seen & 0xFFFF_FFFF, 32, cursor + 40)?;
        cursor += 9 * 8;
    }

    wire::write_uint(&mut buf, u64::from(report.tree.id & 0xFFFF), 16, cursor)?;
    wire::write_uint(&mut buf, u64::from(report.tree.physical_address), 32, cursor + 16)?;
    wire::write_uint(&mut buf, u64::from(report.tree.root_id & 0xFFFF), 16, cursor + 48)?;
    wire::write_uint(&mut buf, u64::from(report.tree.ancestor_id), 32, cursor + 64)?;
    wire::write_uint(&mut buf, u64::from(report.tree.cost), 32, cursor + 96)?;
    wire::write_uint(&mut buf, u64::from(report.tree.path_metric), 32, cursor + 128)?;
    wire::write_uint(&mut buf, u64::from(report.tree.sequence_number), 32, cursor + 160)?;

    Ok(buf)
}

/// Reporter task: every interval, POST the latest snapshot to the collector
/// as an opaque octet stream. Failures are logged and the next tick tries
/// again.
pub async fn report_loop(collector: String, rx: watch::Receiver<StateReport>) {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    loop {
        ticker.tick().await;
        let report = rx.borrow().clone();
        if report.timestamp == 0 {
            // Engine has not published yet.
            continue;
        }
        let body = match encode_report(&report) {
            Ok(body) => body,
            Err(e) => {
                error!("failed to encode state report: {e}");
                continue;
            }
        };
        match client
            .post(&collector)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
        {
            Ok(response) => debug!("collector answered {}", response.status()),
            Err(e) => warn!("state report post failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spt::tables::NeighborEntry;

    #[test]
    fn test_report_layout_widths() {
        let report = StateReport {
            protocol_id: 3,
            timestamp: 1_700_000_000,
            tree: TreeInfo::new(42, 0xC0A80001),
            neighbors: vec![NeighborEntry {
                neighbor_id: 7,
                physical_address: 0xC0A80002,
                root_id: 900,
                cost: 2,
                path_metric: 9_998,
                timestamp: 1_700_000_000,
                is_ancestor: true,
            }],
            adjacency: vec![AdjacencySample { id: 7, quality: 10, last_seen: 1_700_000_000 }],
        };
        let buf = encode_report(&report).unwrap();
        assert_eq!(buf.len(), 5 + 1 + 21 + 1 + 9 + 24);
        assert_eq!(wire::read_uint(&buf, 4, 0).unwrap(), u64::from(NODE_KIND));
        assert_eq!(wire::read_uint(&buf, 4, 4).unwrap(), 3);
        assert_eq!(wire::read_uint(&buf, 32, 8).unwrap(), 1_700_000_000);
        assert_eq!(wire::read_uint(&buf, 8, 40).unwrap(), 1);
        // First neighbor row starts right after the count.
        assert_eq!(wire::read_uint(&buf, 16, 48).unwrap(), 7);
        // Ancestor flag at the end of the row.
        assert_eq!(wire::read_uint(&buf, 8, 48 + 160).unwrap(), 1);
    }

    #[test]
    fn test_empty_report_is_fixed_size() {
        let report = StateReport { protocol_id: 3, timestamp: 1, ..Default::default() };
        let buf = encode_report(&report).unwrap();
        assert_eq!(buf.len(), 5 + 1 + 1 + 24);
    }
}
