//! SPT protocol tables.
//!
//! All tables are owned by the protocol instance and mutated from the engine
//! task only. Removal swaps the tail entry into the vacated slot, so entry
//! order is not meaningful anywhere here.

use crate::spt::message::AdjacencyInfo;
use tracing::error;

/// Heartbeat period; also the slot width of the ping window.
pub const HEARTBEAT_SECS: u64 = 5;

/// Adjacency entries expire after this much silence.
pub const ADJACENCY_TIMEOUT_SECS: u64 = 20;

/// Neighborhood entries expire after this much silence.
pub const NEIGHBOR_TIMEOUT_SECS: u64 = 5;

/// Neighborhood slots. Adds beyond this are refused.
pub const NEIGHBORHOOD_CAPACITY: usize = 10;

/// Ping-window slots; one per heartbeat interval.
pub const PING_BUFFER_SIZE: usize = 10;

/// Path metric of a node with no upstream cost.
pub const PATH_METRIC_FULL: u32 = 10_000;

/// Metric improvement required before abandoning the current ancestor for a
/// sibling branch under the same root.
pub const JUMP_THRESHOLD: u32 = 2;

/// Beacons from links at or below this quality do not update tree state.
pub const RELIABILITY_THRESHOLD: f64 = 0.1;

// =============================================================================
// TREE INFO
// =============================================================================

/// This node's position in the shared tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeInfo {
    pub id: u32,
    pub physical_address: u32,
    pub root_id: u32,
    pub ancestor_id: u32,
    pub cost: u32,
    pub path_metric: u32,
    pub sequence_number: u32,
}

impl TreeInfo {
    /// A freshly started node has neither ancestor nor root; the zero id
    /// stands for "none" (logical addresses start at 1).
    pub fn new(id: u32, physical_address: u32) -> Self {
        Self {
            id,
            physical_address,
            root_id: 0,
            ancestor_id: 0,
            cost: 0,
            path_metric: PATH_METRIC_FULL,
            sequence_number: 0,
        }
    }

    /// Fall back to being our own root, e.g. after the ancestor expires.
    pub fn reset_to_root(&mut self) {
        self.ancestor_id = self.id;
        self.root_id = self.id;
        self.cost = 0;
        self.path_metric = PATH_METRIC_FULL;
    }
}

// =============================================================================
// NEIGHBORHOOD
// =============================================================================

/// A tree-adjacent peer: our ancestor or one of our descendants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub neighbor_id: u32,
    pub physical_address: u32,
    pub root_id: u32,
    pub cost: u32,
    pub path_metric: u32,
    /// Beacon timestamp of the last update, epoch seconds.
    pub timestamp: u64,
    pub is_ancestor: bool,
}

/// Up to [`NEIGHBORHOOD_CAPACITY`] tree neighbors; at most one entry is the
/// ancestor.
#[derive(Debug, Default)]
pub struct NeighborhoodTable {
    entries: Vec<NeighborEntry>,
}

impl NeighborhoodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. A full table refuses the add; the tree keeps running
    /// with the neighbors it has.
    pub fn add(&mut self, entry: NeighborEntry) -> bool {
        if self.entries.len() >= NEIGHBORHOOD_CAPACITY {
            error!("neighborhood table is full, dropping neighbor {}", entry.neighbor_id);
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn get(&self, neighbor_id: u32) -> Option<&NeighborEntry> {
        self.entries.iter().find(|e| e.neighbor_id == neighbor_id)
    }

    pub fn get_mut(&mut self, neighbor_id: u32) -> Option<&mut NeighborEntry> {
        self.entries.iter_mut().find(|e| e.neighbor_id == neighbor_id)
    }

    /// Remove by id, swapping the tail entry into the hole.
    pub fn remove(&mut self, neighbor_id: u32) -> Option<NeighborEntry> {
        let idx = self.entries.iter().position(|e| e.neighbor_id == neighbor_id)?;
        Some(self.entries.swap_remove(idx))
    }

    pub fn ancestor(&self) -> Option<&NeighborEntry> {
        self.entries.iter().find(|e| e.is_ancestor)
    }

    pub fn ancestor_mut(&mut self) -> Option<&mut NeighborEntry> {
        self.entries.iter_mut().find(|e| e.is_ancestor)
    }

    /// Drop entries not refreshed within the neighbor timeout. Returns true
    /// when the ancestor was among the expired.
    pub fn expire(&mut self, now: u64) -> bool {
        let mut ancestor_dropped = false;
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].timestamp + NEIGHBOR_TIMEOUT_SECS < now {
                let gone = self.entries.swap_remove(i);
                ancestor_dropped |= gone.is_ancestor;
            } else {
                i += 1;
            }
        }
        ancestor_dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.entries.iter()
    }
}

// =============================================================================
// PING WINDOW
// =============================================================================

/// Sliding reception window: one boolean slot per heartbeat interval, ring
/// head at the oldest slot. Quality is the count of set slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingBuffer {
    slots: [bool; PING_BUFFER_SIZE],
    start: usize,
}

impl PingBuffer {
    pub fn new() -> Self {
        Self {
            slots: [false; PING_BUFFER_SIZE],
            start: 0,
        }
    }

    /// Advance the window by `intervals` heartbeat slots. When `received`,
    /// the final slot is marked and the head moves; intermediate slots are
    /// cleared. A non-receiving probe only clears the slots the silence has
    /// invalidated and leaves the head alone. At zero intervals a reception
    /// back-fills the most recent empty slot.
    pub fn advance(&mut self, intervals: u64, received: bool) {
        if intervals < 1 {
            if !received {
                return;
            }
            let mut slot = (self.start + PING_BUFFER_SIZE - 1) % PING_BUFFER_SIZE;
            for _ in 0..PING_BUFFER_SIZE {
                if !self.slots[slot] {
                    self.slots[slot] = true;
                    break;
                }
                slot = (slot + PING_BUFFER_SIZE - 1) % PING_BUFFER_SIZE;
            }
        } else if received {
            if intervals as usize >= PING_BUFFER_SIZE {
                self.slots = [false; PING_BUFFER_SIZE];
                self.start = (self.start + (intervals as usize % PING_BUFFER_SIZE)) % PING_BUFFER_SIZE;
                let last = (self.start + PING_BUFFER_SIZE - 1) % PING_BUFFER_SIZE;
                self.slots[last] = true;
            } else {
                for i in 0..intervals as usize {
                    self.slots[self.start] = i as u64 == intervals - 1;
                    self.start = (self.start + 1) % PING_BUFFER_SIZE;
                }
            }
        } else {
            let mut slot = self.start;
            let clears = ((intervals - 1) as usize).min(PING_BUFFER_SIZE);
            for _ in 0..clears {
                self.slots[slot] = false;
                slot = (slot + 1) % PING_BUFFER_SIZE;
            }
        }
    }

    /// Set slots in the window.
    pub fn count(&self) -> u8 {
        self.slots.iter().filter(|&&s| s).count() as u8
    }
}

impl Default for PingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// ADJACENCY
// =============================================================================

/// A peer heard on the segment, with its measured link quality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjacencyEntry {
    pub id: u32,
    pub quality: u8,
    /// Last reception, epoch seconds on the local clock.
    pub timestamp: u64,
    pub pings: PingBuffer,
}

impl AdjacencyEntry {
    pub fn new(id: u32, now: u64) -> Self {
        Self {
            id,
            quality: 0,
            timestamp: now,
            pings: PingBuffer::new(),
        }
    }

    fn intervals_since_last(&self, now: u64) -> u64 {
        (now.saturating_sub(self.timestamp) + HEARTBEAT_SECS / 2) / HEARTBEAT_SECS
    }

    /// Record an actual reception at `now`.
    pub fn record_ping(&mut self, now: u64) {
        let intervals = self.intervals_since_last(now);
        self.pings.advance(intervals, true);
        self.timestamp = now;
    }

    /// Measure quality at `now`, first probing the window so silence since
    /// the last reception is accounted for.
    pub fn quality_at(&mut self, now: u64) -> u8 {
        let intervals = self.intervals_since_last(now);
        self.pings.advance(intervals, false);
        self.pings.count()
    }
}

#[derive(Debug, Default)]
pub struct AdjacencyTable {
    entries: Vec<AdjacencyEntry>,
}

impl AdjacencyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `id`, created zero-initialized on first sight.
    pub fn upsert(&mut self, id: u32, now: u64) -> &mut AdjacencyEntry {
        if let Some(idx) = self.entries.iter().position(|e| e.id == id) {
            return &mut self.entries[idx];
        }
        self.entries.push(AdjacencyEntry::new(id, now));
        self.entries.last_mut().expect("entry just pushed")
    }

    pub fn get(&self, id: u32) -> Option<&AdjacencyEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Drop entries silent past the adjacency timeout, swapping with the
    /// tail. Returns how many were removed.
    pub fn expire(&mut self, now: u64) -> usize {
        let mut removed = 0;
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].timestamp + ADJACENCY_TIMEOUT_SECS < now {
                self.entries.swap_remove(i);
                removed += 1;
            } else {
                i += 1;
            }
        }
        removed
    }

    /// The table as beacon adjacency entries.
    pub fn snapshot(&self) -> Vec<AdjacencyInfo> {
        self.entries
            .iter()
            .map(|e| AdjacencyInfo { id: e.id, quality: e.quality })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AdjacencyEntry> {
        self.entries.iter()
    }
}

// =============================================================================
// RESERVED TABLES
// =============================================================================

/// Fallback parents for fast failover. On the wire contract but not
/// populated in this revision.
#[derive(Debug, Default)]
pub struct BackupAncestorTable {
    pub entries: Vec<NeighborEntry>,
}

/// Candidate cores for anchored trees. Not populated in this revision.
#[derive(Debug, Default)]
pub struct CoreTable {
    pub entries: Vec<u32>,
    pub last_update: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u32, timestamp: u64, is_ancestor: bool) -> NeighborEntry {
        NeighborEntry {
            neighbor_id: id,
            physical_address: 0,
            root_id: id,
            cost: 0,
            path_metric: PATH_METRIC_FULL,
            timestamp,
            is_ancestor,
        }
    }

    #[test]
    fn test_neighborhood_capacity_refuses_add() {
        let mut table = NeighborhoodTable::new();
        for i in 0..NEIGHBORHOOD_CAPACITY as u32 {
            assert!(table.add(entry(i + 1, 100, false)));
        }
        assert!(!table.add(entry(99, 100, false)));
        assert_eq!(table.len(), NEIGHBORHOOD_CAPACITY);
    }

    #[test]
    fn test_neighborhood_expire_reports_ancestor_loss() {
        let mut table = NeighborhoodTable::new();
        table.add(entry(1, 100, true));
        table.add(entry(2, 104, false));
        // Entry 1 is stale at t=106 (100 + 5 < 106); entry 2 is not.
        assert!(table.expire(106));
        assert!(table.ancestor().is_none());
        assert!(table.get(2).is_some());
    }

    #[test]
    fn test_ping_window_fills_to_ten() {
        let mut e = AdjacencyEntry::new(7, 1000);
        e.record_ping(1000);
        for k in 1..10u64 {
            e.record_ping(1000 + k * HEARTBEAT_SECS);
        }
        assert_eq!(e.quality_at(1000 + 9 * HEARTBEAT_SECS), 10);
    }

    #[test]
    fn test_ping_window_drains_on_silence() {
        let mut e = AdjacencyEntry::new(7, 1000);
        for k in 0..10u64 {
            e.record_ping(1000 + k * HEARTBEAT_SECS);
        }
        assert_eq!(e.quality_at(1000 + 9 * HEARTBEAT_SECS), 10);
        // Probe through ten silent intervals past the last reception.
        let last = 1000 + 9 * HEARTBEAT_SECS;
        for k in 1..=11u64 {
            e.quality_at(last + k * HEARTBEAT_SECS);
        }
        assert_eq!(e.quality_at(last + 11 * HEARTBEAT_SECS), 0);
    }

    #[test]
    fn test_same_interval_reception_backfills() {
        let mut e = AdjacencyEntry::new(7, 1000);
        e.record_ping(1000);
        e.record_ping(1001);
        assert_eq!(e.quality_at(1001), 2);
    }

    #[test]
    fn test_adjacency_expiry_swaps_tail() {
        let mut table = AdjacencyTable::new();
        table.upsert(1, 100);
        table.upsert(2, 130);
        table.upsert(3, 130);
        // Entry 1 last seen 30s before t=130.
        assert_eq!(table.expire(130), 1);
        assert!(table.get(1).is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_long_gap_reception_leaves_single_ping() {
        let mut e = AdjacencyEntry::new(7, 1000);
        for k in 0..10u64 {
            e.record_ping(1000 + k * HEARTBEAT_SECS);
        }
        // Reception after a gap far longer than the window.
        e.record_ping(1000 + 100 * HEARTBEAT_SECS);
        assert_eq!(e.quality_at(1000 + 100 * HEARTBEAT_SECS), 1);
    }
}
