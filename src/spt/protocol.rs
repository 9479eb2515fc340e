//! SPT beacon handling, ancestor election, and maintenance.

use crate::buffer::PacketFifo;
use crate::clock::OverlayClock;
use crate::measure::{AdjacencySample, StateReport};
use crate::overlay::OverlayMessage;
use crate::protocol::{ProtocolError, TreeProtocol, PROTOCOL_SPT};
use crate::spt::message::{
    self, Beacon, Goodbye, SenderTable, MSG_TYPE_BEACON, MSG_TYPE_GOODBYE, MSG_TYPE_ROUTE_REPLY,
    MSG_TYPE_ROUTE_REQ,
};
use crate::spt::tables::{
    AdjacencyTable, BackupAncestorTable, CoreTable, NeighborEntry, NeighborhoodTable, TreeInfo,
    HEARTBEAT_SECS, JUMP_THRESHOLD, PATH_METRIC_FULL, RELIABILITY_THRESHOLD,
};
use tracing::{debug, error, info, warn};

/// The shared-spanning-tree protocol instance installed on a node.
pub struct SptProtocol {
    pub overlay_hash: u32,
    pub heartbeat_secs: u64,
    /// When we last announced ourselves, epoch seconds. Zero until the
    /// first beacon goes out.
    pub last_beacon: u64,
    pub tree: TreeInfo,
    pub neighborhood: NeighborhoodTable,
    pub adjacency: AdjacencyTable,
    pub backup_ancestors: BackupAncestorTable,
    pub core: CoreTable,
    /// Optional payload enqueued after each heartbeat to exercise
    /// dissemination end-to-end.
    pub data_probe: Option<Vec<u8>>,
}

impl SptProtocol {
    pub fn new(identity: &SenderTable, overlay_hash: u32) -> Self {
        Self {
            overlay_hash,
            heartbeat_secs: HEARTBEAT_SECS,
            last_beacon: 0,
            tree: TreeInfo::new(identity.source_logical, identity.physical_address()),
            neighborhood: NeighborhoodTable::new(),
            adjacency: AdjacencyTable::new(),
            backup_ancestors: BackupAncestorTable::default(),
            core: CoreTable::default(),
            data_probe: None,
        }
    }

    pub fn with_data_probe(mut self, payload: Vec<u8>) -> Self {
        self.data_probe = Some(payload);
        self
    }

    /// Minimum-cost path metric: the full value for a node with no upstream,
    /// otherwise degraded by the advertised cost. Other metrics would plug
    /// in here.
    pub fn path_metric(beacon: Option<&Beacon>) -> u32 {
        match beacon {
            None => PATH_METRIC_FULL,
            Some(b) => PATH_METRIC_FULL.saturating_sub(b.cost),
        }
    }

    fn node_is_better(a: u32, b: u32) -> bool {
        a > b
    }

    /// Decide whether the beacon's sender should become our ancestor.
    pub fn should_be_ancestor(&self, beacon: &Beacon) -> bool {
        // A beacon from under our own parent keeps us attached.
        if beacon.parent_logical == self.tree.ancestor_id {
            return true;
        }
        // Stale view of the tree; ignore.
        if beacon.timestamp_secs < self.last_beacon {
            return false;
        }
        let Some(ancestor) = self.neighborhood.get(self.tree.ancestor_id) else {
            return Self::node_is_better(beacon.root_logical, self.tree.id);
        };
        if Self::node_is_better(beacon.root_logical, ancestor.root_id) {
            return true;
        }
        if beacon.root_logical == ancestor.root_id
            && Self::path_metric(Some(beacon)) >= ancestor.path_metric + JUMP_THRESHOLD
            && beacon.cost <= ancestor.cost + 2
        {
            return true;
        }
        false
    }

    /// Process one beacon: clock bootstrap, adjacency bookkeeping with the
    /// reliability gate, then ancestor election and the tree/neighborhood
    /// update.
    pub fn handle_beacon(&mut self, beacon: &Beacon, clock: &mut OverlayClock) {
        if clock.needs_bootstrap() {
            info!("bootstrapping clock from beacon timestamp {}", beacon.timestamp_secs);
            clock.set_epoch(beacon.timestamp_secs);
        }
        let now = clock.now_secs();
        let sender = beacon.sender.source_logical;
        let self_id = self.tree.id;

        // Adjacency upsert and quality measurement.
        let entry = self.adjacency.upsert(sender, now);
        entry.record_ping(now);
        let measured = entry.quality_at(now);
        entry.quality = measured;
        // The link is only as good as the worse direction.
        if let Some(their_view) = beacon.adjacency.iter().find(|a| a.id == self_id) {
            if their_view.quality < entry.quality {
                entry.quality = their_view.quality;
            }
        }
        if f64::from(entry.quality) <= RELIABILITY_THRESHOLD {
            warn!("beacon from {sender} failed the reliability test");
            return;
        }

        let metric = Self::path_metric(Some(beacon));
        if self.should_be_ancestor(beacon) {
            self.tree.ancestor_id = sender;
            self.tree.root_id = beacon.root_logical;
            self.tree.cost = beacon.cost + 1;
            // TODO: derive the sequence number from the beacon instead of
            // pinning it.
            self.tree.sequence_number = 4;
            self.tree.path_metric = metric;

            // The new ancestor cannot stay listed as a descendant, and the
            // old ancestor entry goes away with its role.
            self.neighborhood.remove(sender);
            if let Some(old) = self.neighborhood.ancestor().map(|e| e.neighbor_id) {
                self.neighborhood.remove(old);
            }
            self.neighborhood.add(NeighborEntry {
                neighbor_id: sender,
                physical_address: beacon.sender.physical_address(),
                root_id: beacon.root_logical,
                cost: beacon.cost,
                path_metric: metric,
                timestamp: beacon.timestamp_secs,
                is_ancestor: true,
            });
            debug!("ancestor updated to {sender}, root {}", beacon.root_logical);
        } else if sender == self.tree.ancestor_id {
            if sender > self_id {
                // Our ancestor no longer claims us; stand up our own tree.
                self.tree.reset_to_root();
                if let Some(old) = self.neighborhood.ancestor().map(|e| e.neighbor_id) {
                    self.neighborhood.remove(old);
                }
                info!("self-promoted to root of a new tree");
            } else {
                self.tree.root_id = beacon.root_logical;
                self.tree.ancestor_id = sender;
                self.tree.cost = beacon.cost + 1;
                self.tree.sequence_number = 4;
                self.tree.path_metric = metric;
                if let Some(anc) = self.neighborhood.ancestor_mut() {
                    anc.root_id = beacon.root_logical;
                    anc.cost = beacon.cost + 1;
                    anc.timestamp = beacon.timestamp_secs;
                    anc.path_metric = metric;
                }
            }
        } else if beacon.parent_logical == self_id {
            // The sender attached below us.
            match self.neighborhood.get_mut(sender) {
                Some(desc) => {
                    desc.root_id = beacon.root_logical;
                    desc.cost = beacon.cost;
                    desc.timestamp = beacon.timestamp_secs;
                    desc.path_metric = metric;
                }
                None => {
                    self.neighborhood.add(NeighborEntry {
                        neighbor_id: sender,
                        physical_address: beacon.sender.physical_address(),
                        root_id: beacon.root_logical,
                        cost: beacon.cost,
                        path_metric: metric,
                        timestamp: beacon.timestamp_secs,
                        is_ancestor: false,
                    });
                }
            }
        } else {
            // Not our ancestor, not our descendant; drop any stale
            // descendant entry.
            self.neighborhood.remove(sender);
        }
    }

    /// Goodbye handling is a no-op beyond the parse in this revision; the
    /// timeout sweep reclaims the peer's entries.
    pub fn handle_goodbye(&mut self, goodbye: &Goodbye) {
        debug!("goodbye from {}", goodbye.sender.source_logical);
    }

    fn send_beacon(&mut self, now: u64, identity: &SenderTable, outbound: &PacketFifo) {
        let beacon = Beacon {
            sender: identity.clone(),
            root_logical: self.tree.root_id,
            parent_logical: self.tree.ancestor_id,
            cost: self.tree.cost,
            timestamp_secs: now,
            adjacency: self.adjacency.snapshot(),
            // Written as the full path metric, not a measured value.
            reliability: PATH_METRIC_FULL as u16,
        };
        match message::encode_beacon(&beacon, PROTOCOL_SPT, self.overlay_hash) {
            Ok(packet) => {
                if outbound.push(packet).is_err() {
                    error!("send buffer full, beacon dropped");
                }
            }
            Err(e) => error!("failed to encode beacon: {e}"),
        }
        self.last_beacon = now;
    }

    fn send_data_probe(&self, identity: &SenderTable, outbound: &PacketFifo) {
        let Some(payload) = &self.data_probe else { return };
        let msg = match OverlayMessage::with_payload(identity.source_logical, payload) {
            Ok(m) => m,
            Err(e) => {
                error!("failed to build data probe: {e}");
                return;
            }
        };
        match msg.encode() {
            Ok(packet) => {
                if outbound.push(packet).is_err() {
                    error!("send buffer full, data probe dropped");
                }
            }
            Err(e) => error!("failed to encode data probe: {e}"),
        }
    }
}

impl TreeProtocol for SptProtocol {
    fn id(&self) -> u8 {
        PROTOCOL_SPT
    }

    fn overlay_hash(&self) -> u32 {
        self.overlay_hash
    }

    fn handle_message(
        &mut self,
        packet: &[u8],
        message_type: u8,
        clock: &mut OverlayClock,
    ) -> Result<(), ProtocolError> {
        match message_type {
            MSG_TYPE_BEACON => {
                let beacon = message::parse_beacon(packet)?;
                self.handle_beacon(&beacon, clock);
                Ok(())
            }
            MSG_TYPE_GOODBYE => {
                let goodbye = message::parse_goodbye(packet)?;
                self.handle_goodbye(&goodbye);
                Ok(())
            }
            MSG_TYPE_ROUTE_REQ | MSG_TYPE_ROUTE_REPLY => {
                debug!("route request/reply not supported, ignoring");
                Ok(())
            }
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    /// Emit a beacon when the heartbeat elapsed, then sweep stale table
    /// entries. Losing the ancestor to the sweep resets us to our own root.
    fn maintain(&mut self, clock: &mut OverlayClock, identity: &SenderTable, outbound: &PacketFifo) {
        let now = clock.now_secs();
        if now.saturating_sub(self.last_beacon) >= self.heartbeat_secs {
            self.send_beacon(now, identity, outbound);
            self.send_data_probe(identity, outbound);
        }

        let expired = self.adjacency.expire(now);
        if expired > 0 {
            info!("{expired} adjacent node(s) timed out of the overlay");
        }
        if self.neighborhood.expire(now) {
            info!("ancestor timed out, resetting to self-rooted tree");
            self.tree.reset_to_root();
        }
    }

    /// SPT forwards for any sender today; the hook stays so a protocol with
    /// real trust state can refuse.
    fn sender_trusted(&self, _msg: &OverlayMessage) -> bool {
        true
    }

    fn report(&self, now: u64) -> StateReport {
        StateReport {
            protocol_id: PROTOCOL_SPT,
            timestamp: now,
            tree: self.tree.clone(),
            neighbors: self.neighborhood.iter().cloned().collect(),
            adjacency: self
                .adjacency
                .iter()
                .map(|e| AdjacencySample {
                    id: e.id,
                    quality: e.quality,
                    last_seen: e.timestamp,
                })
                .collect(),
        }
    }
}
