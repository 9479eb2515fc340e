//! The overlay engine: one cooperative loop that drives protocol
//! maintenance, drains the inbound FIFO, and forwards overlay data.
//!
//! All protocol state, the clock, and the delivery callback live behind this
//! loop; the socket tasks only ever touch the FIFOs.

use crate::buffer::{Packet, PacketFifo};
use crate::clock::OverlayClock;
use crate::config::{IDLE_DELAY, MIN_PACKET_BYTES};
use crate::measure::StateReport;
use crate::overlay::OverlayMessage;
use crate::protocol::{self, TreeProtocol, PROTOCOL_OVERLAY_DATA};
use crate::spt::message::SenderTable;
use crate::wire;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Invoked synchronously from the engine loop with each locally delivered
/// payload.
pub type DeliveryCallback = Box<dyn FnMut(&[u8]) + Send>;

pub struct Engine {
    inbound: Arc<PacketFifo>,
    outbound: Arc<PacketFifo>,
    protocol: Box<dyn TreeProtocol>,
    clock: OverlayClock,
    identity: SenderTable,
    callback: DeliveryCallback,
    report_tx: Option<watch::Sender<StateReport>>,
}

impl Engine {
    pub fn new(
        inbound: Arc<PacketFifo>,
        outbound: Arc<PacketFifo>,
        protocol: Box<dyn TreeProtocol>,
        identity: SenderTable,
        callback: DeliveryCallback,
        report_tx: Option<watch::Sender<StateReport>>,
    ) -> Self {
        Self {
            inbound,
            outbound,
            protocol,
            clock: OverlayClock::new(),
            identity,
            callback,
            report_tx,
        }
    }

    /// Run forever: maintenance, then at most one inbound packet per
    /// iteration.
    pub async fn run(mut self) {
        info!("engine ready, node {} on overlay {:#010x}", self.identity.source_logical, self.protocol.overlay_hash());
        loop {
            self.protocol.maintain(&mut self.clock, &self.identity, &self.outbound);
            self.publish_report();

            let Some(packet) = self.inbound.pop() else {
                tokio::time::sleep(IDLE_DELAY).await;
                continue;
            };
            self.handle_packet(&packet);
        }
    }

    /// One packet through the dispatch pipeline. Public so the pipeline can
    /// be exercised without a socket.
    pub fn handle_packet(&mut self, packet: &[u8]) {
        if packet.len() < MIN_PACKET_BYTES {
            error!("packet of {} bytes is too short for the overlay, dropped", packet.len());
            return;
        }
        let protocol_id = match wire::read_uint(packet, 4, 0) {
            Ok(id) => id as u8,
            Err(e) => {
                error!("unreadable protocol id: {e}");
                return;
            }
        };
        if protocol_id == PROTOCOL_OVERLAY_DATA {
            self.forward(packet);
        } else if let Err(e) =
            protocol::dispatch(packet, protocol_id, self.protocol.as_mut(), &mut self.clock)
        {
            error!("protocol packet dropped: {e}");
        }
    }

    /// Forwarding path for overlay data: loop suppression via the route
    /// record, hop accounting, re-emission, and local delivery.
    fn forward(&mut self, packet: &[u8]) {
        let mut msg = match OverlayMessage::parse(packet) {
            Ok(msg) => msg,
            Err(e) => {
                error!("failed to parse overlay message: {e}");
                return;
            }
        };

        if !self.protocol.sender_trusted(&msg) {
            debug!("sender {} not trusted, bouncing message", msg.source_logical);
            return;
        }

        let self_id = self.identity.source_logical;
        if msg.route_record_contains(self_id) {
            info!("dropping message from {}: we are on its route record", msg.source_logical);
            return;
        }

        msg.hop_limit = msg.hop_limit.saturating_sub(1);
        msg.previous_hop_logical = self_id;
        if let Err(e) = msg.route_record_append(self_id) {
            error!("could not stamp route record: {e}");
            return;
        }

        match msg.encode() {
            Ok(forwarded) => self.enqueue(forwarded),
            Err(e) => error!("failed to re-encode overlay message: {e}"),
        }

        // Local delivery happens regardless of whether the re-emission fit
        // the send buffer.
        match msg.primary_payload() {
            Some(payload) => (self.callback)(payload),
            None => debug!("no payload extension to deliver"),
        }
    }

    fn enqueue(&self, packet: Packet) {
        if self.outbound.push(packet).is_err() {
            error!("send buffer full, forwarded message dropped");
        }
    }

    fn publish_report(&self) {
        if let Some(tx) = &self.report_tx {
            let _ = tx.send(self.protocol.report(self.clock.now_secs()));
        }
    }
}
