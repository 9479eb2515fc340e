//! SPT control message codec.
//!
//! Beacons and goodbyes share the 5-byte protocol prefix (already vetted by
//! the dispatch layer) followed by the 0xff41 sender-table marker and one
//! sender-table interface. Timestamps travel as milliseconds on the wire and
//! are held as seconds in memory. All offsets below are bit offsets from the
//! start of the packet.

use crate::buffer::Packet;
use crate::config::MAX_DATAGRAM_BYTES;
use crate::protocol::ProtocolError;
use crate::wire;
use std::net::Ipv4Addr;

/// Version nibble stamped next to the protocol id.
pub const SPT_PROTOCOL_VERSION: u8 = 3;

pub const MSG_TYPE_BEACON: u8 = 0;
pub const MSG_TYPE_GOODBYE: u8 = 1;
pub const MSG_TYPE_ROUTE_REQ: u8 = 2;
pub const MSG_TYPE_ROUTE_REPLY: u8 = 3;

/// Bits of shared prefix before any message body.
pub const PROTOCOL_HEADER_BITS: usize = 64;

/// Literal that precedes the sender table on the wire. Undocumented
/// upstream; peers reject beacons without it, so it stays bit-identical.
pub const SENDER_TABLE_MARKER: u16 = 0xff41;

/// Only IPv4-plus-port interfaces are understood: 4 address bytes + 2 port
/// bytes.
pub const SENDER_ADDRESS_LENGTH: u8 = 6;

/// IPv4 address family tag for sender entries.
pub const ADDRESS_FAMILY_IPV4: u8 = 1;

/// One interface of a node: where the node can be reached and the hash it
/// advertises for that interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderEntry {
    pub family: u8,
    pub hash: u16,
    pub address: Ipv4Addr,
    pub port: u16,
}

/// The network-layer identity of a message's sender: exactly one interface
/// plus the node's logical address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderTable {
    pub entry: SenderEntry,
    pub source_logical: u32,
}

impl SenderTable {
    /// Identity advertised by this node.
    pub fn local(address: Ipv4Addr, port: u16, hash: u16, source_logical: u32) -> Self {
        Self {
            entry: SenderEntry {
                family: ADDRESS_FAMILY_IPV4,
                hash,
                address,
                port,
            },
            source_logical,
        }
    }

    /// The interface address packed as a 32-bit integer, for telemetry and
    /// table bookkeeping.
    pub fn physical_address(&self) -> u32 {
        u32::from(self.entry.address)
    }
}

/// One peer-quality observation carried inside a beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjacencyInfo {
    pub id: u32,
    /// Low 7 bits only; the top bit is reserved on the wire.
    pub quality: u8,
}

/// Periodic tree-state announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub sender: SenderTable,
    pub root_logical: u32,
    pub parent_logical: u32,
    pub cost: u32,
    pub timestamp_secs: u64,
    pub adjacency: Vec<AdjacencyInfo>,
    pub reliability: u16,
}

/// Leave announcement. Parsed for wire compatibility; handling is a no-op in
/// this revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goodbye {
    pub sender: SenderTable,
}

/// Parse the sender table starting at `start_bits`. Returns the table and
/// the bit offset just past it.
fn parse_sender_table(packet: &[u8], start_bits: usize) -> Result<(SenderTable, usize), ProtocolError> {
    let hash = wire::read_uint(packet, 16, start_bits)? as u16;
    let address_length = wire::read_uint(packet, 8, start_bits + 16)?;
    if address_length != u64::from(SENDER_ADDRESS_LENGTH) {
        return Err(ProtocolError::BadAddressLength(address_length));
    }
    let mut octets = [0u8; 4];
    for (j, octet) in octets.iter_mut().enumerate() {
        *octet = wire::read_uint(packet, 8, start_bits + 24 + j * 8)? as u8;
    }
    let port = wire::read_uint(packet, 16, start_bits + 24 + 32)? as u16;
    let cursor = start_bits + 24 + usize::from(SENDER_ADDRESS_LENGTH) * 8;
    let source_logical = wire::read_uint(packet, 32, cursor)? as u32;
    Ok((
        SenderTable {
            entry: SenderEntry {
                family: ADDRESS_FAMILY_IPV4,
                hash,
                address: Ipv4Addr::from(octets),
                port,
            },
            source_logical,
        },
        cursor + 32,
    ))
}

fn encode_sender_table(buf: &mut [u8], table: &SenderTable, start_bits: usize) -> Result<usize, ProtocolError> {
    wire::write_uint(buf, u64::from(table.entry.hash), 16, start_bits)?;
    wire::write_uint(buf, u64::from(SENDER_ADDRESS_LENGTH), 8, start_bits + 16)?;
    for (j, octet) in table.entry.address.octets().iter().enumerate() {
        wire::write_uint(buf, u64::from(*octet), 8, start_bits + 24 + j * 8)?;
    }
    wire::write_uint(buf, u64::from(table.entry.port), 16, start_bits + 24 + 32)?;
    let cursor = start_bits + 24 + usize::from(SENDER_ADDRESS_LENGTH) * 8;
    wire::write_uint(buf, u64::from(table.source_logical), 32, cursor)?;
    Ok(cursor + 32)
}

/// Write the shared prefix and return the message-body start offset. The
/// length field counts total bytes minus 3.
fn encode_prefix(
    buf: &mut [u8],
    protocol_id: u8,
    message_type: u8,
    overlay_hash: u32,
    total_bytes: usize,
) -> Result<usize, ProtocolError> {
    wire::write_uint(buf, u64::from(protocol_id), 4, 0)?;
    wire::write_uint(buf, u64::from(SPT_PROTOCOL_VERSION), 4, 4)?;
    wire::write_uint(buf, (total_bytes - 3) as u64, 16, 8)?;
    wire::write_uint(buf, u64::from(message_type), 8, 24)?;
    wire::write_uint(buf, u64::from(overlay_hash), 32, 32)?;
    wire::write_uint(buf, u64::from(SENDER_TABLE_MARKER), 16, PROTOCOL_HEADER_BITS)?;
    Ok(PROTOCOL_HEADER_BITS + 16)
}

/// Parse a beacon body. The prefix has been vetted already; parsing starts
/// right after it at the sender-table marker.
pub fn parse_beacon(packet: &[u8]) -> Result<Beacon, ProtocolError> {
    let (sender, cursor) = parse_sender_table(packet, PROTOCOL_HEADER_BITS + 16)?;
    let root_logical = wire::read_uint(packet, 32, cursor)? as u32;
    let parent_logical = wire::read_uint(packet, 32, cursor + 32)? as u32;
    let cost = wire::read_uint(packet, 32, cursor + 64)? as u32;
    // Peers speak milliseconds; we keep seconds.
    let timestamp_secs = wire::read_uint(packet, 64, cursor + 96)? / 1000;
    let size = wire::read_uint(packet, 32, cursor + 160)?;

    // Bound the advertised table against the physical packet before any
    // allocation.
    if size > (packet.len() as u64) * 8 / 40 {
        return Err(ProtocolError::AdjacencyOverrun);
    }
    let entries_start = cursor + 192;
    let reliability_end = entries_start + (size as usize) * 40 + 16;
    if packet.len() * 8 < reliability_end {
        return Err(ProtocolError::AdjacencyOverrun);
    }

    let mut adjacency = Vec::with_capacity(size as usize);
    for i in 0..size as usize {
        adjacency.push(AdjacencyInfo {
            id: wire::read_uint(packet, 32, entries_start + i * 40)? as u32,
            quality: (wire::read_uint(packet, 8, entries_start + i * 40 + 32)? as u8) & 0x7F,
        });
    }
    let reliability = wire::read_uint(packet, 16, entries_start + size as usize * 40)? as u16;

    Ok(Beacon {
        sender,
        root_logical,
        parent_logical,
        cost,
        timestamp_secs,
        adjacency,
        reliability,
    })
}

/// Encode a beacon, prefix included.
pub fn encode_beacon(beacon: &Beacon, protocol_id: u8, overlay_hash: u32) -> Result<Packet, ProtocolError> {
    // Prefix 8, marker 2, interface 9, source logical 4, tree fields 20,
    // adjacency size 4 + 5 per entry, reliability 2.
    let total = 49 + 5 * beacon.adjacency.len();
    if total > MAX_DATAGRAM_BYTES {
        return Err(ProtocolError::TooLarge(total));
    }
    let mut buf = vec![0u8; total];
    encode_prefix(&mut buf, protocol_id, MSG_TYPE_BEACON, overlay_hash, total)?;
    let cursor = encode_sender_table(&mut buf, &beacon.sender, PROTOCOL_HEADER_BITS + 16)?;
    wire::write_uint(&mut buf, u64::from(beacon.root_logical), 32, cursor)?;
    wire::write_uint(&mut buf, u64::from(beacon.parent_logical), 32, cursor + 32)?;
    wire::write_uint(&mut buf, u64::from(beacon.cost), 32, cursor + 64)?;
    wire::write_uint(&mut buf, beacon.timestamp_secs * 1000, 64, cursor + 96)?;
    wire::write_uint(&mut buf, beacon.adjacency.len() as u64, 32, cursor + 160)?;
    let entries_start = cursor + 192;
    for (i, entry) in beacon.adjacency.iter().enumerate() {
        wire::write_uint(&mut buf, u64::from(entry.id), 32, entries_start + i * 40)?;
        wire::write_uint(&mut buf, u64::from(entry.quality), 8, entries_start + i * 40 + 32)?;
    }
    wire::write_uint(
        &mut buf,
        u64::from(beacon.reliability),
        16,
        entries_start + beacon.adjacency.len() * 40,
    )?;
    Ok(buf)
}

/// Parse a goodbye body: sender table only.
pub fn parse_goodbye(packet: &[u8]) -> Result<Goodbye, ProtocolError> {
    let (sender, _) = parse_sender_table(packet, PROTOCOL_HEADER_BITS + 16)?;
    Ok(Goodbye { sender })
}

/// Encode a goodbye, prefix included.
pub fn encode_goodbye(goodbye: &Goodbye, protocol_id: u8, overlay_hash: u32) -> Result<Packet, ProtocolError> {
    let total = 23;
    let mut buf = vec![0u8; total];
    encode_prefix(&mut buf, protocol_id, MSG_TYPE_GOODBYE, overlay_hash, total)?;
    encode_sender_table(&mut buf, &goodbye.sender, PROTOCOL_HEADER_BITS + 16)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_SPT;

    fn sample_beacon() -> Beacon {
        Beacon {
            sender: SenderTable::local(Ipv4Addr::new(224, 228, 19, 78), 9472, 64935, 101),
            root_logical: 900,
            parent_logical: 450,
            cost: 3,
            timestamp_secs: 1_700_000_123,
            adjacency: vec![
                AdjacencyInfo { id: 450, quality: 9 },
                AdjacencyInfo { id: 777, quality: 4 },
            ],
            reliability: 10_000,
        }
    }

    #[test]
    fn test_beacon_round_trip() {
        let beacon = sample_beacon();
        let packet = encode_beacon(&beacon, PROTOCOL_SPT, 0x57294B95).unwrap();
        assert_eq!(packet.len(), 49 + 5 * 2);
        let parsed = parse_beacon(&packet).unwrap();
        assert_eq!(parsed, beacon);
    }

    #[test]
    fn test_beacon_prefix_layout() {
        let packet = encode_beacon(&sample_beacon(), PROTOCOL_SPT, 0x57294B95).unwrap();
        assert_eq!(wire::read_uint(&packet, 4, 0).unwrap(), u64::from(PROTOCOL_SPT));
        assert_eq!(wire::read_uint(&packet, 16, 8).unwrap(), packet.len() as u64 - 3);
        assert_eq!(wire::read_uint(&packet, 8, 24).unwrap(), u64::from(MSG_TYPE_BEACON));
        assert_eq!(wire::read_uint(&packet, 32, 32).unwrap(), 0x57294B95);
        assert_eq!(
            wire::read_uint(&packet, 16, 64).unwrap(),
            u64::from(SENDER_TABLE_MARKER)
        );
    }

    #[test]
    fn test_quality_masked_to_low_seven_bits() {
        let mut beacon = sample_beacon();
        beacon.adjacency = vec![AdjacencyInfo { id: 1, quality: 0x7F }];
        let mut packet = encode_beacon(&beacon, PROTOCOL_SPT, 1).unwrap();
        // Force the reserved top bit on the wire; the parser must strip it.
        let quality_offset = (64 + 16) + 72 + 32 + 160 + 32 + 32;
        wire::write_uint(&mut packet, 0xFF, 8, quality_offset).unwrap();
        let parsed = parse_beacon(&packet).unwrap();
        assert_eq!(parsed.adjacency[0].quality, 0x7F);
    }

    #[test]
    fn test_bad_address_length_rejected() {
        let mut packet = encode_beacon(&sample_beacon(), PROTOCOL_SPT, 1).unwrap();
        wire::write_uint(&mut packet, 8, 8, PROTOCOL_HEADER_BITS + 16 + 16).unwrap();
        assert!(matches!(
            parse_beacon(&packet),
            Err(ProtocolError::BadAddressLength(8))
        ));
    }

    #[test]
    fn test_adjacency_overrun_rejected() {
        let mut packet = encode_beacon(&sample_beacon(), PROTOCOL_SPT, 1).unwrap();
        // Claim far more adjacency entries than the packet can hold.
        let size_offset = (64 + 16) + 72 + 32 + 160;
        wire::write_uint(&mut packet, 1_000, 32, size_offset).unwrap();
        assert!(matches!(
            parse_beacon(&packet),
            Err(ProtocolError::AdjacencyOverrun)
        ));
    }

    #[test]
    fn test_goodbye_round_trip() {
        let goodbye = Goodbye {
            sender: SenderTable::local(Ipv4Addr::new(224, 228, 19, 78), 9472, 64935, 55),
        };
        let packet = encode_goodbye(&goodbye, PROTOCOL_SPT, 7).unwrap();
        assert_eq!(packet.len(), 23);
        assert_eq!(wire::read_uint(&packet, 8, 24).unwrap(), u64::from(MSG_TYPE_GOODBYE));
        assert_eq!(parse_goodbye(&packet).unwrap(), goodbye);
    }

    #[test]
    fn test_timestamp_travels_as_milliseconds() {
        let beacon = sample_beacon();
        let packet = encode_beacon(&beacon, PROTOCOL_SPT, 1).unwrap();
        let ts_offset = (64 + 16) + 72 + 32 + 96;
        assert_eq!(
            wire::read_uint(&packet, 64, ts_offset).unwrap(),
            beacon.timestamp_secs * 1000
        );
    }
}
