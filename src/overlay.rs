//! Overlay data messages and their extension chain.
//!
//! An overlay packet is a fixed 19-byte header followed by a chain of typed,
//! length-prefixed extensions. Each extension's three prefix bytes carry the
//! *next* extension's type (0 terminates the chain), the size of the length
//! field (always 1), and the body length; the first extension's type is
//! stamped into the header. In memory the chain is an ordered sequence of
//! tagged variants with explicit order numbers starting at 1; "first of
//! type" lookups resolve by lowest order.

use crate::buffer::Packet;
use crate::config::MAX_DATAGRAM_BYTES;
use crate::protocol::PROTOCOL_OVERLAY_DATA;
use crate::wire::{self, WireError};

/// Version stamped on locally originated messages.
pub const OVERLAY_VERSION: u8 = 3;

/// Data mode for multicast dissemination, the only mode in use.
pub const DATA_MODE_MULTICAST: u8 = 1;

/// Hop budget for locally originated messages.
pub const DEFAULT_HOP_LIMIT: u16 = 254;

/// Extension slots per message.
pub const MAX_EXTENSIONS: usize = 10;

/// Logical addresses a route record can hold.
pub const MAX_ROUTE_RECORD: usize = 256;

/// Chain terminator on the wire.
pub const EXT_TYPE_NONE: u8 = 0;
pub const EXT_TYPE_PAYLOAD: u8 = 2;
pub const EXT_TYPE_ROUTE_RECORD: u8 = 3;

/// Header size in bits; shorter packets cannot be overlay messages.
pub const OVERLAY_HEADER_BITS: usize = 152;

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("packet of {0} bytes is too short for an overlay header")]
    Truncated(usize),
    #[error("unknown extension type {0}")]
    UnknownExtension(u8),
    #[error("no free extension slot")]
    ExtensionsFull,
    #[error("route record is full")]
    RouteRecordFull,
    #[error("encoded message of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionKind {
    Payload(Vec<u8>),
    RouteRecord(Vec<u32>),
}

impl ExtensionKind {
    pub fn wire_type(&self) -> u8 {
        match self {
            ExtensionKind::Payload(_) => EXT_TYPE_PAYLOAD,
            ExtensionKind::RouteRecord(_) => EXT_TYPE_ROUTE_RECORD,
        }
    }

    /// Body length in bytes as carried by the extension's length field.
    pub fn body_len(&self) -> usize {
        match self {
            ExtensionKind::Payload(bytes) => bytes.len(),
            ExtensionKind::RouteRecord(addrs) => addrs.len() * 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    /// Position in the chain, starting at 1. Orders are unique per message.
    pub order: u8,
    pub kind: ExtensionKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayMessage {
    pub version: u8,
    pub data_mode: u8,
    pub hop_limit: u16,
    pub source_logical: u32,
    pub previous_hop_logical: u32,
    pub extensions: Vec<Extension>,
}

impl OverlayMessage {
    /// A locally originated data message: payload first, then a route record
    /// seeded with the sender.
    pub fn with_payload(source_logical: u32, payload: &[u8]) -> Result<Self, OverlayError> {
        let mut msg = Self {
            version: OVERLAY_VERSION,
            data_mode: DATA_MODE_MULTICAST,
            hop_limit: DEFAULT_HOP_LIMIT,
            source_logical,
            previous_hop_logical: source_logical,
            extensions: Vec::new(),
        };
        msg.insert_extension(Extension {
            order: 1,
            kind: ExtensionKind::Payload(payload.to_vec()),
        })?;
        msg.insert_extension(Extension {
            order: 2,
            kind: ExtensionKind::RouteRecord(vec![source_logical]),
        })?;
        Ok(msg)
    }

    /// Parse an overlay packet, walking the extension chain until the
    /// terminator. An unknown extension type aborts the parse.
    pub fn parse(packet: &[u8]) -> Result<Self, OverlayError> {
        if packet.len() < OVERLAY_HEADER_BITS / 8 {
            return Err(OverlayError::Truncated(packet.len()));
        }

        let mut msg = Self {
            version: wire::read_uint(packet, 4, 8)? as u8,
            data_mode: wire::read_uint(packet, 4, 12)? as u8,
            hop_limit: wire::read_uint(packet, 16, 56)? as u16,
            source_logical: wire::read_uint(packet, 32, 88)? as u32,
            previous_hop_logical: wire::read_uint(packet, 32, 120)? as u32,
            extensions: Vec::new(),
        };

        let mut ext_type = wire::read_uint(packet, 8, 72)? as u8;
        let mut cursor = OVERLAY_HEADER_BITS;
        let mut order: u8 = 1;
        while ext_type != EXT_TYPE_NONE {
            let next_type = wire::read_uint(packet, 8, cursor)? as u8;
            // Byte at cursor+8 is the length-of-length field, fixed to 1.
            let length = wire::read_uint(packet, 8, cursor + 16)? as usize;
            let kind = match ext_type {
                EXT_TYPE_PAYLOAD => ExtensionKind::Payload(if length == 0 {
                    Vec::new()
                } else {
                    wire::snip(packet, length * 8, cursor + 24)?
                }),
                EXT_TYPE_ROUTE_RECORD => {
                    let count = length / 4;
                    let mut addrs = Vec::with_capacity(count);
                    for i in 0..count {
                        addrs.push(wire::read_uint(packet, 32, cursor + 24 + i * 32)? as u32);
                    }
                    ExtensionKind::RouteRecord(addrs)
                }
                other => return Err(OverlayError::UnknownExtension(other)),
            };
            msg.insert_extension(Extension { order, kind })?;
            cursor += 24 + length * 8;
            order += 1;
            ext_type = next_type;
        }

        Ok(msg)
    }

    /// Encode the message, emitting extensions in order 1..k and stamping
    /// the first extension's type and the aggregate extension byte count
    /// into the header.
    pub fn encode(&self) -> Result<Packet, OverlayError> {
        let mut ordered: Vec<&Extension> = Vec::with_capacity(self.extensions.len());
        loop {
            let want = ordered.len() as u8 + 1;
            match self.extensions.iter().find(|e| e.order == want) {
                Some(ext) => ordered.push(ext),
                None => break,
            }
        }

        let ext_bytes: usize = ordered.iter().map(|e| 3 + e.kind.body_len()).sum();
        let total = OVERLAY_HEADER_BITS / 8 + ext_bytes;
        if total > MAX_DATAGRAM_BYTES {
            return Err(OverlayError::TooLarge(total));
        }

        let mut buf = vec![0u8; total];
        wire::write_uint(&mut buf, u64::from(PROTOCOL_OVERLAY_DATA), 4, 0)?;
        wire::write_uint(&mut buf, 0, 4, 4)?;
        wire::write_uint(&mut buf, u64::from(self.version), 4, 8)?;
        wire::write_uint(&mut buf, u64::from(self.data_mode), 4, 12)?;
        wire::write_uint(&mut buf, 0, 24, 16)?;
        wire::write_uint(&mut buf, ext_bytes as u64, 16, 40)?;
        wire::write_uint(&mut buf, u64::from(self.hop_limit), 16, 56)?;
        let first_type = ordered.first().map_or(EXT_TYPE_NONE, |e| e.kind.wire_type());
        wire::write_uint(&mut buf, u64::from(first_type), 8, 72)?;
        // Logical addresses are always 4 bytes on this overlay.
        wire::write_uint(&mut buf, 4, 8, 80)?;
        wire::write_uint(&mut buf, u64::from(self.source_logical), 32, 88)?;
        wire::write_uint(&mut buf, u64::from(self.previous_hop_logical), 32, 120)?;

        let mut cursor = OVERLAY_HEADER_BITS;
        for (i, ext) in ordered.iter().enumerate() {
            let next_type = ordered.get(i + 1).map_or(EXT_TYPE_NONE, |e| e.kind.wire_type());
            wire::write_uint(&mut buf, u64::from(next_type), 8, cursor)?;
            wire::write_uint(&mut buf, 1, 8, cursor + 8)?;
            wire::write_uint(&mut buf, ext.kind.body_len() as u64, 8, cursor + 16)?;
            match &ext.kind {
                ExtensionKind::Payload(bytes) => {
                    if !bytes.is_empty() {
                        wire::write_bytes_aligned(&mut buf, bytes, bytes.len() * 8, cursor + 24)?;
                    }
                }
                ExtensionKind::RouteRecord(addrs) => {
                    for (j, addr) in addrs.iter().enumerate() {
                        wire::write_uint(&mut buf, u64::from(*addr), 32, cursor + 24 + j * 32)?;
                    }
                }
            }
            cursor += (3 + ext.kind.body_len()) * 8;
        }

        Ok(buf)
    }

    /// Attach an extension, refusing once all slots are taken.
    pub fn insert_extension(&mut self, extension: Extension) -> Result<(), OverlayError> {
        if self.extensions.len() >= MAX_EXTENSIONS {
            return Err(OverlayError::ExtensionsFull);
        }
        self.extensions.push(extension);
        Ok(())
    }

    /// Earliest extension of the given wire type.
    pub fn extension_of_type(&self, wire_type: u8) -> Option<&Extension> {
        self.extensions
            .iter()
            .filter(|e| e.kind.wire_type() == wire_type)
            .min_by_key(|e| e.order)
    }

    /// The payload delivered to the application: the earliest payload
    /// extension in chain order.
    pub fn primary_payload(&self) -> Option<&[u8]> {
        match &self.extension_of_type(EXT_TYPE_PAYLOAD)?.kind {
            ExtensionKind::Payload(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// One past the highest order in use.
    pub fn next_order(&self) -> u8 {
        self.extensions.iter().map(|e| e.order).max().unwrap_or(0) + 1
    }

    pub fn route_record_contains(&self, logical: u32) -> bool {
        match self.extension_of_type(EXT_TYPE_ROUTE_RECORD).map(|e| &e.kind) {
            Some(ExtensionKind::RouteRecord(addrs)) => addrs.contains(&logical),
            _ => false,
        }
    }

    /// Stamp a logical address into the route record, creating the record if
    /// the originator omitted one.
    pub fn route_record_append(&mut self, logical: u32) -> Result<(), OverlayError> {
        let record = self
            .extensions
            .iter_mut()
            .filter(|e| e.kind.wire_type() == EXT_TYPE_ROUTE_RECORD)
            .min_by_key(|e| e.order);
        match record {
            Some(ext) => {
                if let ExtensionKind::RouteRecord(addrs) = &mut ext.kind {
                    if addrs.len() >= MAX_ROUTE_RECORD {
                        return Err(OverlayError::RouteRecordFull);
                    }
                    addrs.push(logical);
                }
                Ok(())
            }
            None => {
                let order = self.next_order();
                self.insert_extension(Extension {
                    order,
                    kind: ExtensionKind::RouteRecord(vec![logical]),
                })
            }
        }
    }
}
