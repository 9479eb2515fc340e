//! Overlay codec tests
//!
//! Run with: cargo test --test overlay_test

use treecast::overlay::{
    Extension, ExtensionKind, OverlayError, OverlayMessage, EXT_TYPE_NONE, EXT_TYPE_PAYLOAD,
    EXT_TYPE_ROUTE_RECORD,
};
use treecast::wire;
use treecast::PROTOCOL_OVERLAY_DATA;

fn message_with(extensions: Vec<Extension>) -> OverlayMessage {
    OverlayMessage {
        version: 3,
        data_mode: 1,
        hop_limit: 254,
        source_logical: 77,
        previous_hop_logical: 77,
        extensions,
    }
}

// =============================================================================
// ROUND TRIPS
// =============================================================================

#[test]
fn test_round_trip_payload_and_route_record() {
    let msg = OverlayMessage::with_payload(77, b"tree payload").unwrap();
    let packet = msg.encode().unwrap();
    let parsed = OverlayMessage::parse(&packet).unwrap();
    assert_eq!(parsed, msg);
}

#[test]
fn test_round_trip_payload_only() {
    let msg = message_with(vec![Extension {
        order: 1,
        kind: ExtensionKind::Payload(b"just data".to_vec()),
    }]);
    let parsed = OverlayMessage::parse(&msg.encode().unwrap()).unwrap();
    assert_eq!(parsed, msg);
}

#[test]
fn test_round_trip_route_record_only() {
    let msg = message_with(vec![Extension {
        order: 1,
        kind: ExtensionKind::RouteRecord(vec![10, 20, 30]),
    }]);
    let parsed = OverlayMessage::parse(&msg.encode().unwrap()).unwrap();
    assert_eq!(parsed, msg);
}

#[test]
fn test_round_trip_no_extensions() {
    let msg = message_with(Vec::new());
    let packet = msg.encode().unwrap();
    assert_eq!(packet.len(), 19);
    let parsed = OverlayMessage::parse(&packet).unwrap();
    assert_eq!(parsed, msg);
}

// =============================================================================
// WIRE LAYOUT
// =============================================================================

#[test]
fn test_header_layout() {
    let msg = OverlayMessage::with_payload(0x01020304, b"abc").unwrap();
    let packet = msg.encode().unwrap();

    assert_eq!(wire::read_uint(&packet, 4, 0).unwrap(), u64::from(PROTOCOL_OVERLAY_DATA));
    assert_eq!(wire::read_uint(&packet, 4, 4).unwrap(), 0);
    assert_eq!(wire::read_uint(&packet, 4, 8).unwrap(), 3);
    assert_eq!(wire::read_uint(&packet, 4, 12).unwrap(), 1);
    assert_eq!(wire::read_uint(&packet, 24, 16).unwrap(), 0);
    // Aggregate extension bytes: (3 + 3) payload + (3 + 4) route record.
    assert_eq!(wire::read_uint(&packet, 16, 40).unwrap(), 13);
    assert_eq!(wire::read_uint(&packet, 16, 56).unwrap(), 254);
    assert_eq!(wire::read_uint(&packet, 8, 72).unwrap(), u64::from(EXT_TYPE_PAYLOAD));
    assert_eq!(wire::read_uint(&packet, 8, 80).unwrap(), 4);
    assert_eq!(wire::read_uint(&packet, 32, 88).unwrap(), 0x01020304);
    assert_eq!(wire::read_uint(&packet, 32, 120).unwrap(), 0x01020304);
}

#[test]
fn test_extension_chain_prefixes() {
    let msg = OverlayMessage::with_payload(9, b"xy").unwrap();
    let packet = msg.encode().unwrap();

    // First extension (payload): next type is the route record.
    assert_eq!(wire::read_uint(&packet, 8, 152).unwrap(), u64::from(EXT_TYPE_ROUTE_RECORD));
    assert_eq!(wire::read_uint(&packet, 8, 160).unwrap(), 1);
    assert_eq!(wire::read_uint(&packet, 8, 168).unwrap(), 2);
    assert_eq!(&packet[22..24], b"xy");

    // Second extension (route record): chain terminates.
    let second = 152 + (3 + 2) * 8;
    assert_eq!(wire::read_uint(&packet, 8, second).unwrap(), u64::from(EXT_TYPE_NONE));
    assert_eq!(wire::read_uint(&packet, 8, second + 16).unwrap(), 4);
    assert_eq!(wire::read_uint(&packet, 32, second + 24).unwrap(), 9);
}

#[test]
fn test_parse_skips_reserved_header_bytes() {
    let msg = message_with(Vec::new());
    let mut packet = msg.encode().unwrap();
    // Garbage in the reserved bytes must not affect the parse.
    wire::write_uint(&mut packet, 0xABCDEF, 24, 16).unwrap();
    let parsed = OverlayMessage::parse(&packet).unwrap();
    assert_eq!(parsed, msg);
}

// =============================================================================
// FAILURE MODES
// =============================================================================

#[test]
fn test_unknown_extension_type_aborts_parse() {
    let msg = message_with(vec![Extension {
        order: 1,
        kind: ExtensionKind::Payload(b"p".to_vec()),
    }]);
    let mut packet = msg.encode().unwrap();
    // Stamp an unassigned type as the first extension.
    wire::write_uint(&mut packet, 9, 8, 72).unwrap();
    assert!(matches!(
        OverlayMessage::parse(&packet),
        Err(OverlayError::UnknownExtension(9))
    ));
}

#[test]
fn test_truncated_packet_rejected() {
    let packet = OverlayMessage::with_payload(5, b"abc").unwrap().encode().unwrap();
    assert!(OverlayMessage::parse(&packet[..15]).is_err());
}

#[test]
fn test_truncated_extension_body_rejected() {
    let msg = message_with(vec![Extension {
        order: 1,
        kind: ExtensionKind::Payload(vec![7; 40]),
    }]);
    let packet = msg.encode().unwrap();
    // Cut into the payload body; the snip must fail, not wrap.
    assert!(OverlayMessage::parse(&packet[..packet.len() - 10]).is_err());
}

// =============================================================================
// ROUTE RECORD
// =============================================================================

#[test]
fn test_contains_after_append() {
    let mut msg = message_with(vec![Extension {
        order: 1,
        kind: ExtensionKind::Payload(b"p".to_vec()),
    }]);
    assert!(!msg.route_record_contains(321));
    msg.route_record_append(321).unwrap();
    assert!(msg.route_record_contains(321));

    // Survives the wire.
    let parsed = OverlayMessage::parse(&msg.encode().unwrap()).unwrap();
    assert!(parsed.route_record_contains(321));
}

#[test]
fn test_append_extends_existing_record() {
    let mut msg = OverlayMessage::with_payload(11, b"p").unwrap();
    msg.route_record_append(22).unwrap();
    let parsed = OverlayMessage::parse(&msg.encode().unwrap()).unwrap();
    assert!(parsed.route_record_contains(11));
    assert!(parsed.route_record_contains(22));
}
