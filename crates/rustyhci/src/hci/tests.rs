//! Unit tests for HCI framing and command serialization

use super::constants::*;
use super::framer::PacketFramer;
use super::packet::*;
use crate::error::HciError;

const RESET_COMPLETE: [u8; 7] = [0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00];

fn sample_stream() -> Vec<u8> {
    let mut stream = Vec::new();
    // Command Complete for Reset
    stream.extend_from_slice(&RESET_COMPLETE);
    // ACL data, handle 0x0040, 5 byte payload
    stream.extend_from_slice(&[0x02, 0x40, 0x00, 0x05, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
    // Header-only command
    stream.extend_from_slice(&[0x01, 0x0C, 0x00]);
    // Event with an empty parameter block
    stream.extend_from_slice(&[0x04, 0x13, 0x00]);
    stream
}

fn frame_all(framer: &mut PacketFramer, chunk: &[u8]) -> Vec<Vec<u8>> {
    framer
        .feed(chunk)
        .map(|packet| packet.unwrap().as_bytes().to_vec())
        .collect()
}

#[test]
fn test_framer_single_chunk() {
    let mut framer = PacketFramer::new();
    let packets = frame_all(&mut framer, &sample_stream());

    assert_eq!(packets.len(), 4);
    assert_eq!(packets[0], RESET_COMPLETE.to_vec());
    assert_eq!(packets[1].len(), 10);
    assert_eq!(packets[2], vec![0x01, 0x0C, 0x00]);
    assert_eq!(packets[3], vec![0x04, 0x13, 0x00]);
    assert_eq!(framer.buffered(), 0);
}

#[test]
fn test_framer_chunking_invariance() {
    let stream = sample_stream();
    let expected = frame_all(&mut PacketFramer::new(), &stream);

    // Every two-way split
    for split in 0..=stream.len() {
        let mut framer = PacketFramer::new();
        let mut packets = frame_all(&mut framer, &stream[..split]);
        packets.extend(frame_all(&mut framer, &stream[split..]));
        assert_eq!(packets, expected, "split at {}", split);
    }

    // One byte at a time
    let mut framer = PacketFramer::new();
    let mut packets = Vec::new();
    for byte in &stream {
        packets.extend(frame_all(&mut framer, std::slice::from_ref(byte)));
    }
    assert_eq!(packets, expected);

    // Uneven chunks
    let mut framer = PacketFramer::new();
    let mut packets = Vec::new();
    for chunk in stream.chunks(4) {
        packets.extend(frame_all(&mut framer, chunk));
    }
    assert_eq!(packets, expected);
}

#[test]
fn test_framer_header_sizes() {
    let mut framer = PacketFramer::new();

    // Event: 3 + L
    let event = [0x04, 0x3E, 0x02, 0x01, 0x02];
    let packet = framer.feed(&event).next().unwrap().unwrap();
    assert_eq!(packet.packet_type(), PacketType::Event);
    assert_eq!(packet.len(), 3 + 2);
    assert_eq!(packet.header(), &[0x04, 0x3E, 0x02]);
    assert_eq!(packet.body(), &[0x01, 0x02]);

    // ACL: 5 + little-endian length, larger than a single byte can hold
    let mut acl = vec![0x02, 0x01, 0x20, 0x00, 0x01];
    acl.extend(std::iter::repeat(0x5A).take(256));
    let packet = framer.feed(&acl).next().unwrap().unwrap();
    assert_eq!(packet.packet_type(), PacketType::AclData);
    assert_eq!(packet.len(), 5 + 256);
    assert_eq!(packet.body().len(), 256);
}

#[test]
fn test_framer_waits_for_more_data() {
    let mut framer = PacketFramer::new();

    assert!(framer.feed(&[0x04, 0x0E]).next().is_none());
    assert!(framer.feed(&[0x04, 0x01, 0x03]).next().is_none());
    assert_eq!(framer.buffered(), 5);

    let packet = framer.feed(&[0x0C, 0x00]).next().unwrap().unwrap();
    assert_eq!(packet.as_bytes(), &RESET_COMPLETE);
    assert_eq!(framer.buffered(), 0);
}

#[test]
fn test_framer_unknown_packet_type() {
    let mut framer = PacketFramer::new();

    let mut chunk = RESET_COMPLETE.to_vec();
    chunk.push(0xFF);
    let results: Vec<_> = framer.feed(&chunk).collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(HciError::UnknownPacketType(0xFF))));
    assert!(framer.is_halted());

    // Nothing is framed until reset, even well-formed packets, and nothing
    // piles up behind the bad byte
    assert_eq!(framer.feed(&RESET_COMPLETE).count(), 0);
    assert_eq!(framer.feed(&RESET_COMPLETE).count(), 0);
    assert_eq!(framer.buffered(), 1);

    framer.reset();
    assert!(!framer.is_halted());
    assert_eq!(framer.buffered(), 0);
    assert_eq!(frame_all(&mut framer, &RESET_COMPLETE).len(), 1);
}

#[test]
fn test_halted_framer_keeps_bytes_for_raw_tap() {
    let mut framer = PacketFramer::new();
    framer.set_raw_tap(true);

    assert!(framer.feed(&[0x07]).next().unwrap().is_err());
    framer.push(&RESET_COMPLETE);
    assert!(framer.next_packet().is_none());
    assert!(contains_reset_complete(framer.raw_tap().unwrap()));
    assert_eq!(framer.buffered(), 1 + RESET_COMPLETE.len());
}

#[test]
fn test_framer_raw_tap_and_finish() {
    let mut framer = PacketFramer::new();
    framer.push(&[0x04, 0x0E]);
    assert!(framer.raw_tap().is_none());
    assert!(framer.finish().is_none());
    assert_eq!(framer.buffered(), 0);

    framer.set_raw_tap(true);
    framer.push(&[0x00, 0x04]);
    framer.push(&[0x0E]);
    assert_eq!(framer.raw_tap(), Some(&[0x00, 0x04, 0x0E][..]));

    let residual = framer.finish().unwrap();
    assert_eq!(&residual[..], &[0x00, 0x04, 0x0E]);
    assert_eq!(framer.buffered(), 0);
    assert!(framer.has_raw_tap());
}

#[test]
fn test_reset_handshake_example() {
    // A header-only command followed by the reset completion event
    let mut framer = PacketFramer::new();
    framer.set_raw_tap(true);

    framer.push(&[0x01, 0x0C, 0x00, 0x04]);
    assert!(!contains_reset_complete(framer.raw_tap().unwrap()));
    framer.push(&[0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]);
    assert!(contains_reset_complete(framer.raw_tap().unwrap()));

    let packets: Vec<_> = std::iter::from_fn(|| framer.next_packet())
        .map(|packet| packet.unwrap())
        .collect();
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].len(), 3);
    assert_eq!(packets[1].packet_type(), PacketType::Event);
    assert_eq!(packets[1].len(), 3 + 4);
    assert!(contains_reset_complete(packets[1].as_bytes()));
}

#[test]
fn test_reset_complete_patterns() {
    for pattern in RESET_COMPLETE_PATTERNS.iter() {
        let mut data = vec![0x00, 0xF0];
        data.extend_from_slice(pattern);
        assert!(contains_reset_complete(&data));
    }

    // Failed reset status
    assert!(!contains_reset_complete(&[0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x01]));
    // Truncated
    assert!(!contains_reset_complete(&RESET_COMPLETE[..6]));
}

#[test]
fn test_hci_command_serialization() {
    assert_eq!(HciCommand::Reset.to_packet().unwrap(), vec![0x01, 0x03, 0x0C, 0x00]);
    assert_eq!(HciCommand::Reset.opcode(), 0x0C03);

    let command = HciCommand::SetEventFilter {
        filter: vec![0x01, 0x00],
    };
    assert_eq!(
        command.to_packet().unwrap(),
        vec![HCI_COMMAND_PKT, 0x05, 0x0C, 0x02, 0x01, 0x00]
    );

    let command = HciCommand::LeSetScanParameters {
        scan_type: 0x01,
        scan_interval: 0x0010,
        scan_window: 0x0010,
        own_address_type: 0x00,
        filter_policy: 0x00,
    };
    let packet = command.to_packet().unwrap();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x200B);
    assert_eq!(packet[3], 7);
    assert_eq!(&packet[4..], &[0x01, 0x10, 0x00, 0x10, 0x00, 0x00, 0x00]);

    let command = HciCommand::LeSetScanEnable {
        enable: true,
        filter_duplicates: false,
    };
    assert_eq!(command.to_packet().unwrap(), vec![0x01, 0x0C, 0x20, 0x02, 0x01, 0x00]);

    let command = HciCommand::SetEventMask {
        event_mask: 0x3DBF_F807_FFFB_FFFF,
    };
    let packet = command.to_packet().unwrap();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x0C01);
    assert_eq!(&packet[4..], &[0xFF, 0xFF, 0xFB, 0xFF, 0x07, 0xF8, 0xBF, 0x3D]);

    let command = HciCommand::LeSetEventMask { event_mask: 0x1F };
    assert_eq!(command.opcode(), 0x2001);

    let command = HciCommand::SetEventFilter {
        filter: vec![0; 256],
    };
    assert!(matches!(
        command.to_packet(),
        Err(HciError::InvalidParamLength(256))
    ));
}

#[test]
fn test_opcode_encoding() {
    assert_eq!(opcode(OGF_HOST_CTL, OCF_RESET), 0x0C03);
    assert_eq!(opcode(OGF_HOST_CTL, OCF_SET_EVENT_FILTER), 0x0C05);
    assert_eq!(opcode(OGF_LE, OCF_LE_SET_SCAN_ENABLE), 0x200C);
}
