use std::io::Cursor;

use engagement_monitor::framing::{FrameReader, HEADER_LEN, SYNC_BYTES};
use engagement_monitor::{read_next_frame, write_frame, EngagementError, MAX_FRAME_BYTES};

fn framed(payloads: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for payload in payloads {
        write_frame(&mut out, payload).expect("write frame");
    }
    out
}

#[test]
fn header_layout_is_sync_then_little_endian_length() {
    let bytes = framed(&[b"abc"]);
    assert_eq!(bytes.len(), HEADER_LEN + 3);
    assert_eq!(&bytes[..2], &SYNC_BYTES);
    assert_eq!(&bytes[2..6], &[3, 0, 0, 0]);
    assert_eq!(&bytes[6..], b"abc");
}

#[test]
fn consecutive_frames_come_back_in_order() {
    let first = vec![0x11u8; 1024];
    let second = vec![0x22u8; 7];
    let mut stream = Cursor::new(framed(&[&first, &second, b""]));

    assert_eq!(read_next_frame(&mut stream).unwrap(), first);
    assert_eq!(read_next_frame(&mut stream).unwrap(), second);
    assert!(read_next_frame(&mut stream).unwrap().is_empty());
    assert!(matches!(
        read_next_frame(&mut stream),
        Err(EngagementError::StreamClosed)
    ));
}

#[test]
fn leading_garbage_and_false_sync_bytes_are_skipped() {
    let mut bytes = vec![0x00, 0xAA, 0x00, 0xAA, 0xAA, 0x13];
    bytes.extend(framed(&[b"payload"]));
    let mut reader = FrameReader::new(Cursor::new(bytes));

    assert_eq!(reader.read_next_frame().unwrap(), b"payload");
    let stats = reader.stats();
    assert_eq!(stats.frames_read, 1);
    assert_eq!(stats.bytes_discarded, 6);
}

#[test]
fn oversized_declaration_is_rejected_without_allocating() {
    let mut bytes = SYNC_BYTES.to_vec();
    bytes.extend((MAX_FRAME_BYTES + 1).to_le_bytes());
    bytes.extend(framed(&[b"next"]));
    let mut reader = FrameReader::new(Cursor::new(bytes));

    match reader.read_next_frame() {
        Err(EngagementError::FrameTooLarge(len)) => assert_eq!(len, MAX_FRAME_BYTES + 1),
        other => panic!("expected FrameTooLarge, got {other:?}"),
    }
    assert_eq!(reader.read_next_frame().unwrap(), b"next");
    assert_eq!(reader.stats().oversized_frames, 1);
}

#[test]
fn truncated_body_is_a_short_read() {
    let mut bytes = SYNC_BYTES.to_vec();
    bytes.extend(10u32.to_le_bytes());
    bytes.extend([1, 2, 3, 4]);
    let mut stream = Cursor::new(bytes);

    match read_next_frame(&mut stream) {
        Err(EngagementError::ShortRead { expected, received }) => {
            assert_eq!(expected, 10);
            assert_eq!(received, 4);
        }
        other => panic!("expected ShortRead, got {other:?}"),
    }
}

#[test]
fn truncated_length_field_is_a_short_read() {
    let mut stream = Cursor::new(vec![0xAA, 0x55, 0x01, 0x00]);
    assert!(matches!(
        read_next_frame(&mut stream),
        Err(EngagementError::ShortRead {
            expected: 4,
            received: 2
        })
    ));
}

#[test]
fn frames_iterator_reports_damage_and_keeps_going() {
    let mut bytes = framed(&[b"one"]);
    bytes.extend(SYNC_BYTES);
    bytes.extend(u32::MAX.to_le_bytes());
    bytes.extend(framed(&[b"two"]));
    let mut reader = FrameReader::new(Cursor::new(bytes));

    let items: Vec<_> = reader.frames().collect();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].as_ref().unwrap(), b"one");
    assert!(items[1]
        .as_ref()
        .err()
        .map(EngagementError::is_recoverable_framing)
        .unwrap_or(false));
    assert_eq!(items[2].as_ref().unwrap(), b"two");
    assert!(reader.is_exhausted());
}

#[test]
fn write_frame_refuses_payloads_over_the_limit() {
    let payload = vec![0u8; MAX_FRAME_BYTES as usize + 1];
    let mut out = Vec::new();
    assert!(matches!(
        write_frame(&mut out, &payload),
        Err(EngagementError::FrameTooLarge(_))
    ));
    assert!(out.is_empty());
}
