use std::io::Cursor;

use super::message::{
    expected_message_length,
    Message,
    MessageFlags,
    MAX_MESSAGE_SIZE,
    MESSAGE_OVERHEAD,
};
use crate::{
    bson::doc,
    error::{ErrorCategory, ErrorKind},
};

#[test]
fn encoded_length_is_overhead_plus_body() {
    let document = doc! { "isMaster": 1, "$db": "admin" };
    let mut body = Vec::new();
    document.to_writer(&mut body).unwrap();

    let mut frame = Vec::new();
    Message::new(document, 42).write_to(&mut frame).unwrap();

    assert_eq!(frame.len(), MESSAGE_OVERHEAD + body.len());
    let encoded_length = i32::from_le_bytes(frame[0..4].try_into().unwrap());
    assert_eq!(encoded_length as usize, frame.len());

    // requestId, responseTo, opCode
    assert_eq!(i32::from_le_bytes(frame[4..8].try_into().unwrap()), 42);
    assert_eq!(i32::from_le_bytes(frame[8..12].try_into().unwrap()), 0);
    assert_eq!(i32::from_le_bytes(frame[12..16].try_into().unwrap()), 2013);
    // flagBits and payloadType
    assert_eq!(u32::from_le_bytes(frame[16..20].try_into().unwrap()), 0);
    assert_eq!(frame[20], 0);
}

#[test]
fn round_trip() {
    let document = doc! { "find": "movies", "filter": { "name": "Armageddon" }, "$db": "testing" };
    let mut frame = Vec::new();
    Message::new(document.clone(), 7).write_to(&mut frame).unwrap();

    let decoded = Message::read_from(&mut Cursor::new(frame)).unwrap();
    assert_eq!(decoded.document, document);
    assert_eq!(decoded.request_id, 7);
    assert_eq!(decoded.response_to, 0);
    assert_eq!(decoded.flags, MessageFlags::empty());
}

#[test]
fn command_verb_stays_first_on_the_wire() {
    let document = doc! { "insert": "movies", "documents": [], "$db": "testing" };
    let mut frame = Vec::new();
    Message::new(document, 1).write_to(&mut frame).unwrap();

    let decoded = Message::read_from(&mut Cursor::new(frame)).unwrap();
    let first_key = decoded.document.iter().next().map(|(key, _)| key.as_str());
    assert_eq!(first_key, Some("insert"));
}

fn frame_with_length(length: i32) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&1i32.to_le_bytes());
    frame.extend_from_slice(&0i32.to_le_bytes());
    frame.extend_from_slice(&2013i32.to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes());
    frame.push(0);
    frame
}

#[test]
fn minimum_length_message_decodes_as_empty_document() {
    let frame = frame_with_length(MESSAGE_OVERHEAD as i32);
    let decoded = Message::read_from(&mut Cursor::new(frame)).unwrap();
    assert!(decoded.document.is_empty());
}

#[test]
fn undersized_length_is_a_framing_error() {
    let frame = frame_with_length(MESSAGE_OVERHEAD as i32 - 1);
    let err = Message::read_from(&mut Cursor::new(frame)).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Framing);
}

#[test]
fn oversized_length_is_a_framing_error() {
    let frame = frame_with_length(MAX_MESSAGE_SIZE as i32 + 1);
    let err = Message::read_from(&mut Cursor::new(frame)).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Framing);
}

#[test]
fn unknown_opcode_is_a_framing_error() {
    let mut frame = frame_with_length(MESSAGE_OVERHEAD as i32);
    frame[12..16].copy_from_slice(&2004i32.to_le_bytes());
    let err = Message::read_from(&mut Cursor::new(frame)).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Framing);
}

#[test]
fn nonzero_payload_type_is_a_framing_error() {
    let mut frame = frame_with_length(MESSAGE_OVERHEAD as i32);
    frame[20] = 1;
    let err = Message::read_from(&mut Cursor::new(frame)).unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::Framing { .. }));
}

#[test]
fn length_prefix_peeking() {
    assert!(expected_message_length(&[0x15, 0x00]).unwrap().is_none());

    let frame = frame_with_length(MESSAGE_OVERHEAD as i32);
    assert_eq!(
        expected_message_length(&frame).unwrap(),
        Some(MESSAGE_OVERHEAD)
    );

    let bad = (MAX_MESSAGE_SIZE as i32 + 1).to_le_bytes();
    assert!(expected_message_length(&bad).is_err());

    let negative = (-1i32).to_le_bytes();
    assert!(expected_message_length(&negative).is_err());
}
