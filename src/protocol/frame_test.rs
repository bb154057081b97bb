use pretty_assertions::assert_eq;
use zerocopy::IntoBytes;

use crate::constant::{FrameFlags, Opcode, ProtocolVersion};
use crate::protocol::frame::{FRAME_HEADER_SIZE, FrameHeader, ResponseFrame};

#[test]
fn request_header_layout() {
    let header = FrameHeader::request(
        ProtocolVersion::V4,
        FrameFlags::empty(),
        1,
        Opcode::Query,
        100,
    );
    assert_eq!(
        header.as_bytes(),
        &[0x04, 0x00, 0x00, 0x01, 0x07, 0x00, 0x00, 0x00, 0x64]
    );
}

#[test]
fn response_header_parses() {
    let bytes = [0x84, 0x02, 0x00, 0x2A, 0x08, 0x00, 0x00, 0x00, 0x10];
    let header = FrameHeader::from_bytes(&bytes).unwrap();
    let (stream, opcode, flags, length) =
        ResponseFrame::parse_header(header, ProtocolVersion::V4).unwrap();
    assert_eq!(stream, 42);
    assert_eq!(opcode, Opcode::Result);
    assert_eq!(flags, FrameFlags::TRACING);
    assert_eq!(length, 16);
}

#[test]
fn negative_stream_parses() {
    // Stream -1 carries server-pushed EVENT frames
    let bytes = [0x84, 0x00, 0xFF, 0xFF, 0x0C, 0x00, 0x00, 0x00, 0x00];
    let header = FrameHeader::from_bytes(&bytes).unwrap();
    let (stream, opcode, _, _) =
        ResponseFrame::parse_header(header, ProtocolVersion::V4).unwrap();
    assert_eq!(stream, -1);
    assert_eq!(opcode, Opcode::Event);
}

#[test]
fn request_direction_rejected() {
    let bytes = [0x04, 0x00, 0x00, 0x01, 0x08, 0x00, 0x00, 0x00, 0x00];
    let header = FrameHeader::from_bytes(&bytes).unwrap();
    assert!(ResponseFrame::parse_header(header, ProtocolVersion::V4).is_err());
}

#[test]
fn version_mismatch_rejected() {
    let bytes = [0x83, 0x00, 0x00, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00];
    let header = FrameHeader::from_bytes(&bytes).unwrap();
    assert!(ResponseFrame::parse_header(header, ProtocolVersion::V4).is_err());
}

#[test]
fn oversized_body_rejected() {
    let mut bytes = [0x84, 0x00, 0x00, 0x01, 0x08, 0, 0, 0, 0];
    bytes[5..9].copy_from_slice(&(512 * 1024 * 1024i32).to_be_bytes());
    let header = FrameHeader::from_bytes(&bytes).unwrap();
    assert!(ResponseFrame::parse_header(header, ProtocolVersion::V4).is_err());
}

#[test]
fn short_header_rejected() {
    assert!(FrameHeader::from_bytes(&[0x84, 0x00]).is_err());
    assert_eq!(FRAME_HEADER_SIZE, 9);
}
