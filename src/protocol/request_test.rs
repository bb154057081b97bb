use pretty_assertions::assert_eq;

use crate::constant::{BatchType, Consistency, FrameFlags, ProtocolVersion};
use crate::error::Error;
use crate::protocol::frame::FRAME_HEADER_SIZE;
use crate::protocol::request::{BatchEntry, QueryParameters, Request};
use crate::statement::Value;

fn encode(request: &Request<'_>, version: ProtocolVersion) -> Vec<u8> {
    let mut out = Vec::new();
    request
        .encode(version, 7, FrameFlags::empty(), None, &mut out)
        .unwrap();
    out
}

fn body(frame: &[u8]) -> &[u8] {
    &frame[FRAME_HEADER_SIZE..]
}

#[test]
fn options_is_empty_bodied() {
    let frame = encode(&Request::Options, ProtocolVersion::V4);
    assert_eq!(frame.len(), FRAME_HEADER_SIZE);
    assert_eq!(frame[4], 0x05);
    assert_eq!(&frame[2..4], &[0x00, 0x07]); // stream id
}

#[test]
fn startup_carries_cql_version() {
    let frame = encode(&Request::Startup, ProtocolVersion::V4);
    assert_eq!(frame[4], 0x01);
    let mut expected = vec![0x00, 0x01];
    expected.extend_from_slice(&[0x00, 11]);
    expected.extend_from_slice(b"CQL_VERSION");
    expected.extend_from_slice(&[0x00, 5]);
    expected.extend_from_slice(b"3.0.0");
    assert_eq!(body(&frame), expected.as_slice());
}

#[test]
fn header_length_matches_body() {
    let params = QueryParameters::default();
    let frame = encode(
        &Request::Query {
            query: "SELECT * FROM system.local",
            params: &params,
        },
        ProtocolVersion::V4,
    );
    let declared = i32::from_be_bytes(frame[5..9].try_into().unwrap()) as usize;
    assert_eq!(declared, frame.len() - FRAME_HEADER_SIZE);
}

#[test]
fn query_v4_flags_are_one_byte() {
    let params = QueryParameters {
        consistency: Some(Consistency::Quorum),
        ..QueryParameters::default()
    };
    let frame = encode(
        &Request::Query {
            query: "Q",
            params: &params,
        },
        ProtocolVersion::V4,
    );
    let body = body(&frame);
    // long string "Q" + consistency + one flag byte
    assert_eq!(body, &[0, 0, 0, 1, b'Q', 0x00, 0x04, 0x00]);
}

#[test]
fn query_v5_flags_are_four_bytes() {
    let params = QueryParameters {
        consistency: Some(Consistency::One),
        page_size: Some(64),
        ..QueryParameters::default()
    };
    let frame = encode(
        &Request::Query {
            query: "Q",
            params: &params,
        },
        ProtocolVersion::V5,
    );
    let body = body(&frame);
    // long string + consistency + int flags (PAGE_SIZE) + page size
    assert_eq!(
        body,
        &[0, 0, 0, 1, b'Q', 0x00, 0x01, 0, 0, 0, 0x04, 0, 0, 0, 64]
    );
}

#[test]
fn query_values_and_null() {
    let params = QueryParameters {
        consistency: Some(Consistency::One),
        values: vec![Value::Bytes(vec![0xAA]), Value::Null],
        ..QueryParameters::default()
    };
    let frame = encode(
        &Request::Query {
            query: "Q",
            params: &params,
        },
        ProtocolVersion::V4,
    );
    let body = body(&frame);
    let expected: Vec<u8> = vec![
        0, 0, 0, 1, b'Q', // query
        0x00, 0x01, // consistency ONE
        0x01, // flags: VALUES
        0x00, 0x02, // two values
        0, 0, 0, 1, 0xAA, // first value
        0xFF, 0xFF, 0xFF, 0xFF, // null
    ];
    assert_eq!(body, expected.as_slice());
}

#[test]
fn unset_value_requires_v4() {
    let params = QueryParameters {
        values: vec![Value::Unset],
        ..QueryParameters::default()
    };
    let request = Request::Query {
        query: "Q",
        params: &params,
    };
    let mut out = Vec::new();
    let result = request.encode(ProtocolVersion::V3, 0, FrameFlags::empty(), None, &mut out);
    assert!(matches!(result, Err(Error::ParameterUnset(0))));
    assert!(
        request
            .encode(ProtocolVersion::V4, 0, FrameFlags::empty(), None, &mut out)
            .is_ok()
    );
}

#[test]
fn execute_v5_requires_metadata_id() {
    let params = QueryParameters::default();
    let request = Request::Execute {
        id: &[1, 2],
        result_metadata_id: None,
        params: &params,
    };
    let mut out = Vec::new();
    assert!(
        request
            .encode(ProtocolVersion::V5, 0, FrameFlags::empty(), None, &mut out)
            .is_err()
    );
    assert!(
        request
            .encode(ProtocolVersion::V4, 0, FrameFlags::empty(), None, &mut out)
            .is_ok()
    );
}

#[test]
fn execute_v4_body() {
    let params = QueryParameters {
        consistency: Some(Consistency::One),
        skip_metadata: true,
        ..QueryParameters::default()
    };
    let frame = encode(
        &Request::Execute {
            id: &[0xCA, 0xFE],
            result_metadata_id: None,
            params: &params,
        },
        ProtocolVersion::V4,
    );
    let body = body(&frame);
    assert_eq!(body, &[0x00, 0x02, 0xCA, 0xFE, 0x00, 0x01, 0x02]);
}

#[test]
fn prepare_v5_keyspace_flag() {
    let frame = encode(
        &Request::Prepare {
            query: "Q",
            keyspace: Some("ks"),
        },
        ProtocolVersion::V5,
    );
    let body_bytes = body(&frame);
    assert_eq!(
        body_bytes,
        &[0, 0, 0, 1, b'Q', 0, 0, 0, 0x01, 0, 2, b'k', b's']
    );

    // v4 ignores the keyspace entirely
    let frame = encode(
        &Request::Prepare {
            query: "Q",
            keyspace: Some("ks"),
        },
        ProtocolVersion::V4,
    );
    assert_eq!(body(&frame), &[0, 0, 0, 1, b'Q']);
}

#[test]
fn register_lists_event_types() {
    let frame = encode(
        &Request::Register {
            events: &["TOPOLOGY_CHANGE", "STATUS_CHANGE"],
        },
        ProtocolVersion::V4,
    );
    assert_eq!(frame[4], 0x0B);
    let body = body(&frame);
    assert_eq!(&body[..2], &[0x00, 0x02]);
}

#[test]
fn batch_layout() {
    let entries = vec![
        BatchEntry::Query {
            query: "Q".to_string(),
            values: vec![],
        },
        BatchEntry::Prepared {
            id: vec![0x01],
            values: vec![Value::Bytes(vec![0xBB])],
        },
    ];
    let frame = encode(
        &Request::Batch {
            batch_type: BatchType::Unlogged,
            entries: &entries,
            consistency: Consistency::Quorum,
            serial_consistency: None,
            timestamp: Some(42),
            keyspace: None,
        },
        ProtocolVersion::V4,
    );
    assert_eq!(frame[4], 0x0D);
    let body = body(&frame);
    let expected: Vec<u8> = vec![
        0x01, // unlogged
        0x00, 0x02, // two statements
        0x00, 0, 0, 0, 1, b'Q', 0x00, 0x00, // query entry, zero values
        0x01, 0x00, 0x01, 0x01, // prepared entry id
        0x00, 0x01, 0, 0, 0, 1, 0xBB, // one value
        0x00, 0x04, // consistency QUORUM
        0x20, // flags: default timestamp
        0, 0, 0, 0, 0, 0, 0, 42, // timestamp
    ];
    assert_eq!(body, expected.as_slice());
}

#[test]
fn auth_response_token() {
    let frame = encode(
        &Request::AuthResponse {
            token: Some(&[0x00, b'u', 0x00, b'p']),
        },
        ProtocolVersion::V4,
    );
    assert_eq!(frame[4], 0x0F);
    assert_eq!(body(&frame), &[0, 0, 0, 4, 0x00, b'u', 0x00, b'p']);
}

#[test]
fn custom_payload_sets_flag() {
    let mut payload = std::collections::HashMap::new();
    payload.insert("k".to_string(), vec![1u8]);
    let params = QueryParameters::default();
    let request = Request::Query {
        query: "Q",
        params: &params,
    };
    let mut out = Vec::new();
    request
        .encode(
            ProtocolVersion::V4,
            0,
            FrameFlags::empty(),
            Some(&payload),
            &mut out,
        )
        .unwrap();
    assert_eq!(out[1] & 0x04, 0x04);

    // v3 has no custom payloads; the flag must stay clear
    out.clear();
    request
        .encode(
            ProtocolVersion::V3,
            0,
            FrameFlags::empty(),
            Some(&payload),
            &mut out,
        )
        .unwrap();
    assert_eq!(out[1] & 0x04, 0x00);
}
