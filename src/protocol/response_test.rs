use pretty_assertions::assert_eq;

use crate::constant::{
    Consistency, ErrorCode, FrameFlags, Opcode, ProtocolVersion, ResultMetadataFlags, WriteType,
};
use crate::protocol::primitive::*;
use crate::protocol::response::*;

fn decode(opcode: Opcode, body: &[u8]) -> Response {
    Response::decode(ProtocolVersion::V4, opcode, FrameFlags::empty(), body).unwrap()
}

#[test]
fn ready_and_authenticate() {
    let response = decode(Opcode::Ready, &[]);
    assert!(matches!(response.kind, ResponseKind::Ready));

    let mut body = Vec::new();
    write_string(&mut body, "org.apache.cassandra.auth.PasswordAuthenticator");
    let response = decode(Opcode::Authenticate, &body);
    let ResponseKind::Authenticate { class } = response.kind else {
        panic!("expected AUTHENTICATE");
    };
    assert!(class.ends_with("PasswordAuthenticator"));
}

#[test]
fn supported_multimap() {
    let mut body = Vec::new();
    write_u16(&mut body, 1);
    write_string(&mut body, "CQL_VERSION");
    write_string_list(&mut body, &["3.4.5"]);
    let response = decode(Opcode::Supported, &body);
    let ResponseKind::Supported { options } = response.kind else {
        panic!("expected SUPPORTED");
    };
    assert_eq!(options["CQL_VERSION"], vec!["3.4.5".to_string()]);
}

fn rows_body(flags: u32, columns: usize, rows: &[&[Option<&[u8]>]]) -> Vec<u8> {
    let mut body = Vec::new();
    write_i32(&mut body, 0x0002); // kind: rows
    write_i32(&mut body, flags as i32);
    write_i32(&mut body, columns as i32);
    if flags & 0x01 != 0 {
        write_string(&mut body, "ks");
        write_string(&mut body, "tbl");
        for i in 0..columns {
            write_string(&mut body, &format!("c{i}"));
            write_u16(&mut body, 0x000D); // varchar
        }
    }
    write_i32(&mut body, rows.len() as i32);
    for row in rows {
        for cell in *row {
            write_bytes(&mut body, *cell);
        }
    }
    body
}

#[test]
fn rows_with_global_spec() {
    let body = rows_body(0x01, 2, &[&[Some(&b"a"[..]), None]]);
    let response = decode(Opcode::Result, &body);
    let ResponseKind::Result(CqlResult::Rows(rows)) = response.kind else {
        panic!("expected RESULT(rows)");
    };
    assert_eq!(rows.metadata.columns_count, 2);
    assert_eq!(rows.metadata.columns.len(), 2);
    assert_eq!(rows.metadata.columns[0].keyspace, "ks");
    assert_eq!(rows.metadata.columns[1].name, "c1");
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(rows.rows[0][0].as_deref(), Some(&b"a"[..]));
    assert_eq!(rows.rows[0][1], None);
}

#[test]
fn rows_no_metadata_keeps_column_count() {
    let body = rows_body(0x04, 3, &[&[Some(&b"x"[..]), Some(&b"y"[..]), Some(&b"z"[..])]]);
    let response = decode(Opcode::Result, &body);
    let ResponseKind::Result(CqlResult::Rows(rows)) = response.kind else {
        panic!("expected RESULT(rows)");
    };
    assert!(rows.metadata.flags.contains(ResultMetadataFlags::NO_METADATA));
    assert_eq!(rows.metadata.columns_count, 3);
    assert!(rows.metadata.columns.is_empty());
    assert_eq!(rows.rows[0].len(), 3);
}

#[test]
fn rows_paging_state() {
    let mut body = Vec::new();
    write_i32(&mut body, 0x0002);
    write_i32(&mut body, 0x02 | 0x04); // HAS_MORE_PAGES | NO_METADATA
    write_i32(&mut body, 1);
    write_bytes(&mut body, Some(&[0xDE, 0xAD]));
    write_i32(&mut body, 0); // no rows
    let response = decode(Opcode::Result, &body);
    let ResponseKind::Result(CqlResult::Rows(rows)) = response.kind else {
        panic!("expected RESULT(rows)");
    };
    assert_eq!(rows.metadata.paging_state.as_deref(), Some(&[0xDE, 0xAD][..]));
}

#[test]
fn set_keyspace_and_schema_change() {
    let mut body = Vec::new();
    write_i32(&mut body, 0x0003);
    write_string(&mut body, "ks");
    let response = decode(Opcode::Result, &body);
    assert!(matches!(
        response.kind,
        ResponseKind::Result(CqlResult::SetKeyspace(ref ks)) if ks == "ks"
    ));

    let mut body = Vec::new();
    write_i32(&mut body, 0x0005);
    write_string(&mut body, "CREATED");
    write_string(&mut body, "TABLE");
    write_string(&mut body, "ks");
    write_string(&mut body, "tbl");
    let response = decode(Opcode::Result, &body);
    let ResponseKind::Result(CqlResult::SchemaChange(change)) = response.kind else {
        panic!("expected RESULT(schema_change)");
    };
    assert_eq!(change.change_type, "CREATED");
    assert_eq!(change.target, "TABLE");
    assert_eq!(change.name.as_deref(), Some("tbl"));
}

#[test]
fn prepared_v4_pk_indices() {
    let mut body = Vec::new();
    write_i32(&mut body, 0x0004);
    write_short_bytes(&mut body, &[0xAB]);
    // bind metadata: no global spec, 1 column, 1 pk index
    write_i32(&mut body, 0);
    write_i32(&mut body, 1);
    write_i32(&mut body, 1);
    write_u16(&mut body, 0);
    write_string(&mut body, "ks");
    write_string(&mut body, "tbl");
    write_string(&mut body, "id");
    write_u16(&mut body, 0x0009); // int
    // result metadata: empty
    write_i32(&mut body, 0);
    write_i32(&mut body, 0);
    let response = decode(Opcode::Result, &body);
    let ResponseKind::Result(CqlResult::Prepared(prepared)) = response.kind else {
        panic!("expected RESULT(prepared)");
    };
    assert_eq!(prepared.id, vec![0xAB]);
    assert_eq!(prepared.metadata.pk_indices, vec![0]);
    assert_eq!(prepared.metadata.columns.len(), 1);
    assert_eq!(prepared.metadata.columns[0].column_type, ColumnType::Int);
    assert!(prepared.result_metadata_id.is_none());
}

#[test]
fn nested_column_types_parse() {
    // map<text, list<int>>
    let mut data = Vec::new();
    write_u16(&mut data, 0x0021);
    write_u16(&mut data, 0x000D);
    write_u16(&mut data, 0x0020);
    write_u16(&mut data, 0x0009);
    let (parsed, rest) = read_column_type(&data).unwrap();
    assert!(rest.is_empty());
    assert_eq!(
        parsed,
        ColumnType::Map(
            Box::new(ColumnType::Varchar),
            Box::new(ColumnType::List(Box::new(ColumnType::Int)))
        )
    );
}

#[test]
fn error_unprepared() {
    let mut body = Vec::new();
    write_i32(&mut body, 0x2500);
    write_string(&mut body, "evicted");
    write_short_bytes(&mut body, &[0x01, 0x02]);
    let error = read_error(ProtocolVersion::V4, &body).unwrap();
    assert_eq!(error.code, ErrorCode::Unprepared);
    assert_eq!(
        error.details,
        ErrorDetails::Unprepared {
            id: vec![0x01, 0x02]
        }
    );
}

#[test]
fn error_unknown_code_still_decodes() {
    // A server newer than the driver must not kill the connection
    let mut body = Vec::new();
    write_i32(&mut body, 0x9999);
    write_string(&mut body, "mystery failure");
    let error = read_error(ProtocolVersion::V4, &body).unwrap();
    assert_eq!(error.code, ErrorCode::Other(0x9999));
    assert_eq!(error.message, "mystery failure");
    assert_eq!(error.details, ErrorDetails::None);
}

#[test]
fn error_read_timeout_data_present_is_boolean() {
    for (byte, expected) in [(0u8, false), (1, true), (2, true)] {
        let mut body = Vec::new();
        write_i32(&mut body, 0x1200);
        write_string(&mut body, "timeout");
        write_u16(&mut body, Consistency::Quorum as u16);
        write_i32(&mut body, 1);
        write_i32(&mut body, 2);
        write_u8(&mut body, byte);
        let error = read_error(ProtocolVersion::V4, &body).unwrap();
        let ErrorDetails::ReadTimeout {
            consistency,
            received,
            block_for,
            data_present,
        } = error.details
        else {
            panic!("expected read timeout details");
        };
        assert_eq!(consistency, Consistency::Quorum);
        assert_eq!((received, block_for), (1, 2));
        assert_eq!(data_present, expected);
    }
}

#[test]
fn error_write_timeout_write_type() {
    let mut body = Vec::new();
    write_i32(&mut body, 0x1100);
    write_string(&mut body, "timeout");
    write_u16(&mut body, Consistency::One as u16);
    write_i32(&mut body, 0);
    write_i32(&mut body, 1);
    write_string(&mut body, "UNLOGGED_BATCH");
    let error = read_error(ProtocolVersion::V4, &body).unwrap();
    assert!(matches!(
        error.details,
        ErrorDetails::WriteTimeout {
            write_type: WriteType::UnloggedBatch,
            ..
        }
    ));

    // Unknown write types degrade to Unknown instead of failing the decode
    let mut body = Vec::new();
    write_i32(&mut body, 0x1100);
    write_string(&mut body, "timeout");
    write_u16(&mut body, Consistency::One as u16);
    write_i32(&mut body, 0);
    write_i32(&mut body, 1);
    write_string(&mut body, "SOMETHING_NEW");
    let error = read_error(ProtocolVersion::V4, &body).unwrap();
    assert!(matches!(
        error.details,
        ErrorDetails::WriteTimeout {
            write_type: WriteType::Unknown,
            ..
        }
    ));
}

#[test]
fn error_write_failure_v5_reason_map() {
    let mut body = Vec::new();
    write_i32(&mut body, 0x1500);
    write_string(&mut body, "failed");
    write_u16(&mut body, Consistency::One as u16);
    write_i32(&mut body, 0);
    write_i32(&mut body, 1);
    write_i32(&mut body, 1); // one failure
    body.push(4);
    body.extend_from_slice(&[10, 0, 0, 9]);
    write_u16(&mut body, 0x0001);
    write_string(&mut body, "SIMPLE");
    let error = read_error(ProtocolVersion::V5, &body).unwrap();
    let ErrorDetails::WriteFailure {
        num_failures,
        reasons,
        write_type,
        ..
    } = error.details
    else {
        panic!("expected write failure details");
    };
    assert_eq!(num_failures, 1);
    assert_eq!(reasons.len(), 1);
    assert_eq!(reasons[0].endpoint.to_string(), "10.0.0.9");
    assert_eq!(reasons[0].code, 1);
    assert_eq!(write_type, WriteType::Simple);
}

#[test]
fn envelope_prefixes_in_order() {
    // tracing id, then warnings, then custom payload, then the body
    let mut body = Vec::new();
    body.extend_from_slice(&[0x11; 16]); // tracing uuid
    write_string_list(&mut body, &["slow query"]);
    write_u16(&mut body, 1);
    write_string(&mut body, "server_info");
    write_bytes(&mut body, Some(&[0x01]));
    write_i32(&mut body, 0x0001); // RESULT kind: void
    let response = Response::decode(
        ProtocolVersion::V4,
        Opcode::Result,
        FrameFlags::TRACING | FrameFlags::WARNING | FrameFlags::CUSTOM_PAYLOAD,
        &body,
    )
    .unwrap();
    assert!(response.tracing_id.is_some());
    assert_eq!(response.warnings, vec!["slow query".to_string()]);
    assert_eq!(response.custom_payload["server_info"], vec![0x01]);
    assert!(matches!(
        response.kind,
        ResponseKind::Result(CqlResult::Void)
    ));
}

#[test]
fn truncated_body_fails_without_panicking() {
    let mut body = Vec::new();
    write_i32(&mut body, 0x0002);
    write_i32(&mut body, 0x01);
    write_i32(&mut body, 5); // five columns promised, none delivered
    assert!(Response::decode(ProtocolVersion::V4, Opcode::Result, FrameFlags::empty(), &body).is_err());
}
