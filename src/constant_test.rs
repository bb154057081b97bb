use crate::constant::{
    BatchFlags, Consistency, ErrorCode, FrameFlags, Opcode, ProtocolVersion, QueryFlags,
    ResultKind, WriteType,
};

#[test]
fn opcode_bytes_roundtrip() {
    for opcode in [
        Opcode::Error,
        Opcode::Startup,
        Opcode::Ready,
        Opcode::Authenticate,
        Opcode::Options,
        Opcode::Supported,
        Opcode::Query,
        Opcode::Result,
        Opcode::Prepare,
        Opcode::Execute,
        Opcode::Register,
        Opcode::Event,
        Opcode::Batch,
        Opcode::AuthChallenge,
        Opcode::AuthResponse,
        Opcode::AuthSuccess,
    ] {
        assert_eq!(Opcode::from_byte(opcode as u8).unwrap(), opcode);
    }
    // 0x04 (CREDENTIALS) died with protocol v2
    assert!(Opcode::from_byte(0x04).is_err());
    assert!(Opcode::from_byte(0x42).is_err());
}

#[test]
fn protocol_version_bytes_and_negotiation_order() {
    assert_eq!(ProtocolVersion::V4.request_byte(), 0x04);
    assert_eq!(ProtocolVersion::V4.response_byte(), 0x84);
    assert_eq!(ProtocolVersion::from_response_byte(0x85).unwrap(), ProtocolVersion::V5);
    assert!(ProtocolVersion::from_response_byte(0x82).is_err());

    assert_eq!(ProtocolVersion::V5.lower(), Some(ProtocolVersion::V4));
    assert_eq!(ProtocolVersion::V4.lower(), Some(ProtocolVersion::V3));
    assert_eq!(ProtocolVersion::V3.lower(), None);
    assert!(ProtocolVersion::V5.uses_int_query_flags());
    assert!(!ProtocolVersion::V4.uses_int_query_flags());
}

#[test]
fn consistency_wire_values() {
    assert_eq!(Consistency::Any as u16, 0x0000);
    assert_eq!(Consistency::Quorum as u16, 0x0004);
    assert_eq!(Consistency::LocalOne as u16, 0x000A);
    assert_eq!(Consistency::from_u16(0x0006).unwrap(), Consistency::LocalQuorum);
    assert!(Consistency::from_u16(0x000B).is_err());
}

#[test]
fn local_consistencies_are_dc_local() {
    for cl in [
        Consistency::LocalOne,
        Consistency::LocalQuorum,
        Consistency::LocalSerial,
    ] {
        assert!(cl.is_dc_local());
    }
    for cl in [
        Consistency::One,
        Consistency::Quorum,
        Consistency::All,
        Consistency::EachQuorum,
        Consistency::Serial,
    ] {
        assert!(!cl.is_dc_local());
    }
}

#[test]
fn flag_bits_match_the_wire_spec() {
    assert_eq!(FrameFlags::COMPRESSION.bits(), 0x01);
    assert_eq!(FrameFlags::TRACING.bits(), 0x02);
    assert_eq!(FrameFlags::CUSTOM_PAYLOAD.bits(), 0x04);
    assert_eq!(FrameFlags::WARNING.bits(), 0x08);
    assert_eq!(FrameFlags::BETA.bits(), 0x10);

    assert_eq!(QueryFlags::VALUES.bits(), 0x01);
    assert_eq!(QueryFlags::SKIP_METADATA.bits(), 0x02);
    assert_eq!(QueryFlags::PAGE_SIZE.bits(), 0x04);
    assert_eq!(QueryFlags::WITH_PAGING_STATE.bits(), 0x08);
    assert_eq!(QueryFlags::WITH_SERIAL_CONSISTENCY.bits(), 0x10);
    assert_eq!(QueryFlags::WITH_DEFAULT_TIMESTAMP.bits(), 0x20);
    assert_eq!(QueryFlags::WITH_NAMES.bits(), 0x40);
    assert_eq!(QueryFlags::WITH_KEYSPACE.bits(), 0x80);

    // Batch flags reuse the query-flag bit positions
    assert_eq!(
        BatchFlags::WITH_SERIAL_CONSISTENCY.bits(),
        QueryFlags::WITH_SERIAL_CONSISTENCY.bits()
    );
    assert_eq!(
        BatchFlags::WITH_DEFAULT_TIMESTAMP.bits(),
        QueryFlags::WITH_DEFAULT_TIMESTAMP.bits()
    );
}

#[test]
fn result_kinds() {
    assert_eq!(ResultKind::from_i32(0x0001).unwrap(), ResultKind::Void);
    assert_eq!(ResultKind::from_i32(0x0002).unwrap(), ResultKind::Rows);
    assert_eq!(ResultKind::from_i32(0x0003).unwrap(), ResultKind::SetKeyspace);
    assert_eq!(ResultKind::from_i32(0x0004).unwrap(), ResultKind::Prepared);
    assert_eq!(ResultKind::from_i32(0x0005).unwrap(), ResultKind::SchemaChange);
    assert!(ResultKind::from_i32(0x0006).is_err());
}

#[test]
fn error_codes_map_one_to_one() {
    assert_eq!(ErrorCode::from_i32(0x0000), ErrorCode::ServerError);
    assert_eq!(ErrorCode::from_i32(0x1001), ErrorCode::Overloaded);
    assert_eq!(ErrorCode::from_i32(0x1100), ErrorCode::WriteTimeout);
    assert_eq!(ErrorCode::from_i32(0x2500), ErrorCode::Unprepared);
    // Codes from servers newer than this driver are preserved, not rejected
    assert_eq!(ErrorCode::from_i32(0x9999), ErrorCode::Other(0x9999));
}

#[test]
fn write_type_parsing_and_retriability() {
    assert_eq!(WriteType::parse("SIMPLE"), WriteType::Simple);
    assert_eq!(WriteType::parse("BATCH_LOG"), WriteType::BatchLog);
    assert_eq!(WriteType::parse("CDC"), WriteType::Cdc);
    assert_eq!(WriteType::parse("BRAND_NEW_TYPE"), WriteType::Unknown);

    assert!(WriteType::Simple.is_retriable());
    assert!(WriteType::Batch.is_retriable());
    assert!(WriteType::BatchLog.is_retriable());
    assert!(WriteType::UnloggedBatch.is_retriable());
    assert!(!WriteType::Counter.is_retriable());
    assert!(!WriteType::Cas.is_retriable());
    assert!(!WriteType::Unknown.is_retriable());
}
