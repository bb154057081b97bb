//! Response-side message decoding.
//!
//! Every response body is decoded eagerly off the reader task; row cells stay
//! raw bytes (value codecs are a separate capability).

use std::collections::HashMap;
use std::net::IpAddr;

use uuid::Uuid;

use crate::constant::{
    Consistency, ErrorCode, FrameFlags, Opcode, ProtocolVersion, ResultKind, ResultMetadataFlags,
    WriteType,
};
use crate::error::{Error, Result};
use crate::protocol::event::Event;
use crate::protocol::primitive::*;

/// A column type parsed from an `[option]`. Nested collection/UDT/tuple
/// structure is kept so the decoder can walk past specs of any shape;
/// interpreting cell bytes against it is codec territory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Bigint,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Timestamp,
    Uuid,
    Varchar,
    Varint,
    Timeuuid,
    Inet,
    Date,
    Time,
    Smallint,
    Tinyint,
    Duration,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    Udt {
        keyspace: String,
        name: String,
        fields: Vec<(String, ColumnType)>,
    },
    Tuple(Vec<ColumnType>),
}

pub fn read_column_type(data: &[u8]) -> Result<(ColumnType, &[u8])> {
    let (id, rest) = read_u16(data)?;
    Ok(match id {
        0x0000 => {
            let (class, rest) = read_string(rest)?;
            (ColumnType::Custom(class.to_string()), rest)
        }
        0x0001 => (ColumnType::Ascii, rest),
        0x0002 => (ColumnType::Bigint, rest),
        0x0003 => (ColumnType::Blob, rest),
        0x0004 => (ColumnType::Boolean, rest),
        0x0005 => (ColumnType::Counter, rest),
        0x0006 => (ColumnType::Decimal, rest),
        0x0007 => (ColumnType::Double, rest),
        0x0008 => (ColumnType::Float, rest),
        0x0009 => (ColumnType::Int, rest),
        0x000B => (ColumnType::Timestamp, rest),
        0x000C => (ColumnType::Uuid, rest),
        0x000D => (ColumnType::Varchar, rest),
        0x000E => (ColumnType::Varint, rest),
        0x000F => (ColumnType::Timeuuid, rest),
        0x0010 => (ColumnType::Inet, rest),
        0x0011 => (ColumnType::Date, rest),
        0x0012 => (ColumnType::Time, rest),
        0x0013 => (ColumnType::Smallint, rest),
        0x0014 => (ColumnType::Tinyint, rest),
        0x0015 => (ColumnType::Duration, rest),
        0x0020 => {
            let (element, rest) = read_column_type(rest)?;
            (ColumnType::List(Box::new(element)), rest)
        }
        0x0021 => {
            let (key, rest) = read_column_type(rest)?;
            let (value, rest) = read_column_type(rest)?;
            (ColumnType::Map(Box::new(key), Box::new(value)), rest)
        }
        0x0022 => {
            let (element, rest) = read_column_type(rest)?;
            (ColumnType::Set(Box::new(element)), rest)
        }
        0x0030 => {
            let (keyspace, rest) = read_string(rest)?;
            let (name, mut rest) = read_string(rest)?;
            let keyspace = keyspace.to_string();
            let name = name.to_string();
            let (count, r) = read_u16(rest)?;
            rest = r;
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (field_name, r) = read_string(rest)?;
                let (field_type, r) = read_column_type(r)?;
                fields.push((field_name.to_string(), field_type));
                rest = r;
            }
            (
                ColumnType::Udt {
                    keyspace,
                    name,
                    fields,
                },
                rest,
            )
        }
        0x0031 => {
            let (count, mut rest) = read_u16(rest)?;
            let mut types = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (t, r) = read_column_type(rest)?;
                types.push(t);
                rest = r;
            }
            (ColumnType::Tuple(types), rest)
        }
        _ => return Err(Error::InvalidFrame("unknown column type option")),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub keyspace: String,
    pub table: String,
    pub name: String,
    pub column_type: ColumnType,
}

/// Metadata block of a RESULT(rows) or the result half of RESULT(prepared).
#[derive(Debug, Clone, Default)]
pub struct ResultMetadata {
    pub flags: ResultMetadataFlags,
    pub columns_count: usize,
    pub paging_state: Option<Vec<u8>>,
    /// v5: present when the server signals METADATA_CHANGED.
    pub new_metadata_id: Option<Vec<u8>>,
    /// Empty when NO_METADATA was set.
    pub columns: Vec<ColumnSpec>,
}

pub fn read_result_metadata(version: ProtocolVersion, data: &[u8]) -> Result<(ResultMetadata, &[u8])> {
    let (flag_bits, rest) = read_i32(data)?;
    let flags = ResultMetadataFlags::from_bits_truncate(flag_bits as u32);
    let (columns_count, mut rest) = read_i32(rest)?;
    if columns_count < 0 {
        return Err(Error::InvalidFrame("negative column count"));
    }

    let mut paging_state = None;
    if flags.contains(ResultMetadataFlags::HAS_MORE_PAGES) {
        let (state, r) = read_bytes(rest)?;
        paging_state = state.map(<[u8]>::to_vec);
        rest = r;
    }

    let mut new_metadata_id = None;
    if version >= ProtocolVersion::V5 && flags.contains(ResultMetadataFlags::METADATA_CHANGED) {
        let (id, r) = read_short_bytes(rest)?;
        new_metadata_id = Some(id.to_vec());
        rest = r;
    }

    let mut columns = Vec::new();
    if !flags.contains(ResultMetadataFlags::NO_METADATA) {
        let mut global: Option<(String, String)> = None;
        if flags.contains(ResultMetadataFlags::GLOBAL_TABLES_SPEC) {
            let (keyspace, r) = read_string(rest)?;
            let (table, r) = read_string(r)?;
            global = Some((keyspace.to_string(), table.to_string()));
            rest = r;
        }
        columns.reserve(columns_count as usize);
        for _ in 0..columns_count {
            let (keyspace, table, r) = match &global {
                Some((keyspace, table)) => (keyspace.clone(), table.clone(), rest),
                None => {
                    let (keyspace, r) = read_string(rest)?;
                    let (table, r) = read_string(r)?;
                    (keyspace.to_string(), table.to_string(), r)
                }
            };
            let (name, r) = read_string(r)?;
            let (column_type, r) = read_column_type(r)?;
            columns.push(ColumnSpec {
                keyspace,
                table,
                name: name.to_string(),
                column_type,
            });
            rest = r;
        }
    }

    Ok((
        ResultMetadata {
            flags,
            columns_count: columns_count as usize,
            paging_state,
            new_metadata_id,
            columns,
        },
        rest,
    ))
}

/// Bind-marker metadata of a RESULT(prepared).
#[derive(Debug, Clone, Default)]
pub struct PreparedMetadata {
    pub pk_indices: Vec<u16>,
    pub columns: Vec<ColumnSpec>,
}

fn read_prepared_metadata(
    version: ProtocolVersion,
    data: &[u8],
) -> Result<(PreparedMetadata, &[u8])> {
    let (flag_bits, rest) = read_i32(data)?;
    let flags = ResultMetadataFlags::from_bits_truncate(flag_bits as u32);
    let (columns_count, mut rest) = read_i32(rest)?;
    if columns_count < 0 {
        return Err(Error::InvalidFrame("negative column count"));
    }

    let mut pk_indices = Vec::new();
    if version >= ProtocolVersion::V4 {
        let (pk_count, mut r) = read_i32(rest)?;
        pk_indices.reserve(pk_count.max(0) as usize);
        for _ in 0..pk_count {
            let (index, r2) = read_u16(r)?;
            pk_indices.push(index);
            r = r2;
        }
        rest = r;
    }

    let mut global: Option<(String, String)> = None;
    if flags.contains(ResultMetadataFlags::GLOBAL_TABLES_SPEC) {
        let (keyspace, r) = read_string(rest)?;
        let (table, r) = read_string(r)?;
        global = Some((keyspace.to_string(), table.to_string()));
        rest = r;
    }
    let mut columns = Vec::with_capacity(columns_count as usize);
    for _ in 0..columns_count {
        let (keyspace, table, r) = match &global {
            Some((keyspace, table)) => (keyspace.clone(), table.clone(), rest),
            None => {
                let (keyspace, r) = read_string(rest)?;
                let (table, r) = read_string(r)?;
                (keyspace.to_string(), table.to_string(), r)
            }
        };
        let (name, r) = read_string(r)?;
        let (column_type, r) = read_column_type(r)?;
        columns.push(ColumnSpec {
            keyspace,
            table,
            name: name.to_string(),
            column_type,
        });
        rest = r;
    }

    Ok((
        PreparedMetadata {
            pk_indices,
            columns,
        },
        rest,
    ))
}

/// Decoded RESULT(rows): raw cells, row-major.
#[derive(Debug, Clone, Default)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
}

fn read_rows(version: ProtocolVersion, data: &[u8]) -> Result<Rows> {
    let (metadata, rest) = read_result_metadata(version, data)?;
    let (rows_count, mut rest) = read_i32(rest)?;
    if rows_count < 0 {
        return Err(Error::InvalidFrame("negative row count"));
    }
    let mut rows = Vec::with_capacity(rows_count as usize);
    for _ in 0..rows_count {
        let mut row = Vec::with_capacity(metadata.columns_count);
        for _ in 0..metadata.columns_count {
            let (cell, r) = read_bytes(rest)?;
            row.push(cell.map(<[u8]>::to_vec));
            rest = r;
        }
        rows.push(row);
    }
    Ok(Rows { metadata, rows })
}

/// Decoded RESULT(prepared).
#[derive(Debug, Clone)]
pub struct PreparedResult {
    pub id: Vec<u8>,
    /// v5 only.
    pub result_metadata_id: Option<Vec<u8>>,
    pub metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

/// A schema change, shared by RESULT(schema_change) and the SCHEMA_CHANGE
/// event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub change_type: String,
    pub target: String,
    pub keyspace: String,
    pub name: Option<String>,
    pub arg_types: Vec<String>,
}

pub fn read_schema_change(data: &[u8]) -> Result<(SchemaChange, &[u8])> {
    let (change_type, rest) = read_string(data)?;
    let (target, rest) = read_string(rest)?;
    let change_type = change_type.to_string();
    let target = target.to_string();
    let (keyspace, mut rest) = read_string(rest)?;
    let keyspace = keyspace.to_string();
    let mut name = None;
    let mut arg_types = Vec::new();
    match target.as_str() {
        "KEYSPACE" => {}
        "TABLE" | "TYPE" => {
            let (n, r) = read_string(rest)?;
            name = Some(n.to_string());
            rest = r;
        }
        "FUNCTION" | "AGGREGATE" => {
            let (n, r) = read_string(rest)?;
            name = Some(n.to_string());
            let (types, r) = read_string_list(r)?;
            arg_types = types;
            rest = r;
        }
        _ => return Err(Error::InvalidFrame("unknown schema change target")),
    }
    Ok((
        SchemaChange {
            change_type,
            target,
            keyspace,
            name,
            arg_types,
        },
        rest,
    ))
}

#[derive(Debug, Clone)]
pub enum CqlResult {
    Void,
    Rows(Rows),
    SetKeyspace(String),
    Prepared(PreparedResult),
    SchemaChange(SchemaChange),
}

fn read_result(version: ProtocolVersion, data: &[u8]) -> Result<CqlResult> {
    let (kind, rest) = read_i32(data)?;
    Ok(match ResultKind::from_i32(kind)? {
        ResultKind::Void => CqlResult::Void,
        ResultKind::Rows => CqlResult::Rows(read_rows(version, rest)?),
        ResultKind::SetKeyspace => {
            let (keyspace, _) = read_string(rest)?;
            CqlResult::SetKeyspace(keyspace.to_string())
        }
        ResultKind::Prepared => {
            let (id, rest) = read_short_bytes(rest)?;
            let id = id.to_vec();
            let (result_metadata_id, rest) = if version >= ProtocolVersion::V5 {
                let (mid, rest) = read_short_bytes(rest)?;
                (Some(mid.to_vec()), rest)
            } else {
                (None, rest)
            };
            let (metadata, rest) = read_prepared_metadata(version, rest)?;
            let (result_metadata, _) = read_result_metadata(version, rest)?;
            CqlResult::Prepared(PreparedResult {
                id,
                result_metadata_id,
                metadata,
                result_metadata,
            })
        }
        ResultKind::SchemaChange => {
            let (change, _) = read_schema_change(rest)?;
            CqlResult::SchemaChange(change)
        }
    })
}

/// One endpoint's failure code from a v5 ReadFailure/WriteFailure reason map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReason {
    pub endpoint: IpAddr,
    pub code: u16,
}

/// Structured per-code payload of an ERROR response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDetails {
    None,
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        write_type: WriteType,
    },
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
    },
    ReadFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        num_failures: i32,
        reasons: Vec<FailureReason>,
        data_present: bool,
    },
    WriteFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        num_failures: i32,
        reasons: Vec<FailureReason>,
        write_type: WriteType,
    },
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },
    AlreadyExists {
        keyspace: String,
        table: String,
    },
    Unprepared {
        id: Vec<u8>,
    },
}

/// An ERROR response, mapped 1:1 from the wire.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub details: ErrorDetails,
}

fn read_failures(version: ProtocolVersion, data: &[u8]) -> Result<(i32, Vec<FailureReason>, &[u8])> {
    if version >= ProtocolVersion::V5 {
        let (count, mut rest) = read_i32(data)?;
        let mut reasons = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            let (endpoint, r) = read_inetaddr(rest)?;
            let (code, r) = read_u16(r)?;
            reasons.push(FailureReason { endpoint, code });
            rest = r;
        }
        Ok((count, reasons, rest))
    } else {
        let (count, rest) = read_i32(data)?;
        Ok((count, Vec::new(), rest))
    }
}

pub fn read_error(version: ProtocolVersion, data: &[u8]) -> Result<ErrorResponse> {
    let (code, rest) = read_i32(data)?;
    let code = ErrorCode::from_i32(code);
    let (message, rest) = read_string(rest)?;
    let message = message.to_string();

    let details = match code {
        ErrorCode::Unavailable => {
            let (consistency, rest) = read_consistency(rest)?;
            let (required, rest) = read_i32(rest)?;
            let (alive, _) = read_i32(rest)?;
            ErrorDetails::Unavailable {
                consistency,
                required,
                alive,
            }
        }
        ErrorCode::WriteTimeout => {
            let (consistency, rest) = read_consistency(rest)?;
            let (received, rest) = read_i32(rest)?;
            let (block_for, rest) = read_i32(rest)?;
            let (write_type, _) = read_string(rest)?;
            ErrorDetails::WriteTimeout {
                consistency,
                received,
                block_for,
                write_type: WriteType::parse(write_type),
            }
        }
        ErrorCode::ReadTimeout => {
            let (consistency, rest) = read_consistency(rest)?;
            let (received, rest) = read_i32(rest)?;
            let (block_for, rest) = read_i32(rest)?;
            let (data_present, _) = read_u8(rest)?;
            ErrorDetails::ReadTimeout {
                consistency,
                received,
                block_for,
                data_present: data_present != 0,
            }
        }
        ErrorCode::ReadFailure => {
            let (consistency, rest) = read_consistency(rest)?;
            let (received, rest) = read_i32(rest)?;
            let (block_for, rest) = read_i32(rest)?;
            let (num_failures, reasons, rest) = read_failures(version, rest)?;
            let (data_present, _) = read_u8(rest)?;
            ErrorDetails::ReadFailure {
                consistency,
                received,
                block_for,
                num_failures,
                reasons,
                data_present: data_present != 0,
            }
        }
        ErrorCode::WriteFailure => {
            let (consistency, rest) = read_consistency(rest)?;
            let (received, rest) = read_i32(rest)?;
            let (block_for, rest) = read_i32(rest)?;
            let (num_failures, reasons, rest) = read_failures(version, rest)?;
            let (write_type, _) = read_string(rest)?;
            ErrorDetails::WriteFailure {
                consistency,
                received,
                block_for,
                num_failures,
                reasons,
                write_type: WriteType::parse(write_type),
            }
        }
        ErrorCode::FunctionFailure => {
            let (keyspace, rest) = read_string(rest)?;
            let (function, r) = read_string(rest)?;
            let keyspace = keyspace.to_string();
            let (arg_types, _) = read_string_list(r)?;
            ErrorDetails::FunctionFailure {
                keyspace,
                function: function.to_string(),
                arg_types,
            }
        }
        ErrorCode::AlreadyExists => {
            let (keyspace, rest) = read_string(rest)?;
            let keyspace = keyspace.to_string();
            let (table, _) = read_string(rest)?;
            ErrorDetails::AlreadyExists {
                keyspace,
                table: table.to_string(),
            }
        }
        ErrorCode::Unprepared => {
            let (id, _) = read_short_bytes(rest)?;
            ErrorDetails::Unprepared { id: id.to_vec() }
        }
        _ => ErrorDetails::None,
    };

    Ok(ErrorResponse {
        code,
        message,
        details,
    })
}

#[derive(Debug, Clone)]
pub enum ResponseKind {
    Ready,
    Authenticate { class: String },
    Supported { options: HashMap<String, Vec<String>> },
    Result(CqlResult),
    Event(Event),
    Error(ErrorResponse),
    AuthChallenge { token: Option<Vec<u8>> },
    AuthSuccess { token: Option<Vec<u8>> },
}

/// A decoded response frame: envelope extras plus the opcode-specific body.
#[derive(Debug, Clone)]
pub struct Response {
    pub tracing_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub custom_payload: HashMap<String, Vec<u8>>,
    pub kind: ResponseKind,
}

impl Response {
    /// Decode a response body. The envelope prefixes appear in wire order:
    /// tracing id, warnings, custom payload.
    pub fn decode(
        version: ProtocolVersion,
        opcode: Opcode,
        flags: FrameFlags,
        body: &[u8],
    ) -> Result<Self> {
        let mut rest = body;

        let mut tracing_id = None;
        if flags.contains(FrameFlags::TRACING) {
            let (id, r) = read_uuid(rest)?;
            tracing_id = Some(id);
            rest = r;
        }
        let mut warnings = Vec::new();
        if flags.contains(FrameFlags::WARNING) {
            let (list, r) = read_string_list(rest)?;
            warnings = list;
            rest = r;
        }
        let mut custom_payload = HashMap::new();
        if flags.contains(FrameFlags::CUSTOM_PAYLOAD) {
            let (map, r) = read_bytes_map(rest)?;
            custom_payload = map;
            rest = r;
        }

        let kind = match opcode {
            Opcode::Ready => ResponseKind::Ready,
            Opcode::Authenticate => {
                let (class, _) = read_string(rest)?;
                ResponseKind::Authenticate {
                    class: class.to_string(),
                }
            }
            Opcode::Supported => {
                let (options, _) = read_string_multimap(rest)?;
                ResponseKind::Supported { options }
            }
            Opcode::Result => ResponseKind::Result(read_result(version, rest)?),
            Opcode::Event => ResponseKind::Event(Event::decode(rest)?),
            Opcode::Error => ResponseKind::Error(read_error(version, rest)?),
            Opcode::AuthChallenge => {
                let (token, _) = read_bytes(rest)?;
                ResponseKind::AuthChallenge {
                    token: token.map(<[u8]>::to_vec),
                }
            }
            Opcode::AuthSuccess => {
                let (token, _) = read_bytes(rest)?;
                ResponseKind::AuthSuccess {
                    token: token.map(<[u8]>::to_vec),
                }
            }
            _ => return Err(Error::UnexpectedResponse("request opcode in response")),
        };

        Ok(Self {
            tracing_id,
            warnings,
            custom_payload,
            kind,
        })
    }
}
