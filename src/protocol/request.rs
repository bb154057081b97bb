//! Request-side message encoding.
//!
//! A [`Request`] is a tagged sum over every client-to-server message. The
//! encoder writes a complete frame (header included) into a reusable buffer;
//! the caller owns stream-id choice and the TRACING/CUSTOM_PAYLOAD flag bits.

use std::collections::HashMap;

use crate::constant::{
    BatchFlags, BatchType, Consistency, FrameFlags, Opcode, ProtocolVersion, QueryFlags,
    STARTUP_CQL_VERSION, STARTUP_CQL_VERSION_KEY,
};
use crate::error::{Error, Result};
use crate::protocol::frame::{patch_header, reserve_header};
use crate::protocol::primitive::*;
use crate::statement::Value;

/// Per-execution query parameters, shared by QUERY and EXECUTE.
///
/// This is the immutable snapshot the request handler builds once per
/// execution; retries may override the consistency without touching the
/// original statement.
#[derive(Debug, Clone, Default)]
pub struct QueryParameters {
    pub consistency: Option<Consistency>,
    pub serial_consistency: Option<Consistency>,
    pub timestamp: Option<i64>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Vec<u8>>,
    pub skip_metadata: bool,
    /// Per-query keyspace, only encodable on v5.
    pub keyspace: Option<String>,
    pub values: Vec<Value>,
    /// Names for the values (simple statements only); must be empty or match
    /// `values` in length.
    pub names: Vec<String>,
}

/// One statement inside a BATCH.
#[derive(Debug, Clone)]
pub enum BatchEntry {
    Query { query: String, values: Vec<Value> },
    Prepared { id: Vec<u8>, values: Vec<Value> },
}

#[derive(Debug)]
pub enum Request<'a> {
    Options,
    Startup,
    AuthResponse {
        token: Option<&'a [u8]>,
    },
    Register {
        events: &'a [&'a str],
    },
    Query {
        query: &'a str,
        params: &'a QueryParameters,
    },
    Prepare {
        query: &'a str,
        /// v5 per-prepare keyspace; ignored on v3/v4.
        keyspace: Option<&'a str>,
    },
    Execute {
        id: &'a [u8],
        /// Required on v5, absent before.
        result_metadata_id: Option<&'a [u8]>,
        params: &'a QueryParameters,
    },
    Batch {
        batch_type: BatchType,
        entries: &'a [BatchEntry],
        consistency: Consistency,
        serial_consistency: Option<Consistency>,
        timestamp: Option<i64>,
        keyspace: Option<&'a str>,
    },
}

impl Request<'_> {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Options => Opcode::Options,
            Self::Startup => Opcode::Startup,
            Self::AuthResponse { .. } => Opcode::AuthResponse,
            Self::Register { .. } => Opcode::Register,
            Self::Query { .. } => Opcode::Query,
            Self::Prepare { .. } => Opcode::Prepare,
            Self::Execute { .. } => Opcode::Execute,
            Self::Batch { .. } => Opcode::Batch,
        }
    }

    /// Encode a complete frame into `out` (cleared first).
    pub fn encode(
        &self,
        version: ProtocolVersion,
        stream: i16,
        mut flags: FrameFlags,
        custom_payload: Option<&HashMap<String, Vec<u8>>>,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        out.clear();
        reserve_header(out);

        if let Some(payload) = custom_payload {
            if version >= ProtocolVersion::V4 && !payload.is_empty() {
                flags |= FrameFlags::CUSTOM_PAYLOAD;
                write_bytes_map(
                    out,
                    payload.iter().map(|(k, v)| (k.as_str(), v.as_slice())),
                );
            }
        }

        match self {
            Self::Options => {}
            Self::Startup => {
                write_string_map(out, &[(STARTUP_CQL_VERSION_KEY, STARTUP_CQL_VERSION)]);
            }
            Self::AuthResponse { token } => {
                write_bytes(out, *token);
            }
            Self::Register { events } => {
                write_string_list(out, events);
            }
            Self::Query { query, params } => {
                write_long_string(out, query);
                encode_query_parameters(version, params, out)?;
            }
            Self::Prepare { query, keyspace } => {
                write_long_string(out, query);
                if version >= ProtocolVersion::V5 {
                    match keyspace {
                        Some(ks) => {
                            write_i32(out, 0x01);
                            write_string(out, ks);
                        }
                        None => write_i32(out, 0x00),
                    }
                }
            }
            Self::Execute {
                id,
                result_metadata_id,
                params,
            } => {
                write_short_bytes(out, id);
                if version >= ProtocolVersion::V5 {
                    let metadata_id = result_metadata_id
                        .ok_or(Error::MessageEncode("v5 EXECUTE requires a metadata id"))?;
                    write_short_bytes(out, metadata_id);
                }
                encode_query_parameters(version, params, out)?;
            }
            Self::Batch {
                batch_type,
                entries,
                consistency,
                serial_consistency,
                timestamp,
                keyspace,
            } => {
                write_u8(out, *batch_type as u8);
                write_u16(out, entries.len() as u16);
                for entry in *entries {
                    match entry {
                        BatchEntry::Query { query, values } => {
                            write_u8(out, 0);
                            write_long_string(out, query);
                            encode_values(version, values, out)?;
                        }
                        BatchEntry::Prepared { id, values } => {
                            write_u8(out, 1);
                            write_short_bytes(out, id);
                            encode_values(version, values, out)?;
                        }
                    }
                }
                write_u16(out, *consistency as u16);

                let mut batch_flags = BatchFlags::empty();
                if serial_consistency.is_some() {
                    batch_flags |= BatchFlags::WITH_SERIAL_CONSISTENCY;
                }
                if timestamp.is_some() {
                    batch_flags |= BatchFlags::WITH_DEFAULT_TIMESTAMP;
                }
                let keyspace = (*keyspace).filter(|_| version >= ProtocolVersion::V5);
                if keyspace.is_some() {
                    batch_flags |= BatchFlags::WITH_KEYSPACE;
                }
                if version.uses_int_query_flags() {
                    write_i32(out, batch_flags.bits() as i32);
                } else {
                    write_u8(out, batch_flags.bits() as u8);
                }
                if let Some(cl) = serial_consistency {
                    write_u16(out, *cl as u16);
                }
                if let Some(ts) = timestamp {
                    write_i64(out, *ts);
                }
                if let Some(ks) = keyspace {
                    write_string(out, ks);
                }
            }
        }

        patch_header(out, version, flags, stream, self.opcode());
        Ok(())
    }
}

fn encode_query_parameters(
    version: ProtocolVersion,
    params: &QueryParameters,
    out: &mut Vec<u8>,
) -> Result<()> {
    let consistency = params.consistency.unwrap_or(Consistency::LocalOne);
    write_u16(out, consistency as u16);

    let mut flags = QueryFlags::empty();
    if !params.values.is_empty() {
        flags |= QueryFlags::VALUES;
    }
    if !params.names.is_empty() {
        if params.names.len() != params.values.len() {
            return Err(Error::BadParams("value-name count mismatch"));
        }
        flags |= QueryFlags::WITH_NAMES;
    }
    if params.skip_metadata {
        flags |= QueryFlags::SKIP_METADATA;
    }
    if params.page_size.is_some() {
        flags |= QueryFlags::PAGE_SIZE;
    }
    if params.paging_state.is_some() {
        flags |= QueryFlags::WITH_PAGING_STATE;
    }
    if params.serial_consistency.is_some() {
        flags |= QueryFlags::WITH_SERIAL_CONSISTENCY;
    }
    if params.timestamp.is_some() {
        flags |= QueryFlags::WITH_DEFAULT_TIMESTAMP;
    }
    let keyspace = params
        .keyspace
        .as_deref()
        .filter(|_| version >= ProtocolVersion::V5);
    if keyspace.is_some() {
        flags |= QueryFlags::WITH_KEYSPACE;
    }

    if version.uses_int_query_flags() {
        write_i32(out, flags.bits() as i32);
    } else {
        write_u8(out, flags.bits() as u8);
    }

    if flags.contains(QueryFlags::VALUES) {
        if flags.contains(QueryFlags::WITH_NAMES) {
            write_u16(out, params.values.len() as u16);
            for (name, value) in params.names.iter().zip(&params.values) {
                write_string(out, name);
                encode_value(version, value, 0, out)?;
            }
        } else {
            encode_values(version, &params.values, out)?;
        }
    }
    if let Some(page_size) = params.page_size {
        write_i32(out, page_size);
    }
    if let Some(state) = &params.paging_state {
        write_bytes(out, Some(state));
    }
    if let Some(cl) = params.serial_consistency {
        write_u16(out, cl as u16);
    }
    if let Some(ts) = params.timestamp {
        write_i64(out, ts);
    }
    if let Some(ks) = keyspace {
        write_string(out, ks);
    }
    Ok(())
}

fn encode_values(version: ProtocolVersion, values: &[Value], out: &mut Vec<u8>) -> Result<()> {
    write_u16(out, values.len() as u16);
    for (index, value) in values.iter().enumerate() {
        encode_value(version, value, index, out)?;
    }
    Ok(())
}

fn encode_value(
    version: ProtocolVersion,
    value: &Value,
    index: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    match value {
        Value::Bytes(bytes) => write_bytes(out, Some(bytes)),
        Value::Null => write_bytes(out, None),
        Value::Unset => {
            // The "not set" marker only exists since v4.
            if version < ProtocolVersion::V4 {
                return Err(Error::ParameterUnset(index));
            }
            write_bytes_unset(out);
        }
    }
    Ok(())
}
