//! User-facing statement types.
//!
//! Values are pre-encoded cell bytes; turning typed values into bytes is the
//! job of a codec layer above this crate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::constant::{BatchType, Consistency};
use crate::policy::retry::RetryPolicy;
use crate::prepared::PreparedStatement;

/// One bound value. `Unset` (v4+) leaves the column untouched server-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Null,
    Unset,
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<Option<Vec<u8>>> for Value {
    fn from(bytes: Option<Vec<u8>>) -> Self {
        match bytes {
            Some(bytes) => Self::Bytes(bytes),
            None => Self::Null,
        }
    }
}

/// Per-statement execution options. Unset fields fall back to the session
/// defaults at execution time.
#[derive(Clone, Default)]
pub struct StatementConfig {
    pub consistency: Option<Consistency>,
    pub serial_consistency: Option<Consistency>,
    pub request_timeout: Option<Duration>,
    pub is_idempotent: bool,
    pub tracing: bool,
    pub page_size: Option<i32>,
    pub paging_state: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    /// Routing keyspace; overrides the session keyspace for this statement.
    pub keyspace: Option<String>,
    /// Routing key for token-aware policies; overrides any computed key.
    pub routing_key: Option<Vec<u8>>,
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub custom_payload: Option<HashMap<String, Vec<u8>>>,
    pub record_attempted_addresses: bool,
}

/// A simple (unprepared) CQL statement.
#[derive(Clone, Default)]
pub struct Statement {
    pub query: String,
    pub values: Vec<Value>,
    /// Optional names for `values`; empty means positional.
    pub names: Vec<String>,
    pub config: StatementConfig,
}

impl Statement {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_values(query: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            query: query.into(),
            values,
            ..Default::default()
        }
    }
}

/// An execution of a prepared statement.
#[derive(Clone)]
pub struct BoundStatement {
    pub prepared: Arc<PreparedStatement>,
    pub values: Vec<Value>,
    pub config: StatementConfig,
}

impl BoundStatement {
    /// Routing key: explicit override first, else built from the prepared
    /// partition-key indices. Composite keys use the standard
    /// `[u16 len][bytes][0x00]` component framing.
    pub fn routing_key(&self) -> Option<Vec<u8>> {
        if let Some(key) = &self.config.routing_key {
            return Some(key.clone());
        }
        let indices = &self.prepared.metadata.pk_indices;
        if indices.is_empty() {
            return None;
        }
        if indices.len() == 1 {
            match self.values.get(indices[0] as usize)? {
                Value::Bytes(bytes) => return Some(bytes.clone()),
                _ => return None,
            }
        }
        let mut key = Vec::new();
        for &index in indices {
            match self.values.get(index as usize)? {
                Value::Bytes(bytes) => {
                    key.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                    key.extend_from_slice(bytes);
                    key.push(0);
                }
                _ => return None,
            }
        }
        Some(key)
    }

    /// Routing keyspace: statement override, then the keyspace the statement
    /// was prepared against.
    pub fn keyspace(&self) -> Option<&str> {
        self.config
            .keyspace
            .as_deref()
            .or(self.prepared.keyspace.as_deref())
    }
}

/// One statement inside a batch.
#[derive(Clone)]
pub enum BatchStatement {
    Simple { query: String, values: Vec<Value> },
    Prepared {
        statement: Arc<PreparedStatement>,
        values: Vec<Value>,
    },
}

/// A batch of statements executed atomically (per the chosen batch type).
#[derive(Clone)]
pub struct Batch {
    pub batch_type: BatchType,
    pub statements: Vec<BatchStatement>,
    pub config: StatementConfig,
}

impl Batch {
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            statements: Vec::new(),
            config: StatementConfig::default(),
        }
    }

    pub fn push(&mut self, statement: BatchStatement) {
        self.statements.push(statement);
    }
}
