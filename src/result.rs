use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::prepared::PreparedStatement;
use crate::protocol::response::{ColumnSpec, Rows, SchemaChange};

/// Tracing data pulled from `system_traces.sessions` after the server tagged
/// a response with a tracing id.
#[derive(Debug, Clone, Default)]
pub struct TracingInfo {
    pub request: Option<String>,
    pub coordinator: Option<IpAddr>,
    pub duration_micros: Option<i32>,
}

/// Outcome of `execute`/`batch`/`prepare`: rows (possibly empty), column
/// metadata, paging state, warnings, tracing.
#[derive(Default)]
pub struct QueryResult {
    pub(crate) rows: Option<Rows>,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) tracing_info: Option<TracingInfo>,
    pub(crate) warnings: Vec<String>,
    pub(crate) custom_payload: HashMap<String, Vec<u8>>,
    pub(crate) set_keyspace: Option<String>,
    pub(crate) schema_change: Option<SchemaChange>,
    pub(crate) prepared: Option<Arc<PreparedStatement>>,
    /// Hosts tried for this request, when recording was asked for.
    pub(crate) attempted_addresses: Vec<String>,
}

impl QueryResult {
    /// Raw row cells, row-major. Empty for non-ROWS results.
    pub fn rows(&self) -> &[Vec<Option<Vec<u8>>>] {
        self.rows.as_ref().map(|r| r.rows.as_slice()).unwrap_or(&[])
    }

    pub fn row_count(&self) -> usize {
        self.rows.as_ref().map(|r| r.rows.len()).unwrap_or(0)
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        self.rows
            .as_ref()
            .map(|r| r.metadata.columns.as_slice())
            .unwrap_or(&[])
    }

    /// Continuation token for the next page. `NO_PAGING_STATE` when the
    /// server did not flag more pages.
    pub fn paging_state(&self) -> Result<&[u8]> {
        self.rows
            .as_ref()
            .and_then(|r| r.metadata.paging_state.as_deref())
            .ok_or(Error::NoPagingState)
    }

    pub fn has_more_pages(&self) -> bool {
        self.rows
            .as_ref()
            .is_some_and(|r| r.metadata.paging_state.is_some())
    }

    pub fn tracing_id(&self) -> Option<Uuid> {
        self.tracing_id
    }

    pub fn tracing_info(&self) -> Option<&TracingInfo> {
        self.tracing_info.as_ref()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn custom_payload(&self) -> &HashMap<String, Vec<u8>> {
        &self.custom_payload
    }

    /// Keyspace set by a `USE` statement result.
    pub fn keyspace(&self) -> Option<&str> {
        self.set_keyspace.as_deref()
    }

    pub fn schema_change(&self) -> Option<&SchemaChange> {
        self.schema_change.as_ref()
    }

    pub(crate) fn prepared_statement(&self) -> Option<Arc<PreparedStatement>> {
        self.prepared.clone()
    }

    pub fn attempted_addresses(&self) -> &[String] {
        &self.attempted_addresses
    }
}
