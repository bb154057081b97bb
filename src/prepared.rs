use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::protocol::response::{PreparedMetadata, PreparedResult, ResultMetadata};
use crate::statement::{BoundStatement, StatementConfig, Value};

/// A statement the server has pre-parsed, keyed by its opaque id.
///
/// The bind-marker metadata is immutable; the result metadata can be swapped
/// when a v5 server signals METADATA_CHANGED.
pub struct PreparedStatement {
    pub id: Vec<u8>,
    pub query: String,
    /// Keyspace the statement was prepared against, used for routing.
    pub keyspace: Option<String>,
    pub metadata: PreparedMetadata,
    result_metadata: RwLock<Arc<ResultMetadataEntry>>,
}

pub struct ResultMetadataEntry {
    /// v5 result-metadata id, echoed in EXECUTE.
    pub id: Option<Vec<u8>>,
    pub metadata: ResultMetadata,
}

impl PreparedStatement {
    pub(crate) fn from_result(query: String, keyspace: Option<String>, result: PreparedResult) -> Self {
        Self {
            id: result.id,
            query,
            keyspace,
            metadata: result.metadata,
            result_metadata: RwLock::new(Arc::new(ResultMetadataEntry {
                id: result.result_metadata_id,
                metadata: result.result_metadata,
            })),
        }
    }

    pub fn result_metadata(&self) -> Arc<ResultMetadataEntry> {
        Arc::clone(&self.result_metadata.read())
    }

    pub(crate) fn update_result_metadata(&self, id: Option<Vec<u8>>, metadata: ResultMetadata) {
        *self.result_metadata.write() = Arc::new(ResultMetadataEntry { id, metadata });
    }

    pub fn bind(self: &Arc<Self>, values: Vec<Value>) -> BoundStatement {
        BoundStatement {
            prepared: Arc::clone(self),
            values,
            config: StatementConfig::default(),
        }
    }
}

/// Session-wide prepared-statement cache. Entries are held indefinitely;
/// server-side eviction is recovered by re-prepare-on-UNPREPARED.
#[derive(Default)]
pub(crate) struct PreparedCache {
    by_id: HashMap<Vec<u8>, Arc<PreparedStatement>>,
    by_query: HashMap<String, Arc<PreparedStatement>>,
}

impl PreparedCache {
    pub fn insert(&mut self, statement: Arc<PreparedStatement>) {
        self.by_id
            .insert(statement.id.clone(), Arc::clone(&statement));
        self.by_query
            .insert(statement.query.clone(), statement);
    }

    pub fn get_by_query(&self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.by_query.get(query).cloned()
    }

    pub fn all(&self) -> Vec<Arc<PreparedStatement>> {
        self.by_id.values().cloned().collect()
    }
}
