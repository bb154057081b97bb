use std::sync::Arc;

use crate::prepared::PreparedStatement;
use crate::protocol::response::{PreparedMetadata, PreparedResult, ResultMetadata};
use crate::statement::{Statement, Value};

fn prepared(pk_indices: Vec<u16>) -> Arc<PreparedStatement> {
    Arc::new(PreparedStatement::from_result(
        "SELECT * FROM t WHERE a = ? AND b = ?".to_string(),
        Some("ks".to_string()),
        PreparedResult {
            id: vec![0xAB],
            result_metadata_id: None,
            metadata: PreparedMetadata {
                pk_indices,
                columns: Vec::new(),
            },
            result_metadata: ResultMetadata::default(),
        },
    ))
}

#[test]
fn single_component_routing_key_is_the_raw_value() {
    let statement = prepared(vec![0]).bind(vec![
        Value::Bytes(vec![0x01, 0x02]),
        Value::Bytes(vec![0xFF]),
    ]);
    assert_eq!(statement.routing_key(), Some(vec![0x01, 0x02]));
}

#[test]
fn composite_routing_key_framing() {
    let statement = prepared(vec![0, 1]).bind(vec![
        Value::Bytes(vec![0x01]),
        Value::Bytes(vec![0x02, 0x03]),
    ]);
    // [u16 len][bytes][0x00] per component
    assert_eq!(
        statement.routing_key(),
        Some(vec![0, 1, 0x01, 0, 0, 2, 0x02, 0x03, 0])
    );
}

#[test]
fn null_partition_key_yields_no_routing_key() {
    let statement = prepared(vec![0]).bind(vec![Value::Null]);
    assert_eq!(statement.routing_key(), None);
    let statement = prepared(vec![0]).bind(Vec::new());
    assert_eq!(statement.routing_key(), None);
}

#[test]
fn explicit_routing_key_wins() {
    let mut statement = prepared(vec![0]).bind(vec![Value::Bytes(vec![0x01])]);
    statement.config.routing_key = Some(vec![0xEE]);
    assert_eq!(statement.routing_key(), Some(vec![0xEE]));
}

#[test]
fn keyspace_falls_back_to_prepared_keyspace() {
    let statement = prepared(vec![]).bind(Vec::new());
    assert_eq!(statement.keyspace(), Some("ks"));
    let mut statement = prepared(vec![]).bind(Vec::new());
    statement.config.keyspace = Some("override".to_string());
    assert_eq!(statement.keyspace(), Some("override"));
}

#[test]
fn statement_constructors() {
    let statement = Statement::new("SELECT 1");
    assert!(statement.values.is_empty());
    let statement = Statement::with_values("SELECT ?", vec![Value::Bytes(vec![1])]);
    assert_eq!(statement.values.len(), 1);
}
