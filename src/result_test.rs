use crate::constant::ResultMetadataFlags;
use crate::error::Error;
use crate::protocol::response::{ResultMetadata, Rows};
use crate::result::QueryResult;

fn rows_result(paging_state: Option<Vec<u8>>) -> QueryResult {
    let mut flags = ResultMetadataFlags::empty();
    if paging_state.is_some() {
        flags |= ResultMetadataFlags::HAS_MORE_PAGES;
    }
    QueryResult {
        rows: Some(Rows {
            metadata: ResultMetadata {
                flags,
                columns_count: 1,
                paging_state,
                new_metadata_id: None,
                columns: Vec::new(),
            },
            rows: vec![vec![Some(vec![0x01])]],
        }),
        ..QueryResult::default()
    }
}

#[test]
fn paging_state_absent_is_an_error() {
    let result = rows_result(None);
    assert!(!result.has_more_pages());
    assert!(matches!(result.paging_state(), Err(Error::NoPagingState)));
}

#[test]
fn paging_state_present() {
    let result = rows_result(Some(vec![0xAA, 0xBB]));
    assert!(result.has_more_pages());
    assert_eq!(result.paging_state().unwrap(), &[0xAA, 0xBB]);
}

#[test]
fn non_rows_results_are_empty() {
    let result = QueryResult::default();
    assert_eq!(result.row_count(), 0);
    assert!(result.rows().is_empty());
    assert!(result.columns().is_empty());
    assert!(matches!(result.paging_state(), Err(Error::NoPagingState)));
}

#[test]
fn row_accessors() {
    let result = rows_result(None);
    assert_eq!(result.row_count(), 1);
    assert_eq!(result.rows()[0][0].as_deref(), Some(&[0x01][..]));
}
