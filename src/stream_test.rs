use crate::error::Error;
use crate::stream::StreamIds;

#[test]
fn acquire_returns_lowest_free_id() {
    let mut ids = StreamIds::new(128);
    assert_eq!(ids.acquire().unwrap(), 0);
    assert_eq!(ids.acquire().unwrap(), 1);
    assert_eq!(ids.acquire().unwrap(), 2);
    ids.release(1);
    assert_eq!(ids.acquire().unwrap(), 1);
    assert_eq!(ids.acquire().unwrap(), 3);
}

#[test]
fn exhaustion_yields_no_streams() {
    let mut ids = StreamIds::new(4);
    for expected in 0..4 {
        assert_eq!(ids.acquire().unwrap(), expected);
    }
    assert!(matches!(ids.acquire(), Err(Error::NoStreams)));
    ids.release(2);
    assert_eq!(ids.acquire().unwrap(), 2);
}

#[test]
fn release_is_idempotent() {
    let mut ids = StreamIds::new(8);
    let id = ids.acquire().unwrap();
    assert_eq!(ids.allocated(), 1);
    ids.release(id);
    ids.release(id);
    ids.release(7);
    assert_eq!(ids.allocated(), 0);
    assert_eq!(ids.available(), 8);
}

#[test]
fn allocated_plus_available_is_invariant() {
    let mut ids = StreamIds::new(100);
    let mut held = Vec::new();
    for _ in 0..60 {
        held.push(ids.acquire().unwrap());
    }
    for id in held.iter().step_by(2) {
        ids.release(*id);
    }
    assert_eq!(ids.allocated() + ids.available(), 100);
}

#[test]
fn spans_word_boundaries() {
    let mut ids = StreamIds::new(130);
    for expected in 0..130 {
        assert_eq!(ids.acquire().unwrap(), expected);
    }
    assert!(ids.acquire().is_err());
    ids.release(64);
    ids.release(129);
    assert_eq!(ids.acquire().unwrap(), 64);
    assert_eq!(ids.acquire().unwrap(), 129);
}
