use crate::timestamp::{
    MonotonicTimestampGenerator, ServerSideTimestampGenerator, TimestampGenerator,
};

#[test]
fn monotonic_timestamps_strictly_increase() {
    let generator = MonotonicTimestampGenerator::default();
    let mut last = generator.next_timestamp().unwrap();
    for _ in 0..10_000 {
        let next = generator.next_timestamp().unwrap();
        assert!(next > last);
        last = next;
    }
}

#[test]
fn server_side_assigns_nothing() {
    let generator = ServerSideTimestampGenerator;
    assert_eq!(generator.next_timestamp(), None);
}
