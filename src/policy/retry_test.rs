use crate::constant::{Consistency, ErrorCode, WriteType};
use crate::policy::retry::{
    DefaultRetryPolicy, DowngradingConsistencyRetryPolicy, FallthroughRetryPolicy,
    LoggingRetryPolicy, RetryDecision, RetryInfo, RetryPolicy,
};
use crate::protocol::response::{ErrorDetails, ErrorResponse};

fn info(retry_count: u32, is_idempotent: bool) -> RetryInfo {
    RetryInfo {
        consistency: Consistency::Quorum,
        retry_count,
        is_idempotent,
    }
}

fn overloaded() -> ErrorResponse {
    ErrorResponse {
        code: ErrorCode::Overloaded,
        message: "coordinator overloaded".to_string(),
        details: ErrorDetails::None,
    }
}

#[test]
fn default_read_timeout_retries_once_on_next_host() {
    let policy = DefaultRetryPolicy;
    assert_eq!(
        policy.on_read_timeout(&info(0, false), 1, 2, false),
        RetryDecision::RetryNextHost(None)
    );
    assert_eq!(
        policy.on_read_timeout(&info(1, false), 1, 2, false),
        RetryDecision::ReturnError
    );
}

#[test]
fn default_unavailable_retries_once() {
    let policy = DefaultRetryPolicy;
    assert_eq!(
        policy.on_unavailable(&info(0, false), 3, 1),
        RetryDecision::RetryNextHost(None)
    );
    assert_eq!(
        policy.on_unavailable(&info(1, false), 3, 1),
        RetryDecision::ReturnError
    );
}

#[test]
fn default_write_timeout_needs_idempotence_and_retriable_type() {
    let policy = DefaultRetryPolicy;
    assert_eq!(
        policy.on_write_timeout(&info(0, true), 1, 2, WriteType::Simple),
        RetryDecision::RetryNextHost(None)
    );
    assert_eq!(
        policy.on_write_timeout(&info(0, true), 1, 2, WriteType::BatchLog),
        RetryDecision::RetryNextHost(None)
    );
    // not idempotent
    assert_eq!(
        policy.on_write_timeout(&info(0, false), 1, 2, WriteType::Simple),
        RetryDecision::ReturnError
    );
    // counters are never safe to replay
    assert_eq!(
        policy.on_write_timeout(&info(0, true), 1, 2, WriteType::Counter),
        RetryDecision::ReturnError
    );
    assert_eq!(
        policy.on_write_timeout(&info(0, true), 1, 2, WriteType::Cas),
        RetryDecision::ReturnError
    );
}

#[test]
fn default_request_error_retries_idempotent_only() {
    let policy = DefaultRetryPolicy;
    assert_eq!(
        policy.on_request_error(&info(0, true), &overloaded()),
        RetryDecision::RetryNextHost(None)
    );
    assert_eq!(
        policy.on_request_error(&info(0, false), &overloaded()),
        RetryDecision::ReturnError
    );
}

#[test]
fn fallthrough_never_retries() {
    let policy = FallthroughRetryPolicy;
    assert_eq!(
        policy.on_read_timeout(&info(0, true), 0, 2, false),
        RetryDecision::ReturnError
    );
    assert_eq!(
        policy.on_write_timeout(&info(0, true), 0, 2, WriteType::Simple),
        RetryDecision::ReturnError
    );
    assert_eq!(
        policy.on_unavailable(&info(0, true), 3, 3),
        RetryDecision::ReturnError
    );
}

#[test]
fn downgrading_unavailable_lowers_consistency() {
    let policy = DowngradingConsistencyRetryPolicy;
    assert_eq!(
        policy.on_unavailable(&info(0, false), 3, 2),
        RetryDecision::RetrySameHost(Some(Consistency::Two))
    );
    assert_eq!(
        policy.on_unavailable(&info(0, false), 3, 5),
        RetryDecision::RetrySameHost(Some(Consistency::Three))
    );
    assert_eq!(
        policy.on_unavailable(&info(0, false), 3, 0),
        RetryDecision::ReturnError
    );
    assert_eq!(
        policy.on_unavailable(&info(1, false), 3, 2),
        RetryDecision::ReturnError
    );
}

#[test]
fn downgrading_read_timeout() {
    let policy = DowngradingConsistencyRetryPolicy;
    // fewer acks than required: downgrade to what responded
    assert_eq!(
        policy.on_read_timeout(&info(0, false), 1, 2, false),
        RetryDecision::RetrySameHost(Some(Consistency::One))
    );
    // enough acks but no data: plain retry
    assert_eq!(
        policy.on_read_timeout(&info(0, false), 2, 2, false),
        RetryDecision::RetrySameHost(None)
    );
    // data came back; retrying will not help
    assert_eq!(
        policy.on_read_timeout(&info(0, false), 2, 2, true),
        RetryDecision::ReturnError
    );
}

#[test]
fn downgrading_write_timeout() {
    let policy = DowngradingConsistencyRetryPolicy;
    // partially-applied simple write: report success
    assert_eq!(
        policy.on_write_timeout(&info(0, false), 1, 2, WriteType::Simple),
        RetryDecision::Ignore
    );
    assert_eq!(
        policy.on_write_timeout(&info(0, false), 0, 2, WriteType::Simple),
        RetryDecision::ReturnError
    );
    assert_eq!(
        policy.on_write_timeout(&info(0, false), 1, 2, WriteType::UnloggedBatch),
        RetryDecision::RetrySameHost(Some(Consistency::One))
    );
    assert_eq!(
        policy.on_write_timeout(&info(0, false), 1, 2, WriteType::BatchLog),
        RetryDecision::RetrySameHost(None)
    );
}

#[test]
fn logging_wrapper_is_transparent() {
    let policy = LoggingRetryPolicy::new(DefaultRetryPolicy);
    assert_eq!(
        policy.on_read_timeout(&info(0, false), 1, 2, false),
        DefaultRetryPolicy.on_read_timeout(&info(0, false), 1, 2, false)
    );
    assert_eq!(
        policy.on_unavailable(&info(1, false), 3, 1),
        DefaultRetryPolicy.on_unavailable(&info(1, false), 3, 1)
    );
    assert_eq!(
        policy.on_request_error(&info(0, true), &overloaded()),
        DefaultRetryPolicy.on_request_error(&info(0, true), &overloaded())
    );
}
