//! The per-request state machine.
//!
//! One handler per application request. Executions walk the shared query
//! plan; speculative executions race on idempotent requests and the first
//! completion wins. Retry decisions, UNPREPARED recovery, keyspace and
//! schema-agreement gating all live here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cluster::control::{SystemRow, query_rows};
use crate::cluster::host::Host;
use crate::connection::Connection;
use crate::constant::{BatchType, Consistency, ErrorCode, ProtocolVersion, ResultMetadataFlags};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::policy::load_balancing::{QueryPlan, RoutingInfo};
use crate::policy::retry::{RetryDecision, RetryInfo, RetryPolicy};
use crate::policy::speculative::SpeculativePlan;
use crate::prepared::PreparedStatement;
use crate::protocol::request::{BatchEntry, QueryParameters, Request};
use crate::protocol::response::{CqlResult, ErrorDetails, ErrorResponse, Response, ResponseKind};
use crate::result::{QueryResult, TracingInfo};
use crate::session::SessionInner;
use crate::statement::Value;

const TRACING_POLL: Duration = Duration::from_millis(100);

/// What one request does on the wire.
pub(crate) enum RequestKind {
    Query {
        query: String,
        values: Vec<Value>,
        names: Vec<String>,
    },
    Execute {
        prepared: Arc<PreparedStatement>,
        values: Vec<Value>,
    },
    Batch {
        batch_type: BatchType,
        entries: Vec<BatchEntry>,
        /// Prepared statements inside the batch, for UNPREPARED recovery.
        prepared: Vec<Arc<PreparedStatement>>,
    },
    Prepare {
        query: String,
    },
}

/// Immutable-per-request snapshot of everything an execution needs; built by
/// the session from statement + session defaults.
pub(crate) struct RequestSpec {
    pub kind: RequestKind,
    pub consistency: Consistency,
    pub serial_consistency: Option<Consistency>,
    pub timestamp: Option<i64>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Vec<u8>>,
    /// Routing + USE keyspace (statement override, else session keyspace).
    pub keyspace: Option<String>,
    pub routing_key: Option<Vec<u8>>,
    pub is_idempotent: bool,
    pub tracing: bool,
    pub custom_payload: Option<std::collections::HashMap<String, Vec<u8>>>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub request_timeout: Duration,
    pub record_attempted_addresses: bool,
}

struct HandlerShared {
    session: Arc<SessionInner>,
    spec: RequestSpec,
    plan: Mutex<QueryPlan>,
    speculative_plan: Mutex<Box<dyn SpeculativePlan>>,
    done: AtomicBool,
    result_tx: Mutex<Option<oneshot::Sender<Result<QueryResult>>>>,
    running: AtomicUsize,
    retry_count: AtomicU32,
    attempted: Mutex<Vec<String>>,
    started: Instant,
}

/// Mutable per-execution state: retries may lower the consistency, and at
/// most one re-prepare is tolerated per host before escalating.
struct AttemptState {
    consistency: Consistency,
    repreparations: u32,
}

enum Outcome {
    /// The future was completed (either way).
    Done,
    /// Retry on the same connection (re-prepare, same-host retry).
    RetrySameConnection,
    /// Move to the next host in the plan.
    NextHost,
    /// Stop this execution without completing (done elsewhere / timed out).
    Stop,
}

/// Run one request to completion.
pub(crate) async fn execute(session: Arc<SessionInner>, spec: RequestSpec) -> Result<QueryResult> {
    Metrics::bump(&session.metrics.requests);

    let snapshot = session.cluster.snapshot();
    let token = spec
        .routing_key
        .as_deref()
        .map(|key| snapshot.token_map.partitioner().hash(key));
    let routing = RoutingInfo {
        keyspace: spec.keyspace.as_deref(),
        token,
        consistency: spec.consistency,
    };
    let plan = session.lb_policy.query_plan(&routing, &snapshot);

    let (result_tx, result_rx) = oneshot::channel();
    let request_timeout = spec.request_timeout;
    let shared = Arc::new(HandlerShared {
        speculative_plan: Mutex::new(session.opts.speculative_execution_policy.new_plan()),
        session,
        spec,
        plan: Mutex::new(plan),
        done: AtomicBool::new(false),
        result_tx: Mutex::new(Some(result_tx)),
        running: AtomicUsize::new(1),
        retry_count: AtomicU32::new(0),
        attempted: Mutex::new(Vec::new()),
        started: Instant::now(),
    });

    tokio::spawn(run_execution(Arc::clone(&shared)));

    match tokio::time::timeout(request_timeout, result_rx).await {
        Ok(Ok(result)) => result,
        // Every execution ended without completing the future.
        Ok(Err(_)) => Err(Error::NoHostsAvailable {
            attempted: shared.attempted.lock().clone(),
        }),
        Err(_) => {
            shared.done.store(true, Ordering::Release);
            Metrics::bump(&shared.session.metrics.timeouts);
            Err(Error::RequestTimedOut)
        }
    }
}

impl HandlerShared {
    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn next_host(&self) -> Option<Arc<Host>> {
        self.plan.lock().next()
    }

    fn remaining(&self) -> Duration {
        self.spec
            .request_timeout
            .saturating_sub(self.started.elapsed())
            .max(Duration::from_millis(1))
    }

    fn record_attempt(&self, host: &Host) {
        self.attempted.lock().push(host.address.to_string());
    }

    fn attempted(&self) -> Vec<String> {
        self.attempted.lock().clone()
    }

    /// First caller wins; later completions count as aborted speculative
    /// executions.
    fn complete(&self, result: Result<QueryResult>) {
        let tx = self.result_tx.lock().take();
        match tx {
            Some(tx) => {
                self.done.store(true, Ordering::Release);
                // A failed send means the caller cancelled the request.
                let _ = tx.send(result);
            }
            None => Metrics::bump(&self.session.metrics.speculative_aborted),
        }
    }

    fn retry_info(&self, attempt: &AttemptState) -> RetryInfo {
        RetryInfo {
            consistency: attempt.consistency,
            retry_count: self.retry_count.load(Ordering::Relaxed),
            is_idempotent: self.spec.is_idempotent,
        }
    }

    /// After a successful write, ask the speculative plan whether to launch
    /// another execution.
    fn maybe_schedule_speculative(self: &Arc<Self>, host: &Host) {
        if !self.spec.is_idempotent || self.is_done() {
            return;
        }
        let delay = self.speculative_plan.lock().next_execution(host);
        let Some(delay) = delay else {
            return;
        };
        self.running.fetch_add(1, Ordering::AcqRel);
        Metrics::bump(&self.session.metrics.speculative_started);
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if shared.is_done() {
                shared.running.fetch_sub(1, Ordering::AcqRel);
                return;
            }
            debug!("launching speculative execution");
            run_execution(shared).await;
        });
    }

    fn base_result(&self, response: &Response) -> QueryResult {
        QueryResult {
            tracing_id: response.tracing_id,
            warnings: response.warnings.clone(),
            custom_payload: response.custom_payload.clone(),
            attempted_addresses: if self.spec.record_attempted_addresses {
                self.attempted()
            } else {
                Vec::new()
            },
            ..QueryResult::default()
        }
    }
}

async fn run_execution(shared: Arc<HandlerShared>) {
    let mut attempt = AttemptState {
        consistency: shared.spec.consistency,
        repreparations: 0,
    };

    'hosts: loop {
        if shared.is_done() {
            break;
        }
        let Some(host) = shared.next_host() else {
            // Plan exhausted: only the last running execution reports it.
            if shared.running.fetch_sub(1, Ordering::AcqRel) == 1 && !shared.is_done() {
                shared.complete(Err(Error::NoHostsAvailable {
                    attempted: shared.attempted(),
                }));
            }
            return;
        };
        let Some(pool) = shared.session.pool(&host.address) else {
            continue;
        };
        if pool.is_critical_failure() {
            continue;
        }
        attempt.repreparations = 0;

        'connection: loop {
            if shared.is_done() {
                break 'hosts;
            }
            let connection = match pool.connection().await {
                Ok(connection) => connection,
                Err(_) => continue 'hosts,
            };

            // Pre-v5 keyspace propagation: USE before the request, serialized
            // on the connection. v5 carries the keyspace in the frame.
            if connection.version < ProtocolVersion::V5 {
                if let Some(keyspace) = &shared.spec.keyspace {
                    match connection.ensure_keyspace(keyspace, shared.remaining()).await {
                        Ok(()) => {}
                        Err(e @ Error::UnableToSetKeyspace(_)) => {
                            shared.complete(Err(e));
                            break 'hosts;
                        }
                        Err(_) => continue 'hosts,
                    }
                }
            }

            loop {
                match attempt_once(&shared, &mut attempt, &host, &connection).await {
                    Outcome::Done | Outcome::Stop => break 'hosts,
                    Outcome::RetrySameConnection => {
                        if connection.is_closed() {
                            continue 'connection;
                        }
                    }
                    Outcome::NextHost => continue 'hosts,
                }
            }
        }
    }

    shared.running.fetch_sub(1, Ordering::AcqRel);
}

/// One write + one response on one connection.
async fn attempt_once(
    shared: &Arc<HandlerShared>,
    attempt: &mut AttemptState,
    host: &Arc<Host>,
    connection: &Arc<Connection>,
) -> Outcome {
    let version = connection.version;
    let spec = &shared.spec;

    let keyspace = spec
        .keyspace
        .clone()
        .filter(|_| version >= ProtocolVersion::V5);
    let mut params = QueryParameters {
        consistency: Some(attempt.consistency),
        serial_consistency: spec.serial_consistency,
        timestamp: spec.timestamp,
        page_size: spec.page_size,
        paging_state: spec.paging_state.clone(),
        skip_metadata: false,
        keyspace,
        values: Vec::new(),
        names: Vec::new(),
    };

    // Borrow targets that must outlive the request value.
    let metadata_entry;
    let request = match &spec.kind {
        RequestKind::Query { query, values, names } => {
            params.values = values.clone();
            params.names = names.clone();
            Request::Query {
                query,
                params: &params,
            }
        }
        RequestKind::Execute { prepared, values } => {
            metadata_entry = prepared.result_metadata();
            params.values = values.clone();
            // Metadata is patched back in from the cache, sparing the server
            // re-sending column specs.
            params.skip_metadata = !metadata_entry.metadata.columns.is_empty();
            Request::Execute {
                id: &prepared.id,
                result_metadata_id: metadata_entry.id.as_deref(),
                params: &params,
            }
        }
        RequestKind::Batch {
            batch_type,
            entries,
            ..
        } => Request::Batch {
            batch_type: *batch_type,
            entries,
            consistency: attempt.consistency,
            serial_consistency: spec.serial_consistency,
            timestamp: spec.timestamp,
            keyspace: params.keyspace.as_deref(),
        },
        RequestKind::Prepare { query } => Request::Prepare {
            query,
            keyspace: spec.keyspace.as_deref(),
        },
    };

    let handle = match connection.send(&request, spec.tracing, spec.custom_payload.as_ref()) {
        Ok(handle) => handle,
        Err(Error::NoStreams) => return Outcome::NextHost,
        Err(e) if e.is_host_level() => return Outcome::NextHost,
        Err(e) => {
            shared.complete(Err(e));
            return Outcome::Done;
        }
    };

    shared.record_attempt(host);
    host.request_started();
    shared.maybe_schedule_speculative(host);
    let write_instant = Instant::now();
    let result = handle.wait(shared.remaining()).await;
    host.request_finished();

    match result {
        Ok(response) => {
            if shared.is_done() {
                Metrics::bump(&shared.session.metrics.speculative_aborted);
                return Outcome::Stop;
            }
            process_response(shared, attempt, host, connection, response, write_instant).await
        }
        // The outer request timer owns timeout reporting; the stream stays
        // allocated until the server answers.
        Err(Error::RequestTimedOut) => Outcome::Stop,
        Err(_) => Outcome::NextHost,
    }
}

async fn process_response(
    shared: &Arc<HandlerShared>,
    attempt: &mut AttemptState,
    host: &Arc<Host>,
    connection: &Arc<Connection>,
    response: Response,
    write_instant: Instant,
) -> Outcome {
    let mut query_result = shared.base_result(&response);
    match response.kind {
        ResponseKind::Result(result) => {
            host.record_latency(write_instant.elapsed());
            match result {
                CqlResult::Rows(mut rows) => {
                    if let RequestKind::Execute { prepared, .. } = &shared.spec.kind {
                        if rows.metadata.flags.contains(ResultMetadataFlags::NO_METADATA) {
                            let entry = prepared.result_metadata();
                            rows.metadata.columns = entry.metadata.columns.clone();
                            rows.metadata.columns_count = entry.metadata.columns_count;
                        } else if let Some(new_id) = rows.metadata.new_metadata_id.clone() {
                            // The session cache is shared; updating the entry
                            // is the broadcast.
                            let mut metadata = rows.metadata.clone();
                            metadata.paging_state = None;
                            prepared.update_result_metadata(Some(new_id), metadata);
                        }
                    }
                    query_result.rows = Some(rows);
                    if let Some(tracing_id) = query_result.tracing_id {
                        query_result.tracing_info =
                            fetch_tracing(shared, connection, tracing_id).await;
                    }
                    shared.complete(Ok(query_result));
                    Outcome::Done
                }
                CqlResult::SetKeyspace(keyspace) => {
                    // Completion is gated on the keyspace reaching every
                    // pool's future connections.
                    shared.session.broadcast_keyspace(&keyspace);
                    query_result.set_keyspace = Some(keyspace);
                    shared.complete(Ok(query_result));
                    Outcome::Done
                }
                CqlResult::SchemaChange(change) => {
                    shared.session.cluster.wait_for_schema_agreement().await;
                    query_result.schema_change = Some(change);
                    shared.complete(Ok(query_result));
                    Outcome::Done
                }
                CqlResult::Prepared(prepared_result) => {
                    let RequestKind::Prepare { query } = &shared.spec.kind else {
                        shared.complete(Err(Error::UnexpectedResponse(
                            "RESULT(prepared) for a non-PREPARE request",
                        )));
                        return Outcome::Done;
                    };
                    let statement = Arc::new(PreparedStatement::from_result(
                        query.clone(),
                        shared.spec.keyspace.clone(),
                        prepared_result,
                    ));
                    shared
                        .session
                        .prepared
                        .write()
                        .insert(Arc::clone(&statement));
                    if shared.session.opts.prepare_on_all_hosts {
                        shared
                            .session
                            .prepare_on_all(&statement, &host.address)
                            .await;
                    }
                    query_result.prepared = Some(statement);
                    shared.complete(Ok(query_result));
                    Outcome::Done
                }
                CqlResult::Void => {
                    shared.complete(Ok(query_result));
                    Outcome::Done
                }
            }
        }
        ResponseKind::Error(error) => {
            Metrics::bump(&shared.session.metrics.errors);
            handle_server_error(shared, attempt, connection, error).await
        }
        _ => {
            shared.complete(Err(Error::UnexpectedResponse(
                "unexpected opcode for a request",
            )));
            Outcome::Done
        }
    }
}

async fn handle_server_error(
    shared: &Arc<HandlerShared>,
    attempt: &mut AttemptState,
    connection: &Arc<Connection>,
    error: ErrorResponse,
) -> Outcome {
    let spec = &shared.spec;
    let info = shared.retry_info(attempt);
    let policy = &spec.retry_policy;

    let decision = match (error.code, &error.details) {
        (ErrorCode::IsBootstrapping, _) => {
            // Never a policy matter: the host cannot serve reads yet.
            warn!(host = %connection.address, "host is bootstrapping; trying next host");
            return Outcome::NextHost;
        }
        (ErrorCode::Unprepared, details) => {
            return handle_unprepared(shared, attempt, connection, details).await;
        }
        (ErrorCode::ServerError, _) => {
            // Assume the connection state is corrupted.
            connection.defunct();
            if spec.is_idempotent {
                policy.on_request_error(&info, &error)
            } else {
                RetryDecision::ReturnError
            }
        }
        (ErrorCode::Overloaded | ErrorCode::TruncateError, _) => {
            policy.on_request_error(&info, &error)
        }
        (
            ErrorCode::ReadTimeout,
            ErrorDetails::ReadTimeout {
                received,
                block_for,
                data_present,
                ..
            },
        ) => policy.on_read_timeout(&info, *received, *block_for, *data_present),
        (
            ErrorCode::WriteTimeout,
            ErrorDetails::WriteTimeout {
                received,
                block_for,
                write_type,
                ..
            },
        ) => policy.on_write_timeout(&info, *received, *block_for, *write_type),
        (
            ErrorCode::Unavailable,
            ErrorDetails::Unavailable {
                required, alive, ..
            },
        ) => policy.on_unavailable(&info, *required, *alive),
        _ => RetryDecision::ReturnError,
    };

    match decision {
        RetryDecision::RetrySameHost(consistency) => {
            shared.retry_count.fetch_add(1, Ordering::Relaxed);
            Metrics::bump(&shared.session.metrics.retries);
            if let Some(consistency) = consistency {
                attempt.consistency = consistency;
            }
            Outcome::RetrySameConnection
        }
        RetryDecision::RetryNextHost(consistency) => {
            shared.retry_count.fetch_add(1, Ordering::Relaxed);
            Metrics::bump(&shared.session.metrics.retries);
            if let Some(consistency) = consistency {
                attempt.consistency = consistency;
            }
            Outcome::NextHost
        }
        RetryDecision::Ignore => {
            // An empty result stands in for the swallowed error.
            shared.complete(Ok(QueryResult::default()));
            Outcome::Done
        }
        RetryDecision::ReturnError => {
            shared.complete(Err(Error::Server(error)));
            Outcome::Done
        }
    }
}

/// The server evicted the statement: PREPARE it again on the same connection
/// and re-run the original request there. A second UNPREPARED in a row on
/// the same host escalates to the next host.
async fn handle_unprepared(
    shared: &Arc<HandlerShared>,
    attempt: &mut AttemptState,
    connection: &Arc<Connection>,
    details: &ErrorDetails,
) -> Outcome {
    if attempt.repreparations >= 1 {
        warn!("statement unprepared again after re-prepare; trying next host");
        return Outcome::NextHost;
    }
    let statement = match (&shared.spec.kind, details) {
        (RequestKind::Execute { prepared, .. }, _) => Some(Arc::clone(prepared)),
        (RequestKind::Batch { prepared, .. }, ErrorDetails::Unprepared { id }) => prepared
            .iter()
            .find(|statement| &statement.id == id)
            .cloned(),
        _ => None,
    };
    let Some(statement) = statement else {
        shared.complete(Err(Error::UnexpectedResponse(
            "UNPREPARED for an unknown statement",
        )));
        return Outcome::Done;
    };

    attempt.repreparations += 1;
    debug!(query = %statement.query, "re-preparing evicted statement");
    let request = Request::Prepare {
        query: &statement.query,
        keyspace: statement.keyspace.as_deref(),
    };
    match connection.request(&request, shared.remaining()).await {
        Ok(response) => match response.kind {
            ResponseKind::Result(CqlResult::Prepared(_)) => Outcome::RetrySameConnection,
            ResponseKind::Error(e) => {
                shared.complete(Err(Error::Server(e)));
                Outcome::Done
            }
            _ => {
                shared.complete(Err(Error::UnexpectedResponse("expected RESULT(prepared)")));
                Outcome::Done
            }
        },
        Err(Error::RequestTimedOut) => Outcome::Stop,
        Err(_) => Outcome::NextHost,
    }
}

/// Poll `system_traces.sessions` on the coordinator until the trace is
/// complete or the tracing budget elapses.
async fn fetch_tracing(
    shared: &Arc<HandlerShared>,
    connection: &Arc<Connection>,
    tracing_id: Uuid,
) -> Option<TracingInfo> {
    let budget = Duration::from_millis(shared.session.opts.max_tracing_wait_ms);
    let deadline = Instant::now() + budget;
    let query = format!(
        "SELECT request, coordinator, duration FROM system_traces.sessions \
         WHERE session_id = {tracing_id}"
    );
    loop {
        if let Ok(rows) = query_rows(connection, &query, budget).await {
            if let Some(row) = SystemRow::first(&rows) {
                if let Some(duration) = row.int("duration") {
                    return Some(TracingInfo {
                        request: row.text("request"),
                        coordinator: row.inet("coordinator"),
                        duration_micros: Some(duration),
                    });
                }
            }
        }
        if Instant::now() + TRACING_POLL > deadline {
            debug!(%tracing_id, "tracing data not available within budget");
            return None;
        }
        tokio::time::sleep(TRACING_POLL).await;
    }
}
