//! The control connection: one dedicated connection that discovers topology
//! from the system tables, subscribes to server events, and publishes
//! [`ClusterSnapshot`]s. On failure a new control host is elected from the
//! known host set with the same backoff schedule pools use.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use simdutf8::basic::from_utf8;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cluster::host::{Address, Host};
use crate::cluster::token::{Partitioner, ReplicationStrategy, TokenMap};
use crate::cluster::ClusterSnapshot;
use crate::connection::Connection;
use crate::constant::{Consistency, ErrorCode, ProtocolVersion};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::opts::Opts;
use crate::protocol::event::{Event, StatusChange, TopologyChange};
use crate::protocol::primitive::{read_bytes, read_i32};
use crate::protocol::request::{QueryParameters, Request};
use crate::protocol::response::{ColumnSpec, CqlResult, ResponseKind, Rows};

const SELECT_LOCAL: &str =
    "SELECT data_center, rack, host_id, tokens, partitioner, schema_version FROM system.local";
const SELECT_PEERS: &str =
    "SELECT peer, rpc_address, data_center, rack, host_id, tokens, schema_version FROM system.peers";
const SELECT_PEERS_V2: &str = "SELECT peer, native_address, native_port, data_center, rack, \
     host_id, tokens, schema_version FROM system.peers_v2";
const SELECT_KEYSPACES: &str = "SELECT keyspace_name, replication FROM system_schema.keyspaces";
const SELECT_SCHEMA_LOCAL: &str = "SELECT schema_version FROM system.local";
const SELECT_SCHEMA_PEERS: &str = "SELECT peer, rpc_address, schema_version FROM system.peers";

const SCHEMA_AGREEMENT_POLL: Duration = Duration::from_millis(200);

/// Notifications the session reacts to (pool add/remove/kick and policy
/// hooks).
#[derive(Debug)]
pub(crate) enum ClusterEvent {
    HostAdded(Arc<Host>),
    HostRemoved(Arc<Host>),
    HostUp(Arc<Host>),
    HostDown(Arc<Host>),
}

pub(crate) struct Cluster {
    opts: Arc<Opts>,
    version: ProtocolVersion,
    snapshot: ArcSwap<ClusterSnapshot>,
    control: Mutex<Option<Arc<Connection>>>,
    /// The first host we learned topology from; seeds policy init.
    initial_host: Arc<Host>,
    partitioner: Mutex<Partitioner>,
    keyspaces: Mutex<HashMap<String, ReplicationStrategy>>,
    session_events: mpsc::UnboundedSender<ClusterEvent>,
    server_events: mpsc::UnboundedSender<Event>,
    use_peers_v2: AtomicBool,
    is_closing: AtomicBool,
    election_cursor: AtomicUsize,
    metrics: Arc<Metrics>,
}

impl Cluster {
    /// Bootstrap: resolve contact points, negotiate a protocol version,
    /// read the topology, subscribe to events.
    pub async fn connect(
        opts: Arc<Opts>,
        metrics: Arc<Metrics>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ClusterEvent>)> {
        let contact_points = resolve_contact_points(&opts).await?;
        if contact_points.is_empty() {
            return Err(Error::UnableToInit("no contact points resolved".to_string()));
        }

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();

        let mut connected = None;
        let mut last_error = Error::NoHostsAvailable { attempted: Vec::new() };
        for address in &contact_points {
            match negotiate_control(&opts, address, &metrics, server_tx.clone()).await {
                Ok((connection, version)) => {
                    connected = Some((connection, version, address.clone()));
                    break;
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "contact point failed");
                    last_error = e;
                }
            }
        }
        let Some((connection, version, address)) = connected else {
            return Err(Error::UnableToInit(format!(
                "all contact points failed; last error: {last_error}"
            )));
        };

        let cluster = Arc::new(Self {
            opts,
            version,
            snapshot: ArcSwap::from_pointee(ClusterSnapshot::empty()),
            control: Mutex::new(Some(Arc::clone(&connection))),
            initial_host: Arc::new(Host::new(
                address,
                String::new(),
                String::new(),
                None,
                Vec::new(),
                None,
            )),
            partitioner: Mutex::new(Partitioner::Murmur3),
            keyspaces: Mutex::new(HashMap::new()),
            session_events: session_tx,
            server_events: server_tx,
            use_peers_v2: AtomicBool::new(version >= ProtocolVersion::V4),
            is_closing: AtomicBool::new(false),
            election_cursor: AtomicUsize::new(0),
            metrics,
        });
        cluster.refresh_keyspaces(&connection).await;
        cluster.refresh_topology(&connection, true).await?;
        tokio::spawn(control_task(Arc::clone(&cluster), server_rx));
        Ok((cluster, session_rx))
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.snapshot.load_full()
    }

    /// The host topology was first read from (policy `init` argument).
    pub fn initial_host(&self) -> Arc<Host> {
        let snapshot = self.snapshot();
        snapshot
            .host(&self.initial_host.address)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.initial_host))
    }

    pub fn close(&self) {
        self.is_closing.store(true, Ordering::Release);
        if let Some(connection) = self.control.lock().take() {
            connection.close();
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.opts.request_timeout_ms)
    }

    async fn query_rows(&self, connection: &Arc<Connection>, query: &str) -> Result<Rows> {
        query_rows(connection, query, self.request_timeout()).await
    }

    /// Re-read `system.local` + peers and publish a fresh snapshot. The
    /// initial bootstrap read publishes silently; later refreshes emit
    /// per-host add/remove events.
    #[instrument(skip(self, connection))]
    async fn refresh_topology(&self, connection: &Arc<Connection>, initial: bool) -> Result<()> {
        let local = self.query_rows(connection, SELECT_LOCAL).await?;
        let peers = self.query_peers(connection).await?;

        let previous = self.snapshot();
        let mut hosts: Vec<Arc<Host>> = Vec::new();

        if let Some(row) = SystemRow::first(&local) {
            let mut address = connection.address.clone();
            if self.opts.use_hostname_resolution {
                address.hostname = lookup_hostname(address.ip).await;
            }
            if let Some(partitioner) = row.text("partitioner") {
                *self.partitioner.lock() = Partitioner::from_class(&partitioner);
            }
            hosts.push(upsert_host(&previous, &row, address));
        }

        for row in SystemRow::all(&peers) {
            let Some(address) = self.peer_address(&row) else {
                warn!("peer row without usable address skipped");
                continue;
            };
            hosts.push(upsert_host(&previous, &row, address));
        }

        if !initial {
            for host in &hosts {
                if previous.host(&host.address).is_none() {
                    let _ = self.session_events.send(ClusterEvent::HostAdded(Arc::clone(host)));
                }
            }
            for host in &previous.hosts {
                if !hosts.iter().any(|h| h.address == host.address) {
                    let _ = self
                        .session_events
                        .send(ClusterEvent::HostRemoved(Arc::clone(host)));
                }
            }
        }

        self.publish(hosts);
        Ok(())
    }

    async fn query_peers(&self, connection: &Arc<Connection>) -> Result<Rows> {
        if self.use_peers_v2.load(Ordering::Relaxed) {
            match self.query_rows(connection, SELECT_PEERS_V2).await {
                Ok(rows) => return Ok(rows),
                Err(Error::Server(e)) if e.code == ErrorCode::InvalidQuery => {
                    debug!("system.peers_v2 missing; falling back to system.peers");
                    self.use_peers_v2.store(false, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }
        self.query_rows(connection, SELECT_PEERS).await
    }

    fn peer_address(&self, row: &SystemRow<'_>) -> Option<Address> {
        if let Some(ip) = row.inet("native_address") {
            let port = row.int("native_port").unwrap_or(self.opts.port as i32);
            return Some(Address::new(ip, port as u16));
        }
        let ip = match row.inet("rpc_address") {
            // 0.0.0.0 means "use the internal peer address"
            Some(ip) if !ip.is_unspecified() => ip,
            _ => row.inet("peer")?,
        };
        Some(Address::new(ip, self.opts.port))
    }

    /// Read per-keyspace replication for the token map. Pre-3.x servers
    /// without `system_schema` simply lose token-aware routing.
    async fn refresh_keyspaces(&self, connection: &Arc<Connection>) {
        match self.query_rows(connection, SELECT_KEYSPACES).await {
            Ok(rows) => {
                let mut keyspaces = HashMap::new();
                for row in SystemRow::all(&rows) {
                    let Some(name) = row.text("keyspace_name") else {
                        continue;
                    };
                    let replication = row.text_map("replication");
                    keyspaces.insert(name, ReplicationStrategy::from_options(&replication));
                }
                *self.keyspaces.lock() = keyspaces;
            }
            Err(e) => {
                warn!(error = %e, "failed to read keyspace replication; token map disabled");
            }
        }
    }

    fn publish(&self, hosts: Vec<Arc<Host>>) {
        let token_map = TokenMap::build(
            *self.partitioner.lock(),
            &hosts,
            self.keyspaces.lock().clone(),
        );
        self.snapshot.store(Arc::new(ClusterSnapshot {
            hosts,
            token_map: Arc::new(token_map),
        }));
    }

    /// Poll schema versions until every live host agrees or the budget runs
    /// out. Returns whether agreement was reached.
    pub async fn wait_for_schema_agreement(&self) -> bool {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.opts.max_schema_wait_ms);
        loop {
            match self.check_schema_agreement().await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "schema agreement check failed");
                }
            }
            if tokio::time::Instant::now() + SCHEMA_AGREEMENT_POLL > deadline {
                warn!("schema agreement not reached within budget; schema may be stale on some nodes");
                return false;
            }
            tokio::time::sleep(SCHEMA_AGREEMENT_POLL).await;
        }
    }

    async fn check_schema_agreement(&self) -> Result<bool> {
        let connection = self
            .control
            .lock()
            .clone()
            .ok_or(Error::ConnectionClosed)?;
        let snapshot = self.snapshot();

        let local = self.query_rows(&connection, SELECT_SCHEMA_LOCAL).await?;
        let mut versions: Vec<Uuid> = Vec::new();
        if let Some(row) = SystemRow::first(&local) {
            if let Some(version) = row.uuid("schema_version") {
                versions.push(version);
            }
        }

        let peers = self.query_rows(&connection, SELECT_SCHEMA_PEERS).await?;
        for row in SystemRow::all(&peers) {
            let ip = match row.inet("rpc_address") {
                Some(ip) if !ip.is_unspecified() => Some(ip),
                _ => row.inet("peer"),
            };
            // Only live hosts gate agreement; a downed node must not stall
            // DDL forever.
            let live = ip
                .map(|ip| {
                    snapshot
                        .hosts
                        .iter()
                        .any(|h| h.address.ip == ip && h.is_up())
                })
                .unwrap_or(false);
            if !live {
                continue;
            }
            if let Some(version) = row.uuid("schema_version") {
                versions.push(version);
            }
        }

        versions.sort();
        versions.dedup();
        Ok(versions.len() <= 1)
    }

    async fn handle_event(&self, event: Event) {
        let connection = self.control.lock().clone();
        let Some(connection) = connection else {
            return;
        };
        match event {
            Event::Topology { change, address } => {
                debug!(?change, %address, "topology event");
                match change {
                    TopologyChange::NewNode | TopologyChange::MovedNode => {
                        if let Err(e) = self.refresh_topology(&connection, false).await {
                            warn!(error = %e, "topology refresh failed");
                        }
                        if change == TopologyChange::NewNode {
                            // A joining node may still be catching up on DDL.
                            self.wait_for_schema_agreement().await;
                        }
                    }
                    TopologyChange::RemovedNode => {
                        let removed = Address::from(address);
                        let previous = self.snapshot();
                        let removed_host = previous
                            .hosts
                            .iter()
                            .find(|h| h.address.ip == removed.ip)
                            .cloned();
                        if let Some(removed_host) = removed_host {
                            let hosts: Vec<Arc<Host>> = previous
                                .hosts
                                .iter()
                                .filter(|h| h.address.ip != removed.ip)
                                .cloned()
                                .collect();
                            self.publish(hosts);
                            let _ = self
                                .session_events
                                .send(ClusterEvent::HostRemoved(removed_host));
                        }
                    }
                }
            }
            Event::Status { change, address } => {
                let address = Address::from(address);
                let snapshot = self.snapshot();
                let known = snapshot.hosts.iter().find(|h| h.address.ip == address.ip);
                match change {
                    StatusChange::Up => {
                        if let Some(host) = known {
                            host.set_up(true);
                            let _ = self
                                .session_events
                                .send(ClusterEvent::HostUp(Arc::clone(host)));
                        }
                    }
                    StatusChange::Down => {
                        // Advisory: the pool observes connection health
                        // itself; only policies hear about it.
                        if let Some(host) = known {
                            let _ = self
                                .session_events
                                .send(ClusterEvent::HostDown(Arc::clone(host)));
                        }
                    }
                }
            }
            Event::Schema(change) => {
                debug!(change = ?change.change_type, keyspace = %change.keyspace, "schema event");
                self.refresh_keyspaces(&connection).await;
                let snapshot = self.snapshot();
                self.publish(snapshot.hosts.clone());
                self.wait_for_schema_agreement().await;
            }
        }
    }

    /// Elect a new control host: round-robin over known hosts, pool backoff
    /// schedule between full passes.
    async fn reelect(&self) -> Option<Arc<Connection>> {
        let mut attempt = 0usize;
        loop {
            if self.is_closing.load(Ordering::Acquire) {
                return None;
            }
            let snapshot = self.snapshot();
            let candidates: Vec<Arc<Host>> = snapshot
                .hosts
                .iter()
                .filter(|h| h.is_up())
                .cloned()
                .collect();
            let candidates = if candidates.is_empty() {
                snapshot.hosts.clone()
            } else {
                candidates
            };
            let start = self.election_cursor.fetch_add(1, Ordering::Relaxed);
            for offset in 0..candidates.len() {
                let host = &candidates[(start + offset) % candidates.len()];
                match Connection::connect(
                    &host.address,
                    self.version,
                    &self.opts,
                    None,
                    true,
                    Some(self.server_events.clone()),
                    Arc::clone(&self.metrics),
                )
                .await
                {
                    Ok(connection) => {
                        info!(host = %host.address, "new control connection established");
                        return Some(connection);
                    }
                    Err(e) => {
                        warn!(host = %host.address, error = %e, "control candidate failed");
                    }
                }
            }
            let delay = control_backoff(&self.opts, attempt);
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }
}

fn control_backoff(opts: &Opts, attempt: usize) -> Duration {
    let base = opts.reconnect_base_ms.max(1);
    let cap = opts.reconnect_cap_ms.max(base);
    let exp = base.saturating_mul(1u64 << attempt.min(16)).min(cap);
    Duration::from_millis(exp)
}

/// Event pump plus control-host re-election.
async fn control_task(cluster: Arc<Cluster>, mut server_rx: mpsc::UnboundedReceiver<Event>) {
    loop {
        let connection = cluster.control.lock().clone();
        let Some(connection) = connection else {
            return;
        };
        loop {
            tokio::select! {
                event = server_rx.recv() => {
                    match event {
                        Some(event) => cluster.handle_event(event).await,
                        None => return,
                    }
                }
                _ = connection.closed() => break,
            }
        }
        if cluster.is_closing.load(Ordering::Acquire) {
            return;
        }
        warn!("control connection lost; electing a new control host");
        let Some(new_connection) = cluster.reelect().await else {
            return;
        };
        *cluster.control.lock() = Some(Arc::clone(&new_connection));
        // Topology may have moved while we were blind.
        cluster.refresh_keyspaces(&new_connection).await;
        if let Err(e) = cluster.refresh_topology(&new_connection, false).await {
            warn!(error = %e, "topology refresh after re-election failed");
        }
    }
}

async fn negotiate_control(
    opts: &Arc<Opts>,
    address: &Address,
    metrics: &Arc<Metrics>,
    server_tx: mpsc::UnboundedSender<Event>,
) -> Result<(Arc<Connection>, ProtocolVersion)> {
    let mut last_error = None;
    for version in opts.candidate_versions() {
        match Connection::connect(
            address,
            version,
            opts,
            None,
            true,
            Some(server_tx.clone()),
            Arc::clone(metrics),
        )
        .await
        {
            Ok(connection) => {
                debug!(?version, options = ?connection.supported_options(), "control connection ready");
                return Ok((connection, version));
            }
            Err(Error::Server(e))
                if e.code == ErrorCode::ProtocolError && opts.protocol_version.is_none() =>
            {
                debug!(?version, "server rejected protocol version; stepping down");
                last_error = Some(Error::Server(e));
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or(Error::UnableToDetermineProtocol(0)))
}

async fn resolve_contact_points(opts: &Opts) -> Result<Vec<Address>> {
    let mut addresses = Vec::new();
    let resolve_timeout = Duration::from_millis(opts.resolve_timeout_ms);
    for contact_point in &opts.contact_points {
        // A bare IP literal first, so IPv6 colons are not read as a port.
        if let Ok(ip) = contact_point.parse::<IpAddr>() {
            addresses.push(Address::new(ip, opts.port));
            continue;
        }
        let (host, port) = match contact_point.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                (host.to_string(), port.parse::<u16>().unwrap_or(opts.port))
            }
            _ => (contact_point.clone(), opts.port),
        };
        if let Ok(ip) = host.parse::<IpAddr>() {
            addresses.push(Address::new(ip, port));
            continue;
        }
        match tokio::time::timeout(resolve_timeout, tokio::net::lookup_host((host.clone(), port)))
            .await
        {
            Ok(Ok(resolved)) => {
                for socket_addr in resolved {
                    let mut address = Address::from(socket_addr);
                    address.hostname = Some(host.clone());
                    addresses.push(address);
                }
            }
            Ok(Err(e)) => {
                warn!(host = %host, error = %e, "contact point resolution failed");
            }
            Err(_) => {
                return Err(Error::HostResolution(host));
            }
        }
    }
    Ok(addresses)
}

async fn lookup_hostname(_ip: IpAddr) -> Option<String> {
    // Reverse DNS needs a resolver the runtime does not ship; the forward
    // name from the contact point is kept instead when available.
    None
}

pub(crate) async fn query_rows(
    connection: &Arc<Connection>,
    query: &str,
    timeout: Duration,
) -> Result<Rows> {
    let params = QueryParameters {
        consistency: Some(Consistency::One),
        ..Default::default()
    };
    let response = connection
        .request(&Request::Query { query, params: &params }, timeout)
        .await?;
    match response.kind {
        ResponseKind::Result(CqlResult::Rows(rows)) => Ok(rows),
        ResponseKind::Result(_) => Err(Error::UnexpectedResponse("expected RESULT(rows)")),
        ResponseKind::Error(e) => Err(Error::Server(e)),
        _ => Err(Error::UnexpectedResponse("expected RESULT")),
    }
}

fn upsert_host(previous: &ClusterSnapshot, row: &SystemRow<'_>, address: Address) -> Arc<Host> {
    let dc = row.text("data_center").unwrap_or_default();
    let rack = row.text("rack").unwrap_or_default();
    let host_id = row.uuid("host_id");
    let tokens = row.text_set("tokens");
    let schema_version = row.uuid("schema_version");

    if let Some(existing) = previous.host(&address) {
        if existing.dc == dc && existing.rack == rack && existing.tokens == tokens {
            existing.set_schema_version(schema_version);
            return Arc::clone(existing);
        }
    }
    let host = Host::new(address, dc, rack, host_id, tokens, schema_version);
    Arc::new(host)
}

/// Name-indexed view over one row of a system-table result. Only the few
/// cell shapes the control connection needs are decoded here; full value
/// codecs live outside this crate.
pub(crate) struct SystemRow<'a> {
    columns: &'a [ColumnSpec],
    cells: &'a [Option<Vec<u8>>],
}

impl<'a> SystemRow<'a> {
    pub fn first(rows: &'a Rows) -> Option<Self> {
        rows.rows.first().map(|cells| Self {
            columns: &rows.metadata.columns,
            cells,
        })
    }

    pub fn all(rows: &'a Rows) -> impl Iterator<Item = SystemRow<'a>> {
        rows.rows.iter().map(|cells| Self {
            columns: &rows.metadata.columns,
            cells,
        })
    }

    fn bytes(&self, name: &str) -> Option<&'a [u8]> {
        let index = self.columns.iter().position(|c| c.name == name)?;
        self.cells.get(index)?.as_deref()
    }

    pub fn text(&self, name: &str) -> Option<String> {
        from_utf8(self.bytes(name)?).ok().map(str::to_string)
    }

    pub fn int(&self, name: &str) -> Option<i32> {
        let bytes = self.bytes(name)?;
        read_i32(bytes).ok().map(|(v, _)| v)
    }

    pub fn uuid(&self, name: &str) -> Option<Uuid> {
        let bytes = self.bytes(name)?;
        Uuid::from_slice(bytes).ok()
    }

    pub fn inet(&self, name: &str) -> Option<IpAddr> {
        let bytes = self.bytes(name)?;
        match bytes.len() {
            4 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(bytes);
                Some(IpAddr::from(buf))
            }
            16 => {
                let mut buf = [0u8; 16];
                buf.copy_from_slice(bytes);
                Some(IpAddr::from(buf))
            }
            _ => None,
        }
    }

    /// `set<text>` / `list<text>` cell: i32 count then `[bytes]` elements.
    pub fn text_set(&self, name: &str) -> Vec<String> {
        let Some(bytes) = self.bytes(name) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let Ok((count, mut rest)) = read_i32(bytes) else {
            return out;
        };
        for _ in 0..count {
            let Ok((element, r)) = read_bytes(rest) else {
                return out;
            };
            if let Some(element) = element {
                if let Ok(s) = from_utf8(element) {
                    out.push(s.to_string());
                }
            }
            rest = r;
        }
        out
    }

    /// `map<text, text>` cell: i32 count then `[bytes]` key/value pairs.
    pub fn text_map(&self, name: &str) -> HashMap<String, String> {
        let mut out = HashMap::new();
        let Some(bytes) = self.bytes(name) else {
            return out;
        };
        let Ok((count, mut rest)) = read_i32(bytes) else {
            return out;
        };
        for _ in 0..count {
            let Ok((key, r)) = read_bytes(rest) else {
                return out;
            };
            let Ok((value, r)) = read_bytes(r) else {
                return out;
            };
            if let (Some(key), Some(value)) = (key, value) {
                if let (Ok(key), Ok(value)) = (from_utf8(key), from_utf8(value)) {
                    out.insert(key.to_string(), value.to_string());
                }
            }
            rest = r;
        }
        out
    }
}
