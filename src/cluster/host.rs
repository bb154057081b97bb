use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

/// A node endpoint. `hostname` is informational only: two addresses with the
/// same ip/port/server-name are the same node whatever they reverse-resolve
/// to.
#[derive(Debug, Clone)]
pub struct Address {
    pub ip: IpAddr,
    pub port: u16,
    /// SNI name, when the cluster is fronted by a proxy.
    pub server_name: Option<String>,
    /// Reverse-resolved hostname (`use_hostname_resolution`).
    pub hostname: Option<String>,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            server_name: None,
            hostname: None,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Name to verify the TLS peer certificate against.
    pub fn tls_name(&self) -> String {
        self.server_name
            .clone()
            .or_else(|| self.hostname.clone())
            .unwrap_or_else(|| self.ip.to_string())
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port && self.server_name == other.server_name
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
        self.server_name.hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// How a load-balancing policy ranks a host relative to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HostDistance {
    Local,
    Remote,
    Remote2,
    Ignore,
}

/// A known cluster node. Topology fields are fixed per instance; the control
/// connection publishes a fresh `Host` when they change. Liveness and load
/// counters are shared across snapshots of the same node.
pub struct Host {
    pub address: Address,
    pub dc: String,
    pub rack: String,
    pub host_id: Option<Uuid>,
    /// Token strings as reported by the partitioner.
    pub tokens: Vec<String>,
    schema_version: Mutex<Option<Uuid>>,
    is_up: AtomicBool,
    in_flight: AtomicUsize,
    /// Rolling average response latency, microseconds.
    latency_us: AtomicU64,
}

impl Host {
    pub fn new(
        address: Address,
        dc: String,
        rack: String,
        host_id: Option<Uuid>,
        tokens: Vec<String>,
        schema_version: Option<Uuid>,
    ) -> Self {
        Self {
            address,
            dc,
            rack,
            host_id,
            tokens,
            schema_version: Mutex::new(schema_version),
            is_up: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            latency_us: AtomicU64::new(0),
        }
    }

    pub fn is_up(&self) -> bool {
        self.is_up.load(Ordering::Acquire)
    }

    pub fn set_up(&self, up: bool) {
        self.is_up.store(up, Ordering::Release);
    }

    pub fn schema_version(&self) -> Option<Uuid> {
        *self.schema_version.lock()
    }

    pub fn set_schema_version(&self, version: Option<Uuid>) {
        *self.schema_version.lock() = version;
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn request_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// EWMA with 1/8 weight on the new sample; integer arithmetic keeps this
    /// a single CAS-free update.
    pub(crate) fn record_latency(&self, latency: Duration) {
        let sample = latency.as_micros().min(u64::MAX as u128) as u64;
        let old = self.latency_us.load(Ordering::Relaxed);
        let new = if old == 0 {
            sample
        } else {
            old - (old >> 3) + (sample >> 3)
        };
        self.latency_us.store(new, Ordering::Relaxed);
    }

    pub fn average_latency(&self) -> Duration {
        Duration::from_micros(self.latency_us.load(Ordering::Relaxed))
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("dc", &self.dc)
            .field("rack", &self.rack)
            .field("host_id", &self.host_id)
            .field("is_up", &self.is_up())
            .finish()
    }
}
