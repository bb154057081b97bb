//! Load-balancing policies: which hosts to try, in what order.
//!
//! A [`QueryPlan`] is a single-pass snapshot taken at plan-creation time; it
//! holds no locks and is immune to concurrent host additions/removals.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rand::Rng;
use rand::seq::SliceRandom;

use crate::cluster::ClusterSnapshot;
use crate::cluster::host::{Host, HostDistance};
use crate::cluster::token::Token;
use crate::constant::Consistency;

/// Routing inputs for one plan.
#[derive(Debug, Clone)]
pub struct RoutingInfo<'a> {
    pub keyspace: Option<&'a str>,
    pub token: Option<Token>,
    pub consistency: Consistency,
}

/// Ordered hosts to try for one request. Guaranteed to never yield the same
/// host twice.
pub struct QueryPlan {
    hosts: std::vec::IntoIter<Arc<Host>>,
}

impl QueryPlan {
    pub fn new(hosts: Vec<Arc<Host>>) -> Self {
        let mut deduped: Vec<Arc<Host>> = Vec::with_capacity(hosts.len());
        for host in hosts {
            if !deduped.iter().any(|h| h.address == host.address) {
                deduped.push(host);
            }
        }
        Self {
            hosts: deduped.into_iter(),
        }
    }
}

impl Iterator for QueryPlan {
    type Item = Arc<Host>;

    fn next(&mut self) -> Option<Self::Item> {
        self.hosts.next()
    }
}

#[auto_impl::auto_impl(Arc)]
pub trait LoadBalancingPolicy: Send + Sync {
    /// Called once when the session has its first control connection.
    fn init(&self, connected: &Arc<Host>, cluster: &ClusterSnapshot);

    fn distance(&self, host: &Host) -> HostDistance;

    fn query_plan(&self, routing: &RoutingInfo<'_>, cluster: &ClusterSnapshot) -> QueryPlan;

    fn on_host_added(&self, _host: &Arc<Host>) {}
    fn on_host_removed(&self, _host: &Arc<Host>) {}
    fn on_host_up(&self, _host: &Arc<Host>) {}
    fn on_host_down(&self, _host: &Arc<Host>) {}
}

fn rotated<'a>(hosts: &[&'a Arc<Host>], start: usize) -> Vec<Arc<Host>> {
    let mut out = Vec::with_capacity(hosts.len());
    if hosts.is_empty() {
        return out;
    }
    let start = start % hosts.len();
    for offset in 0..hosts.len() {
        out.push(Arc::clone(hosts[(start + offset) % hosts.len()]));
    }
    out
}

/// Cycles over the full live-host list. The starting point is randomized at
/// construction so simultaneous clients do not convoy on one host.
pub struct RoundRobinPolicy {
    counter: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(rand::thread_rng().r#gen::<usize>() >> 1),
        }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn init(&self, _connected: &Arc<Host>, _cluster: &ClusterSnapshot) {}

    fn distance(&self, _host: &Host) -> HostDistance {
        HostDistance::Local
    }

    fn query_plan(&self, _routing: &RoutingInfo<'_>, cluster: &ClusterSnapshot) -> QueryPlan {
        let live: Vec<&Arc<Host>> = cluster.hosts.iter().filter(|h| h.is_up()).collect();
        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        QueryPlan::new(rotated(&live, start))
    }
}

/// Local-DC hosts first in round-robin order, then up to
/// `used_hosts_per_remote_dc` hosts from each remote DC. Remote DCs are
/// never used for `LOCAL_*` consistencies.
pub struct DcAwarePolicy {
    local_dc: RwLock<Option<String>>,
    used_hosts_per_remote_dc: usize,
    counter: AtomicUsize,
}

impl DcAwarePolicy {
    pub fn new(local_dc: Option<String>, used_hosts_per_remote_dc: usize) -> Self {
        Self {
            local_dc: RwLock::new(local_dc),
            used_hosts_per_remote_dc,
            counter: AtomicUsize::new(rand::thread_rng().r#gen::<usize>() >> 1),
        }
    }

    fn is_local(&self, host: &Host) -> bool {
        self.local_dc
            .read()
            .as_deref()
            .is_none_or(|dc| dc == host.dc)
    }

    /// Remote hosts grouped per DC, capped, preserving snapshot order.
    fn remote_hosts(&self, cluster: &ClusterSnapshot) -> Vec<Arc<Host>> {
        let local_dc = self.local_dc.read().clone();
        let mut groups: Vec<(&str, Vec<&Arc<Host>>)> = Vec::new();
        for host in cluster.hosts.iter().filter(|h| h.is_up()) {
            if local_dc.as_deref() == Some(host.dc.as_str()) {
                continue;
            }
            match groups.iter_mut().find(|(dc, _)| *dc == host.dc) {
                Some((_, group)) => group.push(host),
                None => groups.push((host.dc.as_str(), vec![host])),
            }
        }
        let mut out = Vec::new();
        for (_, group) in groups {
            out.extend(
                group
                    .into_iter()
                    .take(self.used_hosts_per_remote_dc)
                    .map(Arc::clone),
            );
        }
        out
    }
}

impl LoadBalancingPolicy for DcAwarePolicy {
    fn init(&self, connected: &Arc<Host>, _cluster: &ClusterSnapshot) {
        let mut local_dc = self.local_dc.write();
        if local_dc.is_none() {
            tracing::info!(dc = %connected.dc, "using the data center of the contact host as local");
            *local_dc = Some(connected.dc.clone());
        }
    }

    fn distance(&self, host: &Host) -> HostDistance {
        if self.is_local(host) {
            HostDistance::Local
        } else if self.used_hosts_per_remote_dc > 0 {
            HostDistance::Remote
        } else {
            HostDistance::Ignore
        }
    }

    fn query_plan(&self, routing: &RoutingInfo<'_>, cluster: &ClusterSnapshot) -> QueryPlan {
        let local: Vec<&Arc<Host>> = cluster
            .hosts
            .iter()
            .filter(|h| h.is_up() && self.is_local(h))
            .collect();
        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut plan = rotated(&local, start);
        if self.used_hosts_per_remote_dc > 0 && !routing.consistency.is_dc_local() {
            plan.extend(self.remote_hosts(cluster));
        }
        QueryPlan::new(plan)
    }
}

/// Local-rack hosts, then the rest of the local DC, then remote DCs (again
/// skipped for `LOCAL_*` consistencies).
pub struct RackAwarePolicy {
    local_dc: RwLock<Option<String>>,
    local_rack: RwLock<Option<String>>,
    used_hosts_per_remote_dc: usize,
    counter: AtomicUsize,
}

impl RackAwarePolicy {
    pub fn new(
        local_dc: Option<String>,
        local_rack: Option<String>,
        used_hosts_per_remote_dc: usize,
    ) -> Self {
        Self {
            local_dc: RwLock::new(local_dc),
            local_rack: RwLock::new(local_rack),
            used_hosts_per_remote_dc,
            counter: AtomicUsize::new(rand::thread_rng().r#gen::<usize>() >> 1),
        }
    }

    fn rank(&self, host: &Host) -> HostDistance {
        let local_dc = self.local_dc.read();
        let local_rack = self.local_rack.read();
        if local_dc.as_deref().is_none_or(|dc| dc == host.dc) {
            if local_rack.as_deref().is_none_or(|rack| rack == host.rack) {
                HostDistance::Local
            } else {
                HostDistance::Remote
            }
        } else if self.used_hosts_per_remote_dc > 0 {
            HostDistance::Remote2
        } else {
            HostDistance::Ignore
        }
    }
}

impl LoadBalancingPolicy for RackAwarePolicy {
    fn init(&self, connected: &Arc<Host>, _cluster: &ClusterSnapshot) {
        let mut local_dc = self.local_dc.write();
        let mut local_rack = self.local_rack.write();
        if local_dc.is_none() {
            tracing::info!(dc = %connected.dc, "using the data center of the contact host as local");
            *local_dc = Some(connected.dc.clone());
        }
        if local_rack.is_none() {
            tracing::info!(rack = %connected.rack, "using the rack of the contact host as local");
            *local_rack = Some(connected.rack.clone());
        }
    }

    fn distance(&self, host: &Host) -> HostDistance {
        self.rank(host)
    }

    fn query_plan(&self, routing: &RoutingInfo<'_>, cluster: &ClusterSnapshot) -> QueryPlan {
        let live: Vec<&Arc<Host>> = cluster.hosts.iter().filter(|h| h.is_up()).collect();
        let same_rack: Vec<&Arc<Host>> = live
            .iter()
            .copied()
            .filter(|h| self.rank(h) == HostDistance::Local)
            .collect();
        let same_dc: Vec<&Arc<Host>> = live
            .iter()
            .copied()
            .filter(|h| self.rank(h) == HostDistance::Remote)
            .collect();

        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut plan = rotated(&same_rack, start);
        plan.extend(rotated(&same_dc, start));
        if self.used_hosts_per_remote_dc > 0 && !routing.consistency.is_dc_local() {
            let remote: Vec<&Arc<Host>> = live
                .iter()
                .copied()
                .filter(|h| self.rank(h) == HostDistance::Remote2)
                .collect();
            plan.extend(rotated(&remote, start).into_iter().take(
                self.used_hosts_per_remote_dc,
            ));
        }
        QueryPlan::new(plan)
    }
}

/// Wraps another policy; when a routing token is known, replicas for that
/// token come first (shuffled so one replica does not soak all traffic), then
/// the wrapped plan.
pub struct TokenAwarePolicy<P> {
    child: P,
    shuffle_replicas: bool,
}

impl<P> TokenAwarePolicy<P> {
    pub fn new(child: P) -> Self {
        Self {
            child,
            shuffle_replicas: true,
        }
    }

    pub fn with_shuffle(child: P, shuffle_replicas: bool) -> Self {
        Self {
            child,
            shuffle_replicas,
        }
    }
}

impl<P: LoadBalancingPolicy> LoadBalancingPolicy for TokenAwarePolicy<P> {
    fn init(&self, connected: &Arc<Host>, cluster: &ClusterSnapshot) {
        self.child.init(connected, cluster);
    }

    fn distance(&self, host: &Host) -> HostDistance {
        self.child.distance(host)
    }

    fn query_plan(&self, routing: &RoutingInfo<'_>, cluster: &ClusterSnapshot) -> QueryPlan {
        let Some(token) = &routing.token else {
            return self.child.query_plan(routing, cluster);
        };
        let mut replicas: Vec<Arc<Host>> = cluster
            .token_map
            .replicas(routing.keyspace, token)
            .into_iter()
            .filter(|h| h.is_up() && self.child.distance(h) != HostDistance::Ignore)
            .collect();
        if self.shuffle_replicas {
            replicas.shuffle(&mut rand::thread_rng());
        }
        replicas.extend(self.child.query_plan(routing, cluster));
        QueryPlan::new(replicas)
    }

    fn on_host_added(&self, host: &Arc<Host>) {
        self.child.on_host_added(host);
    }

    fn on_host_removed(&self, host: &Arc<Host>) {
        self.child.on_host_removed(host);
    }

    fn on_host_up(&self, host: &Arc<Host>) {
        self.child.on_host_up(host);
    }

    fn on_host_down(&self, host: &Arc<Host>) {
        self.child.on_host_down(host);
    }
}
