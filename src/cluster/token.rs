//! Token ring and replica placement.
//!
//! The control connection rebuilds a [`TokenMap`] whenever the host set or a
//! keyspace's replication changes; readers only ever see whole published
//! snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cluster::host::Host;

/// A position on the ring. One partitioner per cluster, so mixed variants
/// never meet in one ring.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Token {
    Murmur3(i64),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partitioner {
    Murmur3,
    ByteOrdered,
}

impl Partitioner {
    /// Class names come from `system.local.partitioner`.
    pub fn from_class(class: &str) -> Self {
        if class.contains("Murmur3Partitioner") {
            Self::Murmur3
        } else {
            Self::ByteOrdered
        }
    }

    pub fn parse_token(self, s: &str) -> Option<Token> {
        match self {
            Self::Murmur3 => s.trim().parse::<i64>().ok().map(Token::Murmur3),
            Self::ByteOrdered => Some(Token::Bytes(
                decode_hex(s.trim()).unwrap_or_else(|| s.as_bytes().to_vec()),
            )),
        }
    }

    /// Hash a routing key onto the ring.
    pub fn hash(self, key: &[u8]) -> Token {
        match self {
            Self::Murmur3 => Token::Murmur3(murmur3_token(key)),
            Self::ByteOrdered => Token::Bytes(key.to_vec()),
        }
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for pair in bytes.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push((hi * 16 + lo) as u8);
    }
    Some(out)
}

const C1: i64 = 0x87c3_7b91_1142_53d5_u64 as i64;
const C2: i64 = 0x4cf5_ad43_2745_937f_u64 as i64;

fn fmix(mut k: i64) -> i64 {
    k ^= ((k as u64) >> 33) as i64;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd_u64 as i64);
    k ^= ((k as u64) >> 33) as i64;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53_u64 as i64);
    k ^= ((k as u64) >> 33) as i64;
    k
}

/// Cassandra's Murmur3 partitioner hash: MurmurHash3 x64/128 with the Java
/// implementation's sign-extending tail loads, truncated to the first half.
pub fn murmur3_token(key: &[u8]) -> i64 {
    let nblocks = key.len() / 16;
    let mut h1: i64 = 0;
    let mut h2: i64 = 0;

    for block in 0..nblocks {
        let base = block * 16;
        let mut k1 = i64::from_le_bytes(key[base..base + 8].try_into().unwrap_or([0; 8]));
        let mut k2 = i64::from_le_bytes(key[base + 8..base + 16].try_into().unwrap_or([0; 8]));

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x3849_5ab5);
    }

    let tail = &key[nblocks * 16..];
    let mut k1: i64 = 0;
    let mut k2: i64 = 0;
    if tail.len() > 8 {
        for i in (8..tail.len()).rev() {
            k2 ^= (tail[i] as i8 as i64) << ((i - 8) * 8);
        }
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        for i in (0..tail.len().min(8)).rev() {
            k1 ^= (tail[i] as i8 as i64) << (i * 8);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= key.len() as i64;
    h2 ^= key.len() as i64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    fmix(h1).wrapping_add(fmix(h2))
}

/// Replication parsed from `system_schema.keyspaces.replication`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationStrategy {
    Simple { replication_factor: usize },
    NetworkTopology { dc_factors: HashMap<String, usize> },
    /// LocalStrategy / EverywhereStrategy / unknown classes: no token-aware
    /// routing for the keyspace.
    Other,
}

impl ReplicationStrategy {
    pub fn from_options(options: &HashMap<String, String>) -> Self {
        let Some(class) = options.get("class") else {
            return Self::Other;
        };
        if class.ends_with("SimpleStrategy") {
            let replication_factor = options
                .get("replication_factor")
                .and_then(|rf| rf.parse().ok())
                .unwrap_or(1);
            Self::Simple { replication_factor }
        } else if class.ends_with("NetworkTopologyStrategy") {
            let dc_factors = options
                .iter()
                .filter(|(k, _)| k.as_str() != "class")
                .filter_map(|(k, v)| Some((k.clone(), v.parse().ok()?)))
                .collect();
            Self::NetworkTopology { dc_factors }
        } else {
            Self::Other
        }
    }
}

/// Immutable snapshot of the ring and per-keyspace replication.
pub struct TokenMap {
    partitioner: Partitioner,
    /// Sorted by token; indices into `hosts`.
    ring: Vec<(Token, usize)>,
    hosts: Vec<Arc<Host>>,
    keyspaces: HashMap<String, ReplicationStrategy>,
}

impl TokenMap {
    pub fn build(
        partitioner: Partitioner,
        hosts: &[Arc<Host>],
        keyspaces: HashMap<String, ReplicationStrategy>,
    ) -> Self {
        let hosts: Vec<Arc<Host>> = hosts.to_vec();
        let mut ring = Vec::new();
        for (index, host) in hosts.iter().enumerate() {
            for token in &host.tokens {
                if let Some(token) = partitioner.parse_token(token) {
                    ring.push((token, index));
                }
            }
        }
        ring.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            partitioner,
            ring,
            hosts,
            keyspaces,
        }
    }

    pub fn empty(partitioner: Partitioner) -> Self {
        Self {
            partitioner,
            ring: Vec::new(),
            hosts: Vec::new(),
            keyspaces: HashMap::new(),
        }
    }

    pub fn partitioner(&self) -> Partitioner {
        self.partitioner
    }

    /// Replicas for `token` in ring order, honoring the keyspace's
    /// replication strategy. Unknown keyspace/strategy yields only the
    /// primary replica.
    pub fn replicas(&self, keyspace: Option<&str>, token: &Token) -> Vec<Arc<Host>> {
        if self.ring.is_empty() {
            return Vec::new();
        }
        let strategy = keyspace.and_then(|ks| self.keyspaces.get(ks));
        match strategy {
            Some(ReplicationStrategy::Simple { replication_factor }) => {
                self.walk_simple(token, *replication_factor)
            }
            Some(ReplicationStrategy::NetworkTopology { dc_factors }) => {
                self.walk_network_topology(token, dc_factors)
            }
            Some(ReplicationStrategy::Other) | None => self.walk_simple(token, 1),
        }
    }

    /// Index of the first ring entry owning `token` (successor, wrapping).
    fn ring_start(&self, token: &Token) -> usize {
        match self.ring.binary_search_by(|(t, _)| t.cmp(token)) {
            Ok(index) => index,
            Err(index) => {
                if index == self.ring.len() {
                    0
                } else {
                    index
                }
            }
        }
    }

    fn walk_simple(&self, token: &Token, replication_factor: usize) -> Vec<Arc<Host>> {
        let start = self.ring_start(token);
        let mut seen = Vec::new();
        let mut replicas = Vec::new();
        for offset in 0..self.ring.len() {
            let (_, host_index) = self.ring[(start + offset) % self.ring.len()];
            if !seen.contains(&host_index) {
                seen.push(host_index);
                replicas.push(Arc::clone(&self.hosts[host_index]));
                if replicas.len() >= replication_factor {
                    break;
                }
            }
        }
        replicas
    }

    /// NetworkTopologyStrategy placement: per-DC factors, distinct racks
    /// preferred, same-rack hosts deferred until every rack in the DC is
    /// represented.
    fn walk_network_topology(
        &self,
        token: &Token,
        dc_factors: &HashMap<String, usize>,
    ) -> Vec<Arc<Host>> {
        let start = self.ring_start(token);
        let total: usize = dc_factors.values().sum();

        let mut replicas: Vec<usize> = Vec::new();
        let mut per_dc_count: HashMap<&str, usize> = HashMap::new();
        let mut racks_seen: Vec<(&str, &str)> = Vec::new();
        let mut deferred: Vec<usize> = Vec::new();

        for offset in 0..self.ring.len() {
            if replicas.len() >= total {
                break;
            }
            let (_, host_index) = self.ring[(start + offset) % self.ring.len()];
            if replicas.contains(&host_index) || deferred.contains(&host_index) {
                continue;
            }
            let host = &self.hosts[host_index];
            let Some(&factor) = dc_factors.get(&host.dc) else {
                continue;
            };
            let count = per_dc_count.entry(host.dc.as_str()).or_insert(0);
            if *count >= factor {
                continue;
            }
            let rack_key = (host.dc.as_str(), host.rack.as_str());
            if racks_seen.contains(&rack_key) {
                deferred.push(host_index);
            } else {
                racks_seen.push(rack_key);
                *count += 1;
                replicas.push(host_index);
            }
        }

        // Fill remaining slots from same-rack hosts, ring order.
        for host_index in deferred {
            let host = &self.hosts[host_index];
            let factor = dc_factors.get(&host.dc).copied().unwrap_or(0);
            let count = per_dc_count.entry(host.dc.as_str()).or_insert(0);
            if *count < factor {
                *count += 1;
                replicas.push(host_index);
            }
        }

        replicas
            .into_iter()
            .map(|index| Arc::clone(&self.hosts[index]))
            .collect()
    }
}
