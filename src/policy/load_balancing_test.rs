use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use crate::cluster::ClusterSnapshot;
use crate::cluster::host::{Address, Host, HostDistance};
use crate::cluster::token::{Partitioner, ReplicationStrategy, Token, TokenMap};
use crate::constant::Consistency;
use crate::policy::load_balancing::{
    DcAwarePolicy, LoadBalancingPolicy, QueryPlan, RackAwarePolicy, RoundRobinPolicy,
    RoutingInfo, TokenAwarePolicy,
};

fn host(ip_last: u8, dc: &str, rack: &str, tokens: &[i64]) -> Arc<Host> {
    Arc::new(Host::new(
        Address::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, ip_last)), 9042),
        dc.to_string(),
        rack.to_string(),
        None,
        tokens.iter().map(|t| t.to_string()).collect(),
        None,
    ))
}

fn snapshot(hosts: Vec<Arc<Host>>) -> ClusterSnapshot {
    ClusterSnapshot {
        token_map: Arc::new(TokenMap::empty(Partitioner::Murmur3)),
        hosts,
    }
}

fn routing(consistency: Consistency) -> RoutingInfo<'static> {
    RoutingInfo {
        keyspace: None,
        token: None,
        consistency,
    }
}

fn last_octet(host: &Host) -> u8 {
    match host.address.ip {
        IpAddr::V4(v4) => v4.octets()[3],
        IpAddr::V6(_) => 0,
    }
}

#[test]
fn plan_never_yields_a_host_twice() {
    let a = host(1, "dc1", "r1", &[]);
    let plan = QueryPlan::new(vec![Arc::clone(&a), Arc::clone(&a), a]);
    assert_eq!(plan.count(), 1);
}

#[test]
fn round_robin_covers_live_hosts() {
    let hosts = vec![
        host(1, "dc1", "r1", &[]),
        host(2, "dc1", "r1", &[]),
        host(3, "dc1", "r1", &[]),
    ];
    hosts[1].set_up(false);
    let cluster = snapshot(hosts);
    let policy = RoundRobinPolicy::new();
    let plan: Vec<u8> = policy
        .query_plan(&routing(Consistency::One), &cluster)
        .map(|h| last_octet(&h))
        .collect();
    assert_eq!(plan.len(), 2);
    assert!(plan.contains(&1));
    assert!(plan.contains(&3));
    assert!(!plan.contains(&2));
}

#[test]
fn round_robin_rotates_between_plans() {
    let cluster = snapshot(vec![
        host(1, "dc1", "r1", &[]),
        host(2, "dc1", "r1", &[]),
        host(3, "dc1", "r1", &[]),
    ]);
    let policy = RoundRobinPolicy::new();
    let first: Vec<u8> = policy
        .query_plan(&routing(Consistency::One), &cluster)
        .map(|h| last_octet(&h))
        .collect();
    let second: Vec<u8> = policy
        .query_plan(&routing(Consistency::One), &cluster)
        .map(|h| last_octet(&h))
        .collect();
    // The next plan starts one host further along the cycle
    assert_eq!(second[0], first[1]);
    assert_eq!(second.len(), 3);
}

#[test]
fn dc_aware_puts_local_dc_first() {
    let cluster = snapshot(vec![
        host(1, "dc1", "r1", &[]),
        host(2, "dc2", "r1", &[]),
        host(3, "dc1", "r1", &[]),
    ]);
    let policy = DcAwarePolicy::new(Some("dc1".to_string()), 1);
    let plan: Vec<u8> = policy
        .query_plan(&routing(Consistency::Quorum), &cluster)
        .map(|h| last_octet(&h))
        .collect();
    assert_eq!(plan.len(), 3);
    assert!(plan[..2].contains(&1));
    assert!(plan[..2].contains(&3));
    assert_eq!(plan[2], 2);
}

#[test]
fn dc_aware_local_consistency_never_leaves_the_dc() {
    let cluster = snapshot(vec![host(1, "dc1", "r1", &[]), host(2, "dc2", "r1", &[])]);
    let policy = DcAwarePolicy::new(Some("dc1".to_string()), 1);
    for consistency in [
        Consistency::LocalOne,
        Consistency::LocalQuorum,
        Consistency::LocalSerial,
    ] {
        let plan: Vec<u8> = policy
            .query_plan(&routing(consistency), &cluster)
            .map(|h| last_octet(&h))
            .collect();
        assert_eq!(plan, vec![1]);
    }
}

#[test]
fn dc_aware_remote_cap() {
    let cluster = snapshot(vec![
        host(1, "dc1", "r1", &[]),
        host(2, "dc2", "r1", &[]),
        host(3, "dc2", "r1", &[]),
        host(4, "dc3", "r1", &[]),
    ]);
    let policy = DcAwarePolicy::new(Some("dc1".to_string()), 1);
    let plan: Vec<u8> = policy
        .query_plan(&routing(Consistency::One), &cluster)
        .map(|h| last_octet(&h))
        .collect();
    // one host per remote DC
    assert_eq!(plan.len(), 3);
    assert_eq!(plan[0], 1);
}

#[test]
fn dc_aware_distance_and_ignore() {
    let local = host(1, "dc1", "r1", &[]);
    let remote = host(2, "dc2", "r1", &[]);
    let with_remote = DcAwarePolicy::new(Some("dc1".to_string()), 1);
    assert_eq!(with_remote.distance(&local), HostDistance::Local);
    assert_eq!(with_remote.distance(&remote), HostDistance::Remote);

    let local_only = DcAwarePolicy::new(Some("dc1".to_string()), 0);
    assert_eq!(local_only.distance(&remote), HostDistance::Ignore);
}

#[test]
fn dc_aware_infers_local_dc_from_contact_host() {
    let contact = host(2, "dc2", "r1", &[]);
    let cluster = snapshot(vec![host(1, "dc1", "r1", &[]), Arc::clone(&contact)]);
    let policy = DcAwarePolicy::new(None, 0);
    policy.init(&contact, &cluster);
    assert_eq!(policy.distance(&contact), HostDistance::Local);
    assert_eq!(policy.distance(&cluster.hosts[0]), HostDistance::Ignore);
}

#[test]
fn rack_aware_orders_rack_then_dc_then_remote() {
    let cluster = snapshot(vec![
        host(1, "dc1", "r1", &[]),
        host(2, "dc1", "r2", &[]),
        host(3, "dc2", "r1", &[]),
    ]);
    let policy = RackAwarePolicy::new(Some("dc1".to_string()), Some("r1".to_string()), 1);
    let plan: Vec<u8> = policy
        .query_plan(&routing(Consistency::One), &cluster)
        .map(|h| last_octet(&h))
        .collect();
    assert_eq!(plan, vec![1, 2, 3]);

    // Local consistency stops at the DC boundary
    let plan: Vec<u8> = policy
        .query_plan(&routing(Consistency::LocalQuorum), &cluster)
        .map(|h| last_octet(&h))
        .collect();
    assert_eq!(plan, vec![1, 2]);
}

#[test]
fn token_aware_puts_replicas_first() {
    let hosts = vec![
        host(1, "dc1", "r1", &[-100]),
        host(2, "dc1", "r1", &[0]),
        host(3, "dc1", "r1", &[100]),
    ];
    let keyspaces = HashMap::from([(
        "ks".to_string(),
        ReplicationStrategy::Simple {
            replication_factor: 2,
        },
    )]);
    let token_map = Arc::new(TokenMap::build(Partitioner::Murmur3, &hosts, keyspaces));
    let cluster = ClusterSnapshot { hosts, token_map };

    let policy = TokenAwarePolicy::new(RoundRobinPolicy::new());
    let routing = RoutingInfo {
        keyspace: Some("ks"),
        token: Some(Token::Murmur3(-50)),
        consistency: Consistency::One,
    };
    let plan: Vec<u8> = policy
        .query_plan(&routing, &cluster)
        .map(|h| last_octet(&h))
        .collect();
    assert_eq!(plan.len(), 3);
    // replicas for token -50 are hosts 2 and 3, in shuffled order
    let mut replicas = plan[..2].to_vec();
    replicas.sort_unstable();
    assert_eq!(replicas, vec![2, 3]);
    assert_eq!(plan[2], 1);
}

#[test]
fn token_aware_without_token_falls_through() {
    let cluster = snapshot(vec![host(1, "dc1", "r1", &[]), host(2, "dc1", "r1", &[])]);
    let policy = TokenAwarePolicy::new(RoundRobinPolicy::new());
    let plan = policy.query_plan(&routing(Consistency::One), &cluster);
    assert_eq!(plan.count(), 2);
}

#[test]
fn token_aware_skips_down_replicas() {
    let hosts = vec![host(1, "dc1", "r1", &[-100]), host(2, "dc1", "r1", &[100])];
    hosts[1].set_up(false);
    let keyspaces = HashMap::from([(
        "ks".to_string(),
        ReplicationStrategy::Simple {
            replication_factor: 2,
        },
    )]);
    let token_map = Arc::new(TokenMap::build(Partitioner::Murmur3, &hosts, keyspaces));
    let cluster = ClusterSnapshot { hosts, token_map };

    let policy = TokenAwarePolicy::new(RoundRobinPolicy::new());
    let routing = RoutingInfo {
        keyspace: Some("ks"),
        token: Some(Token::Murmur3(0)),
        consistency: Consistency::One,
    };
    let plan: Vec<u8> = policy
        .query_plan(&routing, &cluster)
        .map(|h| last_octet(&h))
        .collect();
    assert_eq!(plan, vec![1]);
}
