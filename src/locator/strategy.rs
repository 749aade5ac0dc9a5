//! The replica-placement seam consumed by the pending-range engine.

use std::cmp;
use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use itertools::Itertools;

use crate::locator::token_metadata::TokenMetadata;
use crate::locator::topology::Endpoint;
use crate::routing::{Token, TokenRange};

/// Replica placement under a given ring snapshot.
///
/// Both operations may suspend; the pending-range engine invokes them
/// once per affected range.
#[async_trait]
pub trait ReplicationStrategy: Send + Sync {
    /// The endpoints that replicate `token` under `metadata`.
    async fn calculate_natural_endpoints(
        &self,
        token: Token,
        metadata: &TokenMetadata,
    ) -> HashSet<Endpoint>;

    /// The token ranges `endpoint` owns under `metadata`: every primary
    /// arc whose natural endpoints include it, wrap-around arcs
    /// expanded.
    async fn get_ranges(&self, endpoint: Endpoint, metadata: &TokenMetadata) -> Vec<TokenRange> {
        let sorted_tokens = metadata.sorted_tokens();
        let mut ranges = Vec::new();
        for (i, right) in sorted_tokens.iter().enumerate() {
            let replicas = self.calculate_natural_endpoints(*right, metadata).await;
            if replicas.contains(&endpoint) {
                let left = sorted_tokens[(i + sorted_tokens.len() - 1) % sorted_tokens.len()];
                ranges.extend(TokenRange::expand_arc(left, *right));
            }
        }
        ranges
    }
}

/// Places replicas on consecutive distinct ring members, ignoring the
/// topology. Use only for a single datacenter and one rack.
#[derive(Debug, Clone)]
pub struct SimpleStrategy {
    /// How many replicas of each piece of data there are.
    pub replication_factor: usize,
}

#[async_trait]
impl ReplicationStrategy for SimpleStrategy {
    async fn calculate_natural_endpoints(
        &self,
        token: Token,
        metadata: &TokenMetadata,
    ) -> HashSet<Endpoint> {
        let num_to_take = cmp::min(
            self.replication_factor,
            metadata.count_normal_token_owners(),
        );
        metadata
            .ring_range(token)
            .filter_map(|t| metadata.get_endpoint(t))
            .unique()
            .take(num_to_take)
            .collect()
    }
}

/// Places `datacenter_repfactors[dc]` replicas in each datacenter by
/// walking the ring clockwise until reaching the first node in another
/// rack; replicas land on distinct racks because nodes in the same rack
/// often fail together.
#[derive(Debug, Clone)]
pub struct NetworkTopologyStrategy {
    /// Replication factors of datacenters with given names.
    pub datacenter_repfactors: HashMap<String, usize>,
}

#[async_trait]
impl ReplicationStrategy for NetworkTopologyStrategy {
    async fn calculate_natural_endpoints(
        &self,
        token: Token,
        metadata: &TokenMetadata,
    ) -> HashSet<Endpoint> {
        let mut result = HashSet::new();
        for (datacenter, replication_factor) in &self.datacenter_repfactors {
            result.extend(natural_endpoints_in_dc(
                metadata,
                token,
                datacenter,
                *replication_factor,
            ));
        }
        result
    }
}

/// Walks the ring restricted to one datacenter, preferring nodes on
/// racks that do not hold a replica yet; once every rack of the
/// datacenter is used, up to `rf - rack_count` repeats are acceptable.
fn natural_endpoints_in_dc(
    metadata: &TokenMetadata,
    token: Token,
    datacenter: &str,
    replication_factor: usize,
) -> Vec<Endpoint> {
    let topology = metadata.get_topology();
    let dc_endpoints: Vec<Endpoint> = metadata
        .ring_range(token)
        .filter_map(|t| metadata.get_endpoint(t))
        .filter(|endpoint| {
            topology
                .find_node(*endpoint)
                .is_some_and(|node| node.dc_rack().datacenter == datacenter)
        })
        .unique()
        .collect();

    let rack_count = dc_endpoints
        .iter()
        .filter_map(|endpoint| topology.find_node(*endpoint))
        .map(|node| node.dc_rack().rack.as_str())
        .unique()
        .count();

    let num_to_take = cmp::min(replication_factor, dc_endpoints.len());
    let mut acceptable_repeats = replication_factor.saturating_sub(rack_count);
    let mut used_racks: BTreeSet<&str> = BTreeSet::new();
    let mut replicas = Vec::with_capacity(num_to_take);

    for endpoint in &dc_endpoints {
        if replicas.len() == num_to_take {
            break;
        }
        let Some(node) = topology.find_node(*endpoint) else {
            continue;
        };
        let rack = node.dc_rack().rack.as_str();
        if !used_racks.contains(rack) {
            used_racks.insert(rack);
            replicas.push(*endpoint);
        } else if acceptable_repeats > 0 {
            // The rack already holds a replica but repeats are still
            // acceptable.
            acceptable_repeats -= 1;
            replicas.push(*endpoint);
        }
    }

    replicas
}
