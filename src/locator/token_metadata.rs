//! The token-ring metadata: token ownership, membership transitions in
//! flight and versioned snapshots.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::consume_budget;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::TokenMetadataError;
use crate::locator::host_id::{HostIdOrEndpoint, HostIdOrEndpointParam};
use crate::locator::pending_ranges::{PendingEndpoints, PendingRanges};
use crate::locator::strategy::ReplicationStrategy;
use crate::locator::topology::{Endpoint, EndpointDcRack, NodeState, Topology};
use crate::routing::{Token, TokenBound, TokenRange};
use crate::utils;

/// Process-wide ring version counter. Every mutation that invalidates
/// cached routing draws the next value from here, so committed snapshot
/// versions are strictly increasing across the whole process.
static STATIC_RING_VERSION: AtomicU64 = AtomicU64::new(0);

/// A self-consistent picture of the ring: token ownership, the
/// membership transitions in flight, the topology and the per-keyspace
/// pending ranges, tagged with a monotonic ring version.
///
/// A `TokenMetadata` is mutated only while a single owner holds it; once
/// published through
/// [`SharedTokenMetadata`](crate::locator::shared::SharedTokenMetadata)
/// it is immutable. The type is deliberately not `Clone`: copying a
/// whole ring must go through the yield-friendly
/// [`clone_async`](TokenMetadata::clone_async) family so it never
/// monopolizes a worker.
#[derive(Debug, Default)]
pub struct TokenMetadata {
    /// Each token is associated with exactly one endpoint, but an
    /// endpoint may hold many tokens.
    token_to_endpoint: HashMap<Token, Endpoint>,

    /// The unique set of endpoints appearing in `token_to_endpoint`.
    normal_token_owners: HashSet<Endpoint>,

    bootstrap_tokens: HashMap<Token, Endpoint>,
    leaving_endpoints: HashSet<Endpoint>,
    /// The existing node to be replaced -> the replacing node.
    replacing_endpoints: HashMap<Endpoint, Endpoint>,

    pending_ranges: HashMap<String, PendingRanges>,

    sorted_tokens: Vec<Token>,

    topology: Topology,

    ring_version: u64,
    // Note: when a field is added here, clone_async() must be taught to
    // copy it.
}

impl TokenMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// The tokens of the ring in ascending order.
    pub fn sorted_tokens(&self) -> &[Token] {
        &self.sorted_tokens
    }

    pub fn get_token_to_endpoint(&self) -> &HashMap<Token, Endpoint> {
        &self.token_to_endpoint
    }

    pub fn get_bootstrap_tokens(&self) -> &HashMap<Token, Endpoint> {
        &self.bootstrap_tokens
    }

    pub fn get_leaving_endpoints(&self) -> &HashSet<Endpoint> {
        &self.leaving_endpoints
    }

    pub fn get_replacing_endpoints(&self) -> &HashMap<Endpoint, Endpoint> {
        &self.replacing_endpoints
    }

    pub fn get_topology(&self) -> &Topology {
        &self.topology
    }

    pub fn update_topology(
        &mut self,
        endpoint: Endpoint,
        dc_rack: EndpointDcRack,
        state: Option<NodeState>,
    ) {
        self.topology.add_or_update_endpoint(endpoint, dc_rack, state);
    }

    /// Stores an endpoint to host-id binding. Each id is unique and
    /// cannot be changed after the fact.
    pub fn update_host_id(
        &mut self,
        host_id: Uuid,
        endpoint: Endpoint,
    ) -> Result<(), TokenMetadataError> {
        self.topology.update_host_id(host_id, endpoint)
    }

    /// The unique host id of an endpoint.
    pub fn get_host_id(&self, endpoint: Endpoint) -> Result<Uuid, TokenMetadataError> {
        self.get_host_id_if_known(endpoint)
            .ok_or(TokenMetadataError::EndpointNotFound(endpoint))
    }

    /// The unique host id of an endpoint, or `None` if not found.
    pub fn get_host_id_if_known(&self, endpoint: Endpoint) -> Option<Uuid> {
        self.topology
            .find_node(endpoint)
            .and_then(|node| node.host_id())
    }

    /// The endpoint bound to a unique host id.
    pub fn get_endpoint_for_host_id(&self, host_id: Uuid) -> Option<Endpoint> {
        self.topology
            .find_node_by_host_id(host_id)
            .map(|node| node.endpoint())
    }

    /// A copy of the endpoint-to-id map for read-only operations.
    pub fn get_endpoint_to_host_id_map_for_reading(&self) -> HashMap<Endpoint, Uuid> {
        self.topology
            .nodes_by_endpoint()
            .iter()
            .filter_map(|(endpoint, node)| node.host_id().map(|host_id| (*endpoint, host_id)))
            .collect()
    }

    /// Parses `s` as either a host id or an endpoint address and
    /// resolves the other half from the topology.
    pub fn parse_host_id_and_endpoint(
        &self,
        s: &str,
    ) -> Result<HostIdOrEndpoint, TokenMetadataError> {
        let mut res = HostIdOrEndpoint::parse(s, HostIdOrEndpointParam::AutoDetect)?;
        res.resolve(self)?;
        Ok(res)
    }

    /// Assigns `tokens` as the normal tokens of `endpoint`.
    ///
    /// Tokens previously held by the endpoint but absent from `tokens`
    /// are dropped; tokens mapped to a different endpoint silently
    /// transfer ownership. The endpoint stops being a bootstrapping or
    /// leaving one. The sorted token vector is rebuilt only when a new
    /// token was inserted.
    pub async fn update_normal_tokens(
        &mut self,
        tokens: HashSet<Token>,
        endpoint: Endpoint,
    ) -> Result<(), TokenMetadataError> {
        if tokens.is_empty() {
            return Ok(());
        }

        if !self.topology.has_endpoint(endpoint) {
            return Err(TokenMetadataError::InvariantViolation(format!(
                "{endpoint} must be a member of topology to update normal tokens"
            )));
        }

        let mut tokens = tokens;
        let mut should_sort_tokens = false;

        // Phase 1: erase tokens owned by the endpoint but absent from
        // the new set. Tokens whose ownership does not change need no
        // further update and leave the working set.
        let mut no_longer_owned = Vec::new();
        for (token, owner) in &self.token_to_endpoint {
            consume_budget().await;
            if *owner == endpoint && !tokens.remove(token) {
                no_longer_owned.push(*token);
            }
        }
        for token in no_longer_owned {
            self.token_to_endpoint.remove(&token);
        }

        // Phase 2: the endpoint is no longer pending once it owns normal
        // tokens; install the remaining (new or transferred) tokens.
        self.bootstrap_tokens.retain(|_, ep| *ep != endpoint);
        self.leaving_endpoints.remove(&endpoint);
        self.invalidate_cached_rings();
        for token in tokens {
            consume_budget().await;
            match self.token_to_endpoint.entry(token) {
                Entry::Vacant(entry) => {
                    entry.insert(endpoint);
                    should_sort_tokens = true;
                }
                Entry::Occupied(mut entry) => {
                    if *entry.get() != endpoint {
                        debug!(
                            "Token {} changing ownership from {} to {}",
                            token,
                            entry.get(),
                            endpoint
                        );
                        entry.insert(endpoint);
                    }
                }
            }
        }

        self.update_normal_token_owners().await;

        if should_sort_tokens {
            self.sort_tokens();
        }
        Ok(())
    }

    pub(crate) fn sort_tokens(&mut self) {
        let mut sorted: Vec<Token> = self.token_to_endpoint.keys().copied().collect();
        sorted.sort_unstable();
        self.sorted_tokens = sorted;
    }

    async fn update_normal_token_owners(&mut self) {
        let mut owners = HashSet::new();
        for endpoint in self.token_to_endpoint.values() {
            owners.insert(*endpoint);
            consume_budget().await;
        }
        self.normal_token_owners = owners;
    }

    /// The index into the sorted tokens of the first token `>= start`,
    /// wrapping to the least token when `start` exceeds them all.
    pub fn first_token_index(&self, start: Token) -> Result<usize, TokenMetadataError> {
        if self.sorted_tokens.is_empty() {
            return Err(TokenMetadataError::EmptyRing);
        }
        let idx = self.sorted_tokens.partition_point(|token| *token < start);
        Ok(if idx == self.sorted_tokens.len() { 0 } else { idx })
    }

    /// The first token `>= start`, wrapping to the least token when
    /// `start` exceeds them all.
    pub fn first_token(&self, start: Token) -> Result<Token, TokenMetadataError> {
        Ok(self.sorted_tokens[self.first_token_index(start)?])
    }

    /// The endpoint owning `token` as a normal token.
    pub fn get_endpoint(&self, token: Token) -> Option<Endpoint> {
        self.token_to_endpoint.get(&token).copied()
    }

    /// All normal tokens owned by `endpoint`, in ascending order.
    pub fn get_tokens(&self, endpoint: Endpoint) -> Vec<Token> {
        let mut tokens: Vec<Token> = self
            .token_to_endpoint
            .iter()
            .filter_map(|(token, owner)| (*owner == endpoint).then_some(*token))
            .collect();
        tokens.sort_unstable();
        tokens
    }

    /// Walks the ring starting at the first token `>= start`, visiting
    /// every token exactly once with wrap-around.
    pub fn ring_range(&self, start: Token) -> impl Iterator<Item = Token> + '_ {
        let idx = self.sorted_tokens.partition_point(|token| *token < start);
        self.sorted_tokens[idx..]
            .iter()
            .chain(self.sorted_tokens.iter())
            .take(self.sorted_tokens.len())
            .copied()
    }

    /// Like [`TokenMetadata::ring_range`], starting from an optional
    /// bound: `None` walks from the minimum token, and an exclusive
    /// bound drops the equal start token.
    pub fn ring_range_from(&self, start: Option<TokenBound>) -> impl Iterator<Item = Token> + '_ {
        let bound = start.unwrap_or_else(|| TokenBound::inclusive(Token::minimum()));
        let len = self.sorted_tokens.len();
        let idx = self
            .sorted_tokens
            .partition_point(|token| *token < bound.value);
        let first = (len > 0).then(|| self.sorted_tokens[idx % len]);
        let skip = usize::from(!bound.inclusive && first == Some(bound.value));
        self.sorted_tokens[idx..]
            .iter()
            .chain(self.sorted_tokens.iter())
            .take(len)
            .skip(skip)
            .copied()
    }

    /// The token immediately preceding `t` on the ring, wrapping from
    /// the least token to the greatest.
    pub fn get_predecessor(&self, token: Token) -> Result<Token, TokenMetadataError> {
        let idx = self.sorted_tokens.partition_point(|t| *t < token);
        if self.sorted_tokens.get(idx) != Some(&token) {
            return Err(TokenMetadataError::TokenNotFound(token));
        }
        let len = self.sorted_tokens.len();
        Ok(self.sorted_tokens[(idx + len - 1) % len])
    }

    /// For every token in `tokens`, the half-open circular range
    /// `(predecessor(token), token]`; a wrapping range is expanded into
    /// two non-wrapping ones.
    pub fn get_primary_ranges_for(
        &self,
        tokens: impl IntoIterator<Item = Token>,
    ) -> Result<Vec<TokenRange>, TokenMetadataError> {
        let tokens = tokens.into_iter();
        // One of the ranges may wrap.
        let mut ranges = Vec::with_capacity(tokens.size_hint().0 + 1);
        for right in tokens {
            let left = self.get_predecessor(right)?;
            ranges.extend(TokenRange::expand_arc(left, right));
        }
        Ok(ranges)
    }

    /// Registers a single bootstrap token of a joining endpoint.
    pub fn add_bootstrap_token(
        &mut self,
        token: Token,
        endpoint: Endpoint,
    ) -> Result<(), TokenMetadataError> {
        self.add_bootstrap_tokens(HashSet::from([token]), endpoint)
    }

    /// Registers `tokens` as the bootstrap tokens of a joining endpoint.
    /// Any bootstrap tokens the endpoint held before are dropped first.
    pub fn add_bootstrap_tokens(
        &mut self,
        tokens: HashSet<Token>,
        endpoint: Endpoint,
    ) -> Result<(), TokenMetadataError> {
        for token in &tokens {
            if let Some(existing) = self.bootstrap_tokens.get(token) {
                if *existing != endpoint {
                    return Err(TokenMetadataError::BootstrapTokenCollision {
                        token: *token,
                        existing: *existing,
                        requested: endpoint,
                    });
                }
            }
            if let Some(existing) = self.token_to_endpoint.get(token) {
                if *existing != endpoint {
                    return Err(TokenMetadataError::BootstrapTokenCollision {
                        token: *token,
                        existing: *existing,
                        requested: endpoint,
                    });
                }
            }
        }

        self.bootstrap_tokens.retain(|_, ep| *ep != endpoint);
        for token in tokens {
            self.bootstrap_tokens.insert(token, endpoint);
        }
        Ok(())
    }

    pub fn remove_bootstrap_tokens(&mut self, tokens: HashSet<Token>) {
        if tokens.is_empty() {
            warn!("tokens is empty in remove_bootstrap_tokens!");
            return;
        }
        for token in tokens {
            self.bootstrap_tokens.remove(&token);
        }
    }

    pub fn add_leaving_endpoint(&mut self, endpoint: Endpoint) {
        self.leaving_endpoints.insert(endpoint);
    }

    pub fn del_leaving_endpoint(&mut self, endpoint: Endpoint) {
        self.leaving_endpoints.remove(&endpoint);
    }

    /// Records that `replacing_node` replaces `existing_node`,
    /// overwriting any prior pairing for `existing_node`.
    pub fn add_replacing_endpoint(&mut self, existing_node: Endpoint, replacing_node: Endpoint) {
        info!(
            "Added node {} as pending replacing endpoint which replaces existing node {}",
            replacing_node, existing_node
        );
        self.replacing_endpoints.insert(existing_node, replacing_node);
    }

    pub fn del_replacing_endpoint(&mut self, existing_node: Endpoint) {
        if let Some(replacing_node) = self.replacing_endpoints.remove(&existing_node) {
            info!(
                "Removed node {} as pending replacing endpoint which replaces existing node {}",
                replacing_node, existing_node
            );
        }
    }

    /// Erases every trace of the endpoint: its normal and bootstrap
    /// tokens, its transition-set entries and its topology record.
    pub fn remove_endpoint(&mut self, endpoint: Endpoint) {
        self.remove_endpoint_unsorted(endpoint);
        self.sort_tokens();
    }

    /// Same as [`TokenMetadata::remove_endpoint`] but leaves the sorted
    /// token vector stale; the enclosing multi-step mutation sorts once
    /// at the end.
    pub(crate) fn remove_endpoint_unsorted(&mut self, endpoint: Endpoint) {
        self.bootstrap_tokens.retain(|_, ep| *ep != endpoint);
        self.token_to_endpoint.retain(|_, ep| *ep != endpoint);
        self.normal_token_owners.remove(&endpoint);
        self.topology.remove_endpoint(endpoint);
        self.leaving_endpoints.remove(&endpoint);
        self.del_replacing_endpoint(endpoint);
        self.invalidate_cached_rings();
    }

    pub fn is_normal_token_owner(&self, endpoint: Endpoint) -> bool {
        self.normal_token_owners.contains(&endpoint)
    }

    pub fn is_leaving(&self, endpoint: Endpoint) -> bool {
        self.leaving_endpoints.contains(&endpoint)
    }

    /// Whether this node is being replaced by another node.
    pub fn is_being_replaced(&self, endpoint: Endpoint) -> bool {
        self.replacing_endpoints.contains_key(&endpoint)
    }

    /// Whether any node is being replaced by another node.
    pub fn is_any_node_being_replaced(&self) -> bool {
        !self.replacing_endpoints.is_empty()
    }

    /// Endpoints that are full members of the ring. A node still
    /// streaming its bootstrap data is not included.
    pub fn normal_token_owners(&self) -> &HashSet<Endpoint> {
        &self.normal_token_owners
    }

    /// The number of different endpoints that own tokens in the ring.
    /// Bootstrapping tokens are not taken into account.
    pub fn count_normal_token_owners(&self) -> usize {
        self.normal_token_owners.len()
    }

    /// Endpoint -> owned tokens, a copy for read-only consumers.
    pub fn get_endpoint_to_token_map_for_reading(&self) -> BTreeMap<Endpoint, Vec<Token>> {
        let mut map: BTreeMap<Endpoint, Vec<Token>> = BTreeMap::new();
        for (token, endpoint) in &self.token_to_endpoint {
            map.entry(*endpoint).or_default().push(*token);
        }
        for tokens in map.values_mut() {
            tokens.sort_unstable();
        }
        map
    }

    /// A stable token -> endpoint map covering both the normal and the
    /// bootstrapping nodes.
    pub fn get_normal_and_bootstrapping_token_to_endpoint_map(&self) -> BTreeMap<Token, Endpoint> {
        let mut map: BTreeMap<Token, Endpoint> = self
            .token_to_endpoint
            .iter()
            .map(|(token, endpoint)| (*token, *endpoint))
            .collect();
        for (token, endpoint) in &self.bootstrap_tokens {
            map.entry(*token).or_insert(*endpoint);
        }
        map
    }

    /// A full asynchronous copy, yielding between the entries of every
    /// large container.
    pub async fn clone_async(&self) -> TokenMetadata {
        let mut ret = self.clone_only_token_map(true).await;
        ret.bootstrap_tokens.reserve(self.bootstrap_tokens.len());
        for (token, endpoint) in &self.bootstrap_tokens {
            ret.bootstrap_tokens.insert(*token, *endpoint);
            consume_budget().await;
        }
        ret.leaving_endpoints = self.leaving_endpoints.clone();
        ret.replacing_endpoints = self.replacing_endpoints.clone();
        for (keyspace, ranges) in &self.pending_ranges {
            ret.pending_ranges.insert(keyspace.clone(), ranges.clone());
            consume_budget().await;
        }
        ret.ring_version = self.ring_version;
        ret
    }

    /// A copy holding only the token map, the owner set and the
    /// topology; pending ranges, bootstrap tokens and leaving endpoints
    /// are not included.
    pub async fn clone_only_token_map(&self, clone_sorted_tokens: bool) -> TokenMetadata {
        let mut token_to_endpoint = HashMap::with_capacity(self.token_to_endpoint.len());
        for (token, endpoint) in &self.token_to_endpoint {
            token_to_endpoint.insert(*token, *endpoint);
            consume_budget().await;
        }
        let mut ret = TokenMetadata {
            token_to_endpoint,
            normal_token_owners: self.normal_token_owners.clone(),
            topology: self.topology.clone_gently().await,
            ..TokenMetadata::default()
        };
        if clone_sorted_tokens {
            ret.sorted_tokens = self.sorted_tokens.clone();
        }
        ret
    }

    /// A copy reflecting the ring after every in-flight leave operation
    /// has finished.
    pub async fn clone_after_all_left(&self) -> TokenMetadata {
        let mut all_left_metadata = self.clone_only_token_map(false).await;
        for endpoint in &self.leaving_endpoints {
            all_left_metadata.remove_endpoint_unsorted(*endpoint);
        }
        all_left_metadata.sort_tokens();
        all_left_metadata
    }

    /// Destroys the contents entry by entry to keep the worker
    /// responsive while dropping a large ring.
    pub async fn clear_gently(&mut self) {
        utils::clear_gently(std::mem::take(&mut self.token_to_endpoint)).await;
        utils::clear_gently(std::mem::take(&mut self.normal_token_owners)).await;
        utils::clear_gently(std::mem::take(&mut self.bootstrap_tokens)).await;
        utils::clear_gently(std::mem::take(&mut self.leaving_endpoints)).await;
        utils::clear_gently(std::mem::take(&mut self.replacing_endpoints)).await;
        utils::clear_gently(std::mem::take(&mut self.pending_ranges)).await;
        utils::clear_gently(std::mem::take(&mut self.sorted_tokens)).await;
        self.topology.clear_gently().await;
    }

    pub fn get_ring_version(&self) -> u64 {
        self.ring_version
    }

    /// Draws the next process-wide version so that caches keyed on the
    /// ring version notice the mutation.
    pub fn invalidate_cached_rings(&mut self) {
        self.ring_version = STATIC_RING_VERSION.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("ring_version={}", self.ring_version);
    }

    /// Recomputes the pending ranges of `keyspace_name` from the current
    /// transitions. Reasoning:
    ///
    /// 1. When in doubt it is better to write too much to a node than
    ///    too little, so each contribution computes the biggest ranges a
    ///    node could end up with; unneeded data is cleaned up afterwards.
    /// 2. A leave only grows other nodes' ranges, so all leaving tokens
    ///    are removed at once and the drained ring is compared against
    ///    the current one.
    /// 3. A bootstrap only shrinks other nodes' ranges, so bootstrapping
    ///    nodes are added and removed one by one on top of the drained
    ///    ring and their ranges recorded in between.
    ///
    /// This is a heavy operation - it clones the ring and invokes the
    /// strategy once per affected range - but it runs only when a node
    /// changes state in the cluster, and it yields throughout.
    pub async fn update_pending_ranges<F>(
        &mut self,
        strategy: &dyn ReplicationStrategy,
        keyspace_name: &str,
        get_dc_rack: F,
    ) -> Result<(), TokenMetadataError>
    where
        F: Fn(Endpoint) -> EndpointDcRack,
    {
        debug!(
            "calculate_pending_ranges: keyspace_name={}, bootstrap_tokens={:?}, leaving nodes={:?}, replacing_endpoints={:?}",
            keyspace_name, self.bootstrap_tokens, self.leaving_endpoints, self.replacing_endpoints
        );
        if self.bootstrap_tokens.is_empty()
            && self.leaving_endpoints.is_empty()
            && self.replacing_endpoints.is_empty()
        {
            debug!(
                "No bootstrapping, leaving nodes, replacing nodes -> empty pending ranges for {}",
                keyspace_name
            );
            return self.set_pending_ranges(keyspace_name, Vec::new()).await;
        }

        let mut new_pending_ranges: Vec<(TokenRange, Endpoint)> = Vec::new();
        self.calculate_pending_ranges_for_replacing(strategy, &mut new_pending_ranges)
            .await;
        // A ring reflecting the situation after all leave operations
        // have finished.
        let mut all_left_metadata = self.clone_after_all_left().await;
        self.calculate_pending_ranges_for_leaving(
            strategy,
            &mut new_pending_ranges,
            &all_left_metadata,
        )
        .await;
        // At this stage new_pending_ranges reflects the leave
        // operations; continue with the bootstrapping nodes.
        self.calculate_pending_ranges_for_bootstrap(
            strategy,
            &mut new_pending_ranges,
            &mut all_left_metadata,
            &get_dc_rack,
        )
        .await?;
        all_left_metadata.clear_gently().await;

        self.set_pending_ranges(keyspace_name, new_pending_ranges)
            .await
    }

    /// Every range owned by a replaced node becomes a pending range of
    /// its replacement, verbatim.
    async fn calculate_pending_ranges_for_replacing(
        &self,
        strategy: &dyn ReplicationStrategy,
        new_pending_ranges: &mut Vec<(TokenRange, Endpoint)>,
    ) {
        if self.replacing_endpoints.is_empty() {
            return;
        }
        for (existing_node, replacing_node) in &self.replacing_endpoints {
            for range in strategy.get_ranges(*existing_node, self).await {
                consume_budget().await;
                debug!(
                    "Node {} replaces {} for range {:?}",
                    replacing_node, existing_node, range
                );
                new_pending_ranges.push((range, *replacing_node));
            }
        }
    }

    async fn calculate_pending_ranges_for_leaving(
        &self,
        strategy: &dyn ReplicationStrategy,
        new_pending_ranges: &mut Vec<(TokenRange, Endpoint)>,
        all_left_metadata: &TokenMetadata,
    ) {
        if self.leaving_endpoints.is_empty() {
            return;
        }
        // All ranges that will be affected by the leaving nodes.
        let mut affected_ranges: HashSet<TokenRange> = HashSet::new();
        for endpoint in &self.leaving_endpoints {
            for range in strategy.get_ranges(*endpoint, self).await {
                affected_ranges.insert(range);
            }
        }
        // For each of those ranges, the nodes that become responsible
        // once all leaving nodes are gone.
        let mut metadata = self.clone_only_token_map(true).await;
        debug!(
            "In calculate_pending_ranges: affected_ranges.size={} starts",
            affected_ranges.len()
        );
        for range in &affected_ranges {
            let token = range.end_token();
            let current_endpoints = strategy.calculate_natural_endpoints(token, &metadata).await;
            let new_endpoints = strategy
                .calculate_natural_endpoints(token, all_left_metadata)
                .await;
            for endpoint in new_endpoints {
                if !current_endpoints.contains(&endpoint) {
                    new_pending_ranges.push((*range, endpoint));
                }
            }
            consume_budget().await;
        }
        metadata.clear_gently().await;
        debug!(
            "In calculate_pending_ranges: affected_ranges.size={} ends",
            affected_ranges.len()
        );
    }

    /// Bootstrapping nodes are added and removed one by one on the
    /// all-left ring, in ascending endpoint order, recording in between
    /// what their ranges would be.
    async fn calculate_pending_ranges_for_bootstrap<F>(
        &self,
        strategy: &dyn ReplicationStrategy,
        new_pending_ranges: &mut Vec<(TokenRange, Endpoint)>,
        all_left_metadata: &mut TokenMetadata,
        get_dc_rack: &F,
    ) -> Result<(), TokenMetadataError>
    where
        F: Fn(Endpoint) -> EndpointDcRack,
    {
        let mut bootstrap_addresses: BTreeMap<Endpoint, HashSet<Token>> = BTreeMap::new();
        for (token, endpoint) in &self.bootstrap_tokens {
            bootstrap_addresses.entry(*endpoint).or_default().insert(*token);
        }

        for (endpoint, tokens) in bootstrap_addresses {
            all_left_metadata.update_topology(
                endpoint,
                get_dc_rack(endpoint),
                Some(NodeState::Joining),
            );
            all_left_metadata.update_normal_tokens(tokens, endpoint).await?;
            for range in strategy.get_ranges(endpoint, all_left_metadata).await {
                new_pending_ranges.push((range, endpoint));
            }
            all_left_metadata.remove_endpoint_unsorted(endpoint);
            consume_budget().await;
        }
        all_left_metadata.sort_tokens();
        Ok(())
    }

    /// Compacts the multimap into the keyspace's interval map. An empty
    /// result deletes the keyspace entry entirely.
    async fn set_pending_ranges(
        &mut self,
        keyspace_name: &str,
        new_pending_ranges: Vec<(TokenRange, Endpoint)>,
    ) -> Result<(), TokenMetadataError> {
        if new_pending_ranges.is_empty() {
            self.pending_ranges.remove(keyspace_name);
            return Ok(());
        }
        let mut seen: HashSet<Endpoint> = HashSet::new();
        for (_, endpoint) in &new_pending_ranges {
            consume_budget().await;
            if seen.insert(*endpoint) && !self.topology.has_endpoint(*endpoint) {
                return Err(TokenMetadataError::InvariantViolation(format!(
                    "{endpoint} must be member or pending to set pending ranges"
                )));
            }
        }
        let map = PendingRanges::build(new_pending_ranges).await;
        self.pending_ranges.insert(keyspace_name.to_owned(), map);
        Ok(())
    }

    /// Endpoints that will own `token` in `keyspace_name` once the
    /// in-flight transitions complete. Empty when the keyspace has no
    /// pending ranges.
    pub fn pending_endpoints_for(&self, token: Token, keyspace_name: &str) -> PendingEndpoints {
        match self.pending_ranges.get(keyspace_name) {
            Some(ks_map) => ks_map.endpoints_for(token),
            None => PendingEndpoints::new(),
        }
    }

    /// Whether `endpoint` appears in any pending range of the keyspace.
    pub fn has_pending_ranges(&self, keyspace_name: &str, endpoint: Endpoint) -> bool {
        self.pending_ranges
            .get(keyspace_name)
            .is_some_and(|ks_map| ks_map.contains_endpoint(endpoint))
    }
}
