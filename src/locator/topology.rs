//! The cluster topology index: endpoints, host ids, datacenter/rack
//! assignments and externally driven node states.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use tokio::task::consume_budget;
use uuid::Uuid;

use crate::errors::TokenMetadataError;
use crate::utils;

/// A network address identifying a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint(IpAddr);

impl Endpoint {
    #[inline]
    pub fn new(ip: IpAddr) -> Self {
        Self(ip)
    }

    #[inline]
    pub fn ip(&self) -> IpAddr {
        self.0
    }
}

impl From<IpAddr> for Endpoint {
    fn from(ip: IpAddr) -> Self {
        Self(ip)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Endpoint {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Endpoint)
    }
}

/// State of a node within the topology.
///
/// The state machine is driven externally; this crate only stores the
/// tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Streaming its part of the ring before becoming a full member.
    Joining,
    /// Serving the slice of the ring that belongs to it.
    Normal,
    /// Executing a leave, streaming its data to the nodes taking over.
    Leaving,
    /// Replacing a dead node; that node's data is streamed to it.
    Replacing,
    /// No longer a member of the cluster.
    Left,
}

/// Datacenter and rack assigned to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDcRack {
    pub datacenter: String,
    pub rack: String,
}

impl EndpointDcRack {
    pub fn new(datacenter: impl Into<String>, rack: impl Into<String>) -> Self {
        Self {
            datacenter: datacenter.into(),
            rack: rack.into(),
        }
    }

    /// Placeholder location for endpoints registered before their real
    /// datacenter and rack are known.
    pub fn default_location() -> Self {
        Self::new("$default_dc", "$default_rack")
    }
}

/// A member of the topology.
#[derive(Debug, Clone)]
pub struct Node {
    endpoint: Endpoint,
    host_id: Option<Uuid>,
    dc_rack: EndpointDcRack,
    state: Option<NodeState>,
}

impl Node {
    #[inline]
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// The cluster-lifetime-unique host id, once one has been bound.
    #[inline]
    pub fn host_id(&self) -> Option<Uuid> {
        self.host_id
    }

    #[inline]
    pub fn dc_rack(&self) -> &EndpointDcRack {
        &self.dc_rack
    }

    #[inline]
    pub fn state(&self) -> Option<NodeState> {
        self.state
    }
}

/// Endpoint <-> host-id index plus the per-endpoint location and state.
#[derive(Debug, Default)]
pub struct Topology {
    nodes: HashMap<Endpoint, Node>,
    nodes_by_host_id: HashMap<Uuid, Endpoint>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `endpoint` or updates its location. A `None` state leaves
    /// any stored state untouched. Host-id bindings are not modified
    /// here; see [`Topology::update_host_id`].
    pub fn add_or_update_endpoint(
        &mut self,
        endpoint: Endpoint,
        dc_rack: EndpointDcRack,
        state: Option<NodeState>,
    ) {
        match self.nodes.entry(endpoint) {
            Entry::Occupied(mut entry) => {
                let node = entry.get_mut();
                node.dc_rack = dc_rack;
                if let Some(state) = state {
                    node.state = Some(state);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Node {
                    endpoint,
                    host_id: None,
                    dc_rack,
                    state,
                });
            }
        }
    }

    /// Binds a host id to an endpoint. Each id is unique and neither side
    /// of the binding may change while the member is alive.
    pub fn update_host_id(
        &mut self,
        host_id: Uuid,
        endpoint: Endpoint,
    ) -> Result<(), TokenMetadataError> {
        if let Some(bound) = self.nodes_by_host_id.get(&host_id) {
            if *bound != endpoint {
                return Err(TokenMetadataError::InvariantViolation(format!(
                    "host id {host_id} is already bound to {bound}, cannot rebind to {endpoint}"
                )));
            }
        }
        if let Some(existing) = self.nodes.get(&endpoint).and_then(|node| node.host_id) {
            if existing != host_id {
                return Err(TokenMetadataError::InvariantViolation(format!(
                    "{endpoint} is already bound to host id {existing}, cannot rebind to {host_id}"
                )));
            }
        }
        self.nodes
            .entry(endpoint)
            .or_insert_with(|| Node {
                endpoint,
                host_id: None,
                dc_rack: EndpointDcRack::default_location(),
                state: None,
            })
            .host_id = Some(host_id);
        self.nodes_by_host_id.insert(host_id, endpoint);
        Ok(())
    }

    pub fn find_node(&self, endpoint: Endpoint) -> Option<&Node> {
        self.nodes.get(&endpoint)
    }

    pub fn find_node_by_host_id(&self, host_id: Uuid) -> Option<&Node> {
        self.nodes_by_host_id
            .get(&host_id)
            .and_then(|endpoint| self.nodes.get(endpoint))
    }

    pub fn has_endpoint(&self, endpoint: Endpoint) -> bool {
        self.nodes.contains_key(&endpoint)
    }

    pub fn nodes_by_endpoint(&self) -> &HashMap<Endpoint, Node> {
        &self.nodes
    }

    /// Removes the endpoint, its host-id binding and its location in one
    /// step.
    pub fn remove_endpoint(&mut self, endpoint: Endpoint) {
        if let Some(node) = self.nodes.remove(&endpoint) {
            if let Some(host_id) = node.host_id {
                self.nodes_by_host_id.remove(&host_id);
            }
        }
    }

    /// Produces an independent copy, yielding between entries.
    pub async fn clone_gently(&self) -> Topology {
        let mut nodes = HashMap::with_capacity(self.nodes.len());
        for (endpoint, node) in &self.nodes {
            nodes.insert(*endpoint, node.clone());
            consume_budget().await;
        }
        let mut nodes_by_host_id = HashMap::with_capacity(self.nodes_by_host_id.len());
        for (host_id, endpoint) in &self.nodes_by_host_id {
            nodes_by_host_id.insert(*host_id, *endpoint);
            consume_budget().await;
        }
        Topology {
            nodes,
            nodes_by_host_id,
        }
    }

    /// Destroys the contents entry by entry to keep the worker
    /// responsive.
    pub async fn clear_gently(&mut self) {
        utils::clear_gently(std::mem::take(&mut self.nodes)).await;
        utils::clear_gently(std::mem::take(&mut self.nodes_by_host_id)).await;
    }
}
