//! The cluster locator: topology, token-ring metadata, pending ranges
//! and the shared snapshot publisher.

pub mod host_id;
pub mod pending_ranges;
pub mod shared;
pub mod strategy;
pub mod token_metadata;
pub mod topology;


pub use host_id::{HostIdOrEndpoint, HostIdOrEndpointParam};
pub use pending_ranges::PendingEndpoints;
pub use shared::SharedTokenMetadata;
pub use strategy::{NetworkTopologyStrategy, ReplicationStrategy, SimpleStrategy};
pub use token_metadata::TokenMetadata;
pub use topology::{Endpoint, EndpointDcRack, Node, NodeState, Topology};
