//! Helpers shared by the unit tests.

use std::net::{IpAddr, Ipv4Addr};

use crate::locator::token_metadata::TokenMetadata;
use crate::locator::topology::{Endpoint, EndpointDcRack, NodeState};
use crate::routing::Token;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// The endpoint `127.0.0.<id>`, for naming test nodes by small numbers.
pub(crate) fn test_endpoint(id: u8) -> Endpoint {
    Endpoint::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, id)))
}

pub(crate) fn dc_rack(datacenter: &str, rack: &str) -> EndpointDcRack {
    EndpointDcRack::new(datacenter, rack)
}

/// A metadata whose ring holds the given members as normal token owners,
/// all in one datacenter and rack.
pub(crate) async fn metadata_with_ring(members: &[(u8, &[i64])]) -> TokenMetadata {
    let mut metadata = TokenMetadata::new();
    for (id, tokens) in members {
        let endpoint = test_endpoint(*id);
        metadata.update_topology(endpoint, dc_rack("dc1", "r1"), Some(NodeState::Normal));
        metadata
            .update_normal_tokens(tokens.iter().map(|t| Token::new(*t)).collect(), endpoint)
            .await
            .unwrap();
    }
    metadata
}
