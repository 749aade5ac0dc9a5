//! Errors surfaced by the token-ring metadata core.

use thiserror::Error;
use uuid::Uuid;

use crate::locator::topology::Endpoint;
use crate::routing::Token;

/// Error produced by operations on
/// [`TokenMetadata`](crate::locator::token_metadata::TokenMetadata) and its
/// shared publisher.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TokenMetadataError {
    /// An internal invariant of the metadata was about to be broken:
    /// tokens assigned to an endpoint missing from the topology, a
    /// non-increasing ring version published, or a conflicting host-id
    /// binding. Not recoverable by this crate; callers should treat it
    /// as fatal.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    /// The same token was requested as a bootstrap token of two distinct
    /// endpoints, or is already a normal token of another endpoint.
    #[error("bootstrap token collision between {existing} and {requested} (token {token})")]
    BootstrapTokenCollision {
        token: Token,
        existing: Endpoint,
        requested: Endpoint,
    },

    /// The operation requires a non-empty ring.
    #[error("sorted tokens are empty")]
    EmptyRing,

    /// The token is not present in the ring.
    #[error("token {0} not found in the ring")]
    TokenNotFound(Token),

    /// The host id is not known to the cluster.
    #[error("host id {0} not found in the cluster")]
    HostIdNotFound(Uuid),

    /// The endpoint is not known to the cluster.
    #[error("endpoint {0} not found in the cluster")]
    EndpointNotFound(Endpoint),

    /// A user-supplied node identifier could not be parsed.
    #[error(transparent)]
    InvalidNodeIdentifier(#[from] HostIdOrEndpointParseError),
}

/// Error parsing a string that should identify a node either by host id
/// or by endpoint address.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum HostIdOrEndpointParseError {
    #[error("invalid host id {string}: {err}")]
    InvalidHostId {
        string: String,
        #[source]
        err: uuid::Error,
    },

    #[error("invalid endpoint address {string}: {err}")]
    InvalidEndpoint {
        string: String,
        #[source]
        err: std::net::AddrParseError,
    },

    #[error("{0} is neither a valid host id nor an endpoint address")]
    Unrecognized(String),
}
