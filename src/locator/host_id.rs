//! Parsing of user-supplied node identifiers.

use uuid::Uuid;

use crate::errors::{HostIdOrEndpointParseError, TokenMetadataError};
use crate::locator::token_metadata::TokenMetadata;
use crate::locator::topology::Endpoint;

/// How a node-identifier string is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostIdOrEndpointParam {
    HostId,
    Endpoint,
    #[default]
    AutoDetect,
}

/// A node identified by host id, by endpoint address, or by both once
/// resolved against the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdOrEndpoint {
    pub host_id: Option<Uuid>,
    pub endpoint: Option<Endpoint>,
}

impl HostIdOrEndpoint {
    /// Parses `s` under the given restriction. `AutoDetect` attempts a
    /// host id first and falls back to an endpoint address.
    pub fn parse(
        s: &str,
        param: HostIdOrEndpointParam,
    ) -> Result<Self, HostIdOrEndpointParseError> {
        match param {
            HostIdOrEndpointParam::HostId => {
                let host_id = s.parse::<Uuid>().map_err(|err| {
                    HostIdOrEndpointParseError::InvalidHostId {
                        string: s.to_owned(),
                        err,
                    }
                })?;
                Ok(Self {
                    host_id: Some(host_id),
                    endpoint: None,
                })
            }
            HostIdOrEndpointParam::Endpoint => {
                let endpoint = s.parse::<Endpoint>().map_err(|err| {
                    HostIdOrEndpointParseError::InvalidEndpoint {
                        string: s.to_owned(),
                        err,
                    }
                })?;
                Ok(Self {
                    host_id: None,
                    endpoint: Some(endpoint),
                })
            }
            HostIdOrEndpointParam::AutoDetect => {
                if let Ok(host_id) = s.parse::<Uuid>() {
                    return Ok(Self {
                        host_id: Some(host_id),
                        endpoint: None,
                    });
                }
                match s.parse::<Endpoint>() {
                    Ok(endpoint) => Ok(Self {
                        host_id: None,
                        endpoint: Some(endpoint),
                    }),
                    Err(_) => Err(HostIdOrEndpointParseError::Unrecognized(s.to_owned())),
                }
            }
        }
    }

    /// Looks the missing half up in the cluster topology.
    pub fn resolve(&mut self, metadata: &TokenMetadata) -> Result<(), TokenMetadataError> {
        if let Some(host_id) = self.host_id {
            self.endpoint = Some(
                metadata
                    .get_endpoint_for_host_id(host_id)
                    .ok_or(TokenMetadataError::HostIdNotFound(host_id))?,
            );
        } else if let Some(endpoint) = self.endpoint {
            self.host_id = Some(
                metadata
                    .get_host_id_if_known(endpoint)
                    .ok_or(TokenMetadataError::EndpointNotFound(endpoint))?,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use uuid::Uuid;

    use super::{HostIdOrEndpoint, HostIdOrEndpointParam};
    use crate::errors::{HostIdOrEndpointParseError, TokenMetadataError};
    use crate::locator::token_metadata::TokenMetadata;
    use crate::locator::topology::NodeState;
    use crate::test_utils::{dc_rack, setup_tracing, test_endpoint};

    #[test]
    fn parses_host_id_and_endpoint_literals() {
        setup_tracing();
        let id = Uuid::new_v4();

        let parsed =
            HostIdOrEndpoint::parse(&id.to_string(), HostIdOrEndpointParam::HostId).unwrap();
        assert_eq!(parsed.host_id, Some(id));
        assert_eq!(parsed.endpoint, None);

        let parsed =
            HostIdOrEndpoint::parse("127.0.0.5", HostIdOrEndpointParam::Endpoint).unwrap();
        assert_eq!(parsed.endpoint, Some(test_endpoint(5)));
        assert_eq!(parsed.host_id, None);
    }

    #[test]
    fn auto_detect_prefers_host_ids() {
        setup_tracing();
        let id = Uuid::new_v4();
        let parsed =
            HostIdOrEndpoint::parse(&id.to_string(), HostIdOrEndpointParam::AutoDetect).unwrap();
        assert_eq!(parsed.host_id, Some(id));

        let parsed =
            HostIdOrEndpoint::parse("127.0.0.5", HostIdOrEndpointParam::AutoDetect).unwrap();
        assert_eq!(parsed.endpoint, Some(test_endpoint(5)));
    }

    #[test]
    fn rejects_garbage() {
        setup_tracing();
        assert_matches!(
            HostIdOrEndpoint::parse("not-a-node", HostIdOrEndpointParam::HostId),
            Err(HostIdOrEndpointParseError::InvalidHostId { .. })
        );
        assert_matches!(
            HostIdOrEndpoint::parse("not-a-node", HostIdOrEndpointParam::Endpoint),
            Err(HostIdOrEndpointParseError::InvalidEndpoint { .. })
        );
        assert_matches!(
            HostIdOrEndpoint::parse("not-a-node", HostIdOrEndpointParam::AutoDetect),
            Err(HostIdOrEndpointParseError::Unrecognized(_))
        );
    }

    #[test]
    fn resolve_fills_the_missing_half() {
        setup_tracing();
        let mut metadata = TokenMetadata::new();
        let endpoint = test_endpoint(1);
        let id = Uuid::new_v4();
        metadata.update_topology(endpoint, dc_rack("dc1", "r1"), Some(NodeState::Normal));
        metadata.update_host_id(id, endpoint).unwrap();

        let mut parsed =
            HostIdOrEndpoint::parse(&id.to_string(), HostIdOrEndpointParam::AutoDetect).unwrap();
        parsed.resolve(&metadata).unwrap();
        assert_eq!(parsed.endpoint, Some(endpoint));

        let mut parsed =
            HostIdOrEndpoint::parse("127.0.0.1", HostIdOrEndpointParam::AutoDetect).unwrap();
        parsed.resolve(&metadata).unwrap();
        assert_eq!(parsed.host_id, Some(id));
    }

    #[test]
    fn resolve_fails_for_unknown_nodes() {
        setup_tracing();
        let metadata = TokenMetadata::new();

        let mut parsed =
            HostIdOrEndpoint::parse(&Uuid::new_v4().to_string(), HostIdOrEndpointParam::AutoDetect)
                .unwrap();
        assert_matches!(
            parsed.resolve(&metadata),
            Err(TokenMetadataError::HostIdNotFound(_))
        );

        let mut parsed =
            HostIdOrEndpoint::parse("127.0.0.9", HostIdOrEndpointParam::AutoDetect).unwrap();
        assert_matches!(
            parsed.resolve(&metadata),
            Err(TokenMetadataError::EndpointNotFound(_))
        );
    }
}
