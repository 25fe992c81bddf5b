//! Agent metadata interceptor for outgoing gRPC calls.

use tonic::metadata::{Ascii, MetadataValue};
use tonic::{Request, Status};

use kvmd_cloud_proto::metadata;

use super::error::LinkError;
use super::types::{AgentIdentity, LinkRole};

/// Attaches the agent credentials and identity to every call and stream.
///
/// Values are validated once when the link is built, so the interceptor
/// itself never fails.
#[derive(Debug, Clone)]
pub struct AgentMetadata {
    entries: Vec<(&'static str, MetadataValue<Ascii>)>,
}

impl AgentMetadata {
    pub fn new(identity: &AgentIdentity, role: LinkRole) -> Result<Self, LinkError> {
        let authorization = format!("{}{}", metadata::BEARER_PREFIX, identity.auth_token);
        let entries = [
            (metadata::AUTHORIZATION, authorization.as_str()),
            (metadata::AGENT_UUID, identity.instance_uuid.as_str()),
            (metadata::AGENT_NAME, identity.name.as_str()),
            (metadata::VERSION, identity.version.as_str()),
            (metadata::LINK_ROLE, role.as_str()),
        ]
        .into_iter()
        .map(|(key, value)| {
            MetadataValue::try_from(value)
                .map(|value| (key, value))
                .map_err(|_| LinkError::Config(format!("{key} is not a valid header value")))
        })
        .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }
}

impl tonic::service::Interceptor for AgentMetadata {
    fn call(&mut self, mut req: Request<()>) -> Result<Request<()>, Status> {
        let headers = req.metadata_mut();
        for (key, value) in &self.entries {
            headers.insert(*key, value.clone());
        }
        Ok(req)
    }
}
