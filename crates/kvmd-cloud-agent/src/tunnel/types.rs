//! Identity and endpoint types shared by the links.

use std::fmt;
use std::path::PathBuf;

use kvmd_cloud_proto::v1::{AgentInfo, ProxyInfo};

/// Who this agent is. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub name: String,
    /// Fresh per process; lets the cloud tell restarts apart.
    pub instance_uuid: String,
    pub version: String,
    pub auth_token: String,
}

impl AgentIdentity {
    /// Build an identity with a new instance UUID and the crate version.
    pub fn new(name: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_uuid: uuid::Uuid::new_v4().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            auth_token: auth_token.into(),
        }
    }

    /// Registration payload sent on `RegisterAgent` and in REGISTER events.
    pub fn agent_info(&self) -> AgentInfo {
        AgentInfo {
            name: self.name.clone(),
            version: self.version.clone(),
            instance_uuid: self.instance_uuid.clone(),
        }
    }
}

/// How to reach a hive or a proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEndpoint {
    /// `host:port` or a full `http(s)://` URI.
    pub address: String,
    /// Extra CA certificate trusted for this endpoint.
    pub trust_root: Option<PathBuf>,
}

impl LinkEndpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            trust_root: None,
        }
    }

    #[must_use]
    pub fn with_trust_root(mut self, trust_root: Option<PathBuf>) -> Self {
        self.trust_root = trust_root;
        self
    }

    /// Endpoint of a proxy advertised by the hive, trusting the same root.
    pub fn from_proxy(info: &ProxyInfo, trust_root: Option<PathBuf>) -> Self {
        Self::new(info.proxy_endpoint.clone()).with_trust_root(trust_root)
    }

    /// URI handed to the transport. Bare `host:port` addresses get a scheme
    /// matching the TLS setting.
    pub fn uri(&self, tls: bool) -> String {
        if self.address.contains("://") {
            self.address.clone()
        } else if tls {
            format!("https://{}", self.address)
        } else {
            format!("http://{}", self.address)
        }
    }
}

impl fmt::Display for LinkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Role tag sent in the `link_role` metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Hive,
    Proxy,
}

impl LinkRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hive => "hive",
            Self::Proxy => "proxy",
        }
    }
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
