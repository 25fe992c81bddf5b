//! Link abstractions the guard supervises.
//!
//! The guard only sees these traits; [`GrpcDialer`] builds the real gRPC
//! links and tests substitute scripted ones.

use std::sync::Arc;

use super::config::TunnelConfig;
use super::context::LinkContext;
use super::control::HiveLink;
use super::error::LinkError;
use super::relay::ProxyLink;
use super::types::{AgentIdentity, LinkEndpoint};

/// A registered control link to the hive.
#[tonic::async_trait]
pub trait ControlLink: Send + Sync {
    fn context(&self) -> &LinkContext;

    fn addr(&self) -> &str;

    /// Relays this agent may connect to, in the hive's order.
    async fn available_relays(&self) -> Result<Vec<LinkEndpoint>, LinkError>;

    async fn certbot_add(&self, domain_name: &str, txt: &str) -> Result<(), LinkError>;

    async fn certbot_del(&self, domain_name: &str) -> Result<(), LinkError>;

    /// Serve the hive events channel until the link ends.
    async fn run_events(&self) -> Result<(), LinkError>;
}

/// A registered data-plane link to a proxy.
#[tonic::async_trait]
pub trait RelayLink: Send + Sync {
    fn context(&self) -> &LinkContext;

    fn addr(&self) -> &str;

    /// Serve the proxy events channel and its virtual connections until the
    /// link ends. All virtual connections are closed on return.
    async fn run(&self) -> Result<(), LinkError>;
}

/// Establishes registered links. A returned link owns `ctx`.
#[tonic::async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial_control(&self, ctx: LinkContext) -> Result<Arc<dyn ControlLink>, LinkError>;

    async fn dial_relay(
        &self,
        ctx: LinkContext,
        endpoint: &LinkEndpoint,
    ) -> Result<Arc<dyn RelayLink>, LinkError>;
}

/// Dials hive and proxies over gRPC.
pub struct GrpcDialer {
    config: Arc<TunnelConfig>,
    identity: Arc<AgentIdentity>,
}

impl GrpcDialer {
    pub fn new(config: Arc<TunnelConfig>, identity: Arc<AgentIdentity>) -> Self {
        Self { config, identity }
    }
}

#[tonic::async_trait]
impl Dialer for GrpcDialer {
    async fn dial_control(&self, ctx: LinkContext) -> Result<Arc<dyn ControlLink>, LinkError> {
        let link = HiveLink::dial(ctx, &self.config, &self.identity).await?;
        Ok(Arc::new(link))
    }

    async fn dial_relay(
        &self,
        ctx: LinkContext,
        endpoint: &LinkEndpoint,
    ) -> Result<Arc<dyn RelayLink>, LinkError> {
        let link = ProxyLink::dial(ctx, endpoint, &self.config, &self.identity).await?;
        Ok(Arc::new(link))
    }
}
