//! Control link to the hive.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;
use tracing::{debug, info};

use kvmd_cloud_proto::v1::hive_for_agent_client::HiveForAgentClient;
use kvmd_cloud_proto::v1::{CertbotDomainName, GetAvailableProxiesRequest};

use super::auth::AgentMetadata;
use super::config::TunnelConfig;
use super::context::LinkContext;
use super::error::LinkError;
use super::events::{EventChannel, EventStream, RejectConnections};
use super::link::ControlLink;
use super::transport;
use super::types::{AgentIdentity, LinkEndpoint, LinkRole};

type HiveClient = HiveForAgentClient<InterceptedService<Channel, AgentMetadata>>;

/// A registered hive link: the unary API plus the hive events channel.
pub struct HiveLink {
    ctx: LinkContext,
    addr: String,
    client: HiveClient,
    events: EventChannel,
    /// Trust root handed to the proxies the hive advertises.
    trust_root: Option<PathBuf>,
}

impl HiveLink {
    /// Connect, call `RegisterAgent`, then open and register the events
    /// channel. The link is usable only if every step succeeded.
    pub async fn dial(
        ctx: LinkContext,
        config: &TunnelConfig,
        identity: &AgentIdentity,
    ) -> Result<Self, LinkError> {
        let endpoint = &config.hive;
        let addr = endpoint.address.clone();

        let channel = transport::connect(&ctx, endpoint, config).await?;
        let mut client =
            HiveForAgentClient::with_interceptor(channel, AgentMetadata::new(identity, LinkRole::Hive)?);

        ctx.race(client.register_agent(identity.agent_info()))
            .await?
            .map_err(|status| LinkError::rpc("RegisterAgent", &status))?;
        debug!(%addr, "Agent registered");

        let (outbound, rx) = mpsc::channel(config.events.outbound_capacity.max(1));
        let response = ctx
            .race(client.events_channel(ReceiverStream::new(rx)))
            .await?
            .map_err(|status| LinkError::transport(&addr, &status))?;
        let stream = EventStream {
            outbound,
            inbound: Box::pin(response.into_inner()),
        };
        let events = EventChannel::new(addr.clone(), stream, config.events.clone());
        ctx.race(events.open(identity.agent_info())).await??;

        info!(%addr, "Connected to hive");
        Ok(Self {
            ctx,
            addr,
            client,
            events,
            trust_root: endpoint.trust_root.clone(),
        })
    }
}

#[tonic::async_trait]
impl ControlLink for HiveLink {
    fn context(&self) -> &LinkContext {
        &self.ctx
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn available_relays(&self) -> Result<Vec<LinkEndpoint>, LinkError> {
        let mut client = self.client.clone();
        let proxies = self
            .ctx
            .race(client.get_available_proxies(GetAvailableProxiesRequest {}))
            .await?
            .map_err(|status| LinkError::rpc("GetAvailableProxies", &status))?
            .into_inner()
            .available_proxies;
        debug!(addr = %self.addr, count = proxies.len(), "Available proxies");
        Ok(proxies
            .iter()
            .map(|proxy| LinkEndpoint::from_proxy(proxy, self.trust_root.clone()))
            .collect())
    }

    async fn certbot_add(&self, domain_name: &str, txt: &str) -> Result<(), LinkError> {
        let mut client = self.client.clone();
        self.ctx
            .race(client.certbot_add(CertbotDomainName {
                domain_name: domain_name.to_string(),
                txt: txt.to_string(),
            }))
            .await?
            .map_err(|status| LinkError::rpc("CertbotAdd", &status))?;
        info!(%domain_name, "DNS challenge record added");
        Ok(())
    }

    async fn certbot_del(&self, domain_name: &str) -> Result<(), LinkError> {
        let mut client = self.client.clone();
        self.ctx
            .race(client.certbot_del(CertbotDomainName {
                domain_name: domain_name.to_string(),
                txt: String::new(),
            }))
            .await?
            .map_err(|status| LinkError::rpc("CertbotDel", &status))?;
        info!(%domain_name, "DNS challenge record removed");
        Ok(())
    }

    async fn run_events(&self) -> Result<(), LinkError> {
        self.events.serve(&self.ctx, &RejectConnections).await
    }
}
