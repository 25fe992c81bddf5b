//! Data-plane link to a proxy.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;
use tracing::{info, warn};

use kvmd_cloud_proto::v1::proxy_for_agent_client::ProxyForAgentClient;

use super::auth::AgentMetadata;
use super::config::TunnelConfig;
use super::context::{LinkCause, LinkContext};
use super::error::{ForwardError, LinkError};
use super::events::{EventChannel, EventHandler, EventStream};
use super::link::RelayLink;
use super::multiplexer::{DataStream, Multiplexer, StreamOpener, metadata_message};
use super::transport;
use super::types::{AgentIdentity, LinkEndpoint, LinkRole};

type ProxyClient = ProxyForAgentClient<InterceptedService<Channel, AgentMetadata>>;

/// A registered proxy link and the virtual connections it carries.
pub struct ProxyLink {
    ctx: LinkContext,
    addr: String,
    client: ProxyClient,
    events: EventChannel,
    mux: Multiplexer,
    stream_capacity: usize,
}

impl ProxyLink {
    /// Connect to `endpoint` and register on its events channel.
    pub async fn dial(
        ctx: LinkContext,
        endpoint: &LinkEndpoint,
        config: &TunnelConfig,
        identity: &AgentIdentity,
    ) -> Result<Self, LinkError> {
        let addr = endpoint.address.clone();
        let channel = transport::connect(&ctx, endpoint, config).await?;
        let mut client = ProxyForAgentClient::with_interceptor(
            channel,
            AgentMetadata::new(identity, LinkRole::Proxy)?,
        );

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

        info!(%addr, "Connected to proxy");
        Ok(Self {
            ctx,
            addr,
            client,
            events,
            mux: Multiplexer::new(config.multiplexer.clone()),
            stream_capacity: config.multiplexer.stream_capacity.max(1),
        })
    }
}

#[tonic::async_trait]
impl EventHandler for ProxyLink {
    async fn new_connection(&self, cid: &str, connect_to: &str) -> Result<(), ForwardError> {
        self.mux
            .create_virtual(cid, connect_to, self, &self.ctx)
            .await
    }
}

#[tonic::async_trait]
impl StreamOpener for ProxyLink {
    async fn open_data_stream(&self, cid: &str) -> Result<DataStream, ForwardError> {
        let stream_error = |reason: String| ForwardError::Stream {
            cid: cid.to_string(),
            reason,
        };

        let (tx, rx) = mpsc::channel(self.stream_capacity);
        tx.send(metadata_message(cid))
            .await
            .map_err(|e| stream_error(e.to_string()))?;

        let mut client = self.client.clone();
        let response = self
            .ctx
            .race(client.connection_channel(ReceiverStream::new(rx)))
            .await
            .map_err(|e| stream_error(e.to_string()))?
            .map_err(|status| stream_error(status.message().to_string()))?;

        Ok(DataStream {
            tx,
            rx: Box::pin(response.into_inner()),
        })
    }
}

#[tonic::async_trait]
impl RelayLink for ProxyLink {
    fn context(&self) -> &LinkContext {
        &self.ctx
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn run(&self) -> Result<(), LinkError> {
        let result = self.events.serve(&self.ctx, self).await;
        let cause = match &result {
            Ok(()) => LinkCause::Closed,
            Err(e) => LinkCause::from(e),
        };
        self.ctx.cancel(cause);

        let closed = self.mux.close_all().await;
        let stats = self.mux.stats().await;
        if let Err(e) = &result {
            warn!(addr = %self.addr, error = %e, closed, opened = stats.opened, "Proxy link failed");
        } else {
            info!(addr = %self.addr, closed, opened = stats.opened, "Proxy link ended");
        }
        result
    }
}
