//! In-process hive and proxy test doubles.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::{Stream, StreamExt};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use kvmd_cloud_agent::tunnel::{
    AgentHandle, AgentIdentity, Guard, GrpcDialer, LinkContext, RetryPolicy, TunnelConfig,
};
use kvmd_cloud_proto::metadata;
use kvmd_cloud_proto::v1::connection_message::Body;
use kvmd_cloud_proto::v1::hive_for_agent_server::{HiveForAgent, HiveForAgentServer};
use kvmd_cloud_proto::v1::proxy_for_agent_server::{ProxyForAgent, ProxyForAgentServer};
use kvmd_cloud_proto::v1::{
    Ack, AgentInfo, AvailableProxies, CertbotDomainName, ConnectionMessage, Event, EventType,
    GetAvailableProxiesRequest, NewConnection, ProxyInfo, event,
};

pub const TOKEN: &str = "test-token";

type EventResponseStream = Pin<Box<dyn Stream<Item = Result<Event, Status>> + Send>>;
type ConnectionResponseStream =
    Pin<Box<dyn Stream<Item = Result<ConnectionMessage, Status>> + Send>>;

/// Headers seen on one call.
#[derive(Debug, Clone)]
pub struct SeenCall {
    pub method: &'static str,
    pub link_role: String,
    pub agent_name: String,
    pub agent_uuid: String,
}

fn header<T>(req: &Request<T>, key: &str) -> String {
    req.metadata()
        .get(key)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[allow(clippy::result_large_err)]
fn check_auth<T>(req: &Request<T>, method: &'static str, calls: &Mutex<Vec<SeenCall>>) -> Result<(), Status> {
    calls.lock().unwrap().push(SeenCall {
        method,
        link_role: header(req, metadata::LINK_ROLE),
        agent_name: header(req, metadata::AGENT_NAME),
        agent_uuid: header(req, metadata::AGENT_UUID),
    });
    if header(req, metadata::AUTHORIZATION) == format!("{}{TOKEN}", metadata::BEARER_PREFIX) {
        Ok(())
    } else {
        Err(Status::unauthenticated("invalid auth token"))
    }
}

/// Answer the agent's REGISTER with a matching OK.
async fn accept_register(
    inbound: &mut Streaming<Event>,
    out: &mpsc::Sender<Result<Event, Status>>,
) -> Option<AgentInfo> {
    let event = inbound.next().await?.ok()?;
    if event.r#type() != EventType::Register {
        return None;
    }
    let Some(event::Body::AgentInfo(info)) = event.body else {
        return None;
    };
    out.send(Ok(ok_event(event.id))).await.ok()?;
    Some(info)
}

pub fn ok_event(id: u32) -> Event {
    Event {
        id,
        is_response: true,
        r#type: EventType::Ok as i32,
        body: None,
    }
}

pub fn new_connection_event(id: u32, cid: &str, connect_to: &str) -> Event {
    Event {
        id,
        is_response: false,
        r#type: EventType::NewConnection as i32,
        body: Some(event::Body::NewConnection(NewConnection {
            cid: cid.to_string(),
            connect_to: connect_to.to_string(),
        })),
    }
}

// ---------------------------------------------------------------------------
// Hive
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct HiveState {
    pub proxies: Mutex<Vec<ProxyInfo>>,
    pub calls: Mutex<Vec<SeenCall>>,
    pub registrations: AtomicU32,
    pub events_opened: AtomicU32,
    pub pings: AtomicU32,
    pub certbot: Mutex<Vec<String>>,
    events_out: Mutex<Option<mpsc::Sender<Result<Event, Status>>>>,
}

impl HiveState {
    /// End the current events stream from the hive side.
    pub fn close_events(&self) -> bool {
        self.events_out.lock().unwrap().take().is_some()
    }
}

struct MockHive {
    state: Arc<HiveState>,
}

#[tonic::async_trait]
impl HiveForAgent for MockHive {
    type EventsChannelStream = EventResponseStream;

    async fn register_agent(&self, request: Request<AgentInfo>) -> Result<Response<Ack>, Status> {
        check_auth(&request, "RegisterAgent", &self.state.calls)?;
        self.state.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(Ack {}))
    }

    async fn get_available_proxies(
        &self,
        request: Request<GetAvailableProxiesRequest>,
    ) -> Result<Response<AvailableProxies>, Status> {
        check_auth(&request, "GetAvailableProxies", &self.state.calls)?;
        Ok(Response::new(AvailableProxies {
            available_proxies: self.state.proxies.lock().unwrap().clone(),
        }))
    }

    async fn certbot_add(
        &self,
        request: Request<CertbotDomainName>,
    ) -> Result<Response<Ack>, Status> {
        check_auth(&request, "CertbotAdd", &self.state.calls)?;
        let req = request.into_inner();
        if req.domain_name != "kvm.example.com" {
            return Err(Status::permission_denied("domain is not owned by this agent"));
        }
        self.state
            .certbot
            .lock()
            .unwrap()
            .push(format!("add {} {}", req.domain_name, req.txt));
        Ok(Response::new(Ack {}))
    }

    async fn certbot_del(
        &self,
        request: Request<CertbotDomainName>,
    ) -> Result<Response<Ack>, Status> {
        check_auth(&request, "CertbotDel", &self.state.calls)?;
        let req = request.into_inner();
        self.state
            .certbot
            .lock()
            .unwrap()
            .push(format!("del {}", req.domain_name));
        Ok(Response::new(Ack {}))
    }

    async fn events_channel(
        &self,
        request: Request<Streaming<Event>>,
    ) -> Result<Response<Self::EventsChannelStream>, Status> {
        check_auth(&request, "EventsChannel", &self.state.calls)?;
        let mut inbound = request.into_inner();
        let (out, rx) = mpsc::channel(32);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            if accept_register(&mut inbound, &out).await.is_none() {
                return;
            }
            state.events_opened.fetch_add(1, Ordering::SeqCst);
            *state.events_out.lock().unwrap() = Some(out);
            while let Some(Ok(event)) = inbound.next().await {
                if event.r#type() == EventType::Ping {
                    state.pings.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

/// Proxy end of one virtual connection's data stream.
pub struct DataStreamPeer {
    pub cid: String,
    pub inbound: Streaming<ConnectionMessage>,
    pub out: mpsc::Sender<Result<ConnectionMessage, Status>>,
}

impl DataStreamPeer {
    pub async fn send(&self, bytes: &[u8]) {
        self.out
            .send(Ok(ConnectionMessage {
                body: Some(Body::Chunk(bytes.to_vec())),
            }))
            .await
            .unwrap();
    }

    /// Next chunk from the agent, `None` once the agent closed the stream.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        let next = tokio::time::timeout(Duration::from_secs(5), self.inbound.next())
            .await
            .expect("timed out waiting for a chunk");
        match next {
            Some(Ok(ConnectionMessage {
                body: Some(Body::Chunk(chunk)),
            })) => Some(chunk),
            Some(Ok(other)) => panic!("unexpected message: {other:?}"),
            Some(Err(_)) | None => None,
        }
    }
}

pub struct ProxyState {
    pub calls: Mutex<Vec<SeenCall>>,
    pub pings: AtomicU32,
    pub events_opened: AtomicU32,
    events_out: Mutex<Option<mpsc::Sender<Result<Event, Status>>>>,
    replies: mpsc::UnboundedSender<Event>,
    data_streams: mpsc::UnboundedSender<DataStreamPeer>,
}

impl ProxyState {
    /// Push an event to the registered agent.
    pub async fn push(&self, event: Event) {
        let out = self
            .events_out
            .lock()
            .unwrap()
            .clone()
            .expect("no agent registered on the proxy");
        out.send(Ok(event)).await.unwrap();
    }

    pub fn close_events(&self) -> bool {
        self.events_out.lock().unwrap().take().is_some()
    }
}

struct MockProxy {
    state: Arc<ProxyState>,
}

#[tonic::async_trait]
impl ProxyForAgent for MockProxy {
    type EventsChannelStream = EventResponseStream;
    type ConnectionChannelStream = ConnectionResponseStream;

    async fn events_channel(
        &self,
        request: Request<Streaming<Event>>,
    ) -> Result<Response<Self::EventsChannelStream>, Status> {
        check_auth(&request, "EventsChannel", &self.state.calls)?;
        let mut inbound = request.into_inner();
        let (out, rx) = mpsc::channel(32);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            if accept_register(&mut inbound, &out).await.is_none() {
                return;
            }
            *state.events_out.lock().unwrap() = Some(out);
            state.events_opened.fetch_add(1, Ordering::SeqCst);
            while let Some(Ok(event)) = inbound.next().await {
                if event.r#type() == EventType::Ping {
                    state.pings.fetch_add(1, Ordering::SeqCst);
                } else {
                    let _ = state.replies.send(event);
                }
            }
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn connection_channel(
        &self,
        request: Request<Streaming<ConnectionMessage>>,
    ) -> Result<Response<Self::ConnectionChannelStream>, Status> {
        check_auth(&request, "ConnectionChannel", &self.state.calls)?;
        let mut inbound = request.into_inner();
        let cid = match inbound.message().await?.and_then(|m| m.body) {
            Some(Body::Metadata(meta)) => meta.cid,
            _ => return Err(Status::invalid_argument("first message must carry metadata")),
        };
        let (out, rx) = mpsc::channel(32);
        let _ = self
            .state
            .data_streams
            .send(DataStreamPeer { cid, inbound, out });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

pub struct Cloud {
    pub hive: Arc<HiveState>,
    pub proxy: Arc<ProxyState>,
    pub hive_addr: String,
    pub replies: mpsc::UnboundedReceiver<Event>,
    pub data_streams: mpsc::UnboundedReceiver<DataStreamPeer>,
}

impl Cloud {
    /// Next non-ping event the agent sent to the proxy.
    pub async fn reply(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.replies.recv())
            .await
            .expect("timed out waiting for a reply")
            .expect("proxy stopped")
    }

    pub async fn data_stream(&mut self) -> DataStreamPeer {
        tokio::time::timeout(Duration::from_secs(5), self.data_streams.recv())
            .await
            .expect("timed out waiting for a data stream")
            .expect("proxy stopped")
    }
}

async fn bind() -> (TcpListenerStream, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (TcpListenerStream::new(listener), addr)
}

/// Start a proxy and a hive that advertises it.
pub async fn start_cloud() -> Cloud {
    let (replies_tx, replies) = mpsc::unbounded_channel();
    let (streams_tx, data_streams) = mpsc::unbounded_channel();
    let proxy = Arc::new(ProxyState {
        calls: Mutex::default(),
        pings: AtomicU32::new(0),
        events_opened: AtomicU32::new(0),
        events_out: Mutex::default(),
        replies: replies_tx,
        data_streams: streams_tx,
    });
    let (proxy_incoming, proxy_addr) = bind().await;
    tokio::spawn(
        Server::builder()
            .add_service(ProxyForAgentServer::new(MockProxy {
                state: Arc::clone(&proxy),
            }))
            .serve_with_incoming(proxy_incoming),
    );

    let hive = Arc::new(HiveState::default());
    hive.proxies.lock().unwrap().push(ProxyInfo {
        proxy_endpoint: format!("http://{proxy_addr}"),
        name: "proxy-test".into(),
    });
    let (hive_incoming, hive_addr) = bind().await;
    tokio::spawn(
        Server::builder()
            .add_service(HiveForAgentServer::new(MockHive {
                state: Arc::clone(&hive),
            }))
            .serve_with_incoming(hive_incoming),
    );

    Cloud {
        hive,
        proxy,
        hive_addr,
        replies,
        data_streams,
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

pub struct RunningAgent {
    pub handle: AgentHandle,
    pub identity: Arc<AgentIdentity>,
    pub root: LinkContext,
    task: tokio::task::JoinHandle<()>,
}

impl RunningAgent {
    pub async fn stop(self) {
        self.root.shutdown();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("guard did not stop")
            .unwrap();
    }
}

pub fn tunnel_config(hive_addr: &str) -> TunnelConfig {
    let mut config = TunnelConfig::new(format!("http://{hive_addr}"));
    config.nossl = true;
    config.retry = RetryPolicy::fixed(Duration::from_millis(50));
    config.connect_timeout = Duration::from_secs(2);
    config.events.ping_interval = Duration::from_millis(100);
    config
}

pub fn start_agent(config: TunnelConfig, token: &str) -> RunningAgent {
    let config = Arc::new(config);
    let identity = Arc::new(AgentIdentity::new("kvm-it", token));
    let dialer = GrpcDialer::new(Arc::clone(&config), Arc::clone(&identity));
    let guard = Guard::new(Arc::new(dialer), config.retry.clone());
    let handle = guard.handle();
    let root = LinkContext::root();
    let task = tokio::spawn({
        let root = root.clone();
        async move { guard.run(&root).await }
    });
    RunningAgent {
        handle,
        identity,
        root,
        task,
    }
}

pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached: {what}");
}

/// Local TCP service that echoes every byte back.
pub async fn start_echo() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}
