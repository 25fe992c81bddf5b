//! Events channel protocol engine.
//!
//! One [`EventChannel`] drives the bidirectional `EventsChannel` stream of a
//! link: the REGISTER handshake, keepalive pings, and dispatch of requests
//! pushed by the peer. Outbound events are written by a single sender loop in
//! the order [`EventChannel::send`] was called.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, trace, warn};

use kvmd_cloud_proto::v1::{AgentInfo, Event, EventError, EventType, NewConnection, Ping, event};

use super::config::EventChannelConfig;
use super::context::LinkContext;
use super::error::{ForwardError, LinkError};

/// Receiving half of a gRPC stream.
pub type InboundStream<T> = Pin<Box<dyn Stream<Item = Result<T, tonic::Status>> + Send>>;

/// Both halves of an events stream. Dropping `outbound` half-closes the
/// stream towards the peer.
pub struct EventStream {
    pub outbound: mpsc::Sender<Event>,
    pub inbound: InboundStream<Event>,
}

/// Handles requests pushed by the peer over an events channel.
#[tonic::async_trait]
pub trait EventHandler: Send + Sync {
    /// Open virtual connection `cid` to `connect_to`. The outcome is answered
    /// with OK or ERROR carrying the request id.
    async fn new_connection(&self, cid: &str, connect_to: &str) -> Result<(), ForwardError>;
}

/// Handler for links that never carry virtual connections.
pub struct RejectConnections;

#[tonic::async_trait]
impl EventHandler for RejectConnections {
    async fn new_connection(&self, _cid: &str, _connect_to: &str) -> Result<(), ForwardError> {
        Err(ForwardError::NotAccepted)
    }
}

struct SendPacket {
    event: Event,
    done: oneshot::Sender<Result<(), LinkError>>,
}

/// Protocol state of one link's events stream.
pub struct EventChannel {
    addr: String,
    config: EventChannelConfig,
    next_id: AtomicU32,
    registering: AtomicBool,
    registered: AtomicBool,
    stream: Mutex<Option<EventStream>>,
    queue_tx: mpsc::Sender<SendPacket>,
    queue_rx: Mutex<Option<mpsc::Receiver<SendPacket>>>,
}

impl EventChannel {
    pub fn new(addr: impl Into<String>, stream: EventStream, config: EventChannelConfig) -> Self {
        // Rendezvous-sized queue: `send` waits for the sender loop anyway.
        let (queue_tx, queue_rx) = mpsc::channel(1);
        Self {
            addr: addr.into(),
            config,
            next_id: AtomicU32::new(0),
            registering: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            stream: Mutex::new(Some(stream)),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether the handshake completed and the channel is serving.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Allocate the id of an outbound request. Never returns 0.
    fn next_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Register on the peer: send REGISTER and wait for the matching OK.
    ///
    /// Up to `max_register_pings` pings are tolerated before the OK; one
    /// more fails with [`LinkError::RegistrationTimeout`]. Any other event
    /// fails with [`LinkError::MalformedResponse`]. On failure the stream is
    /// dropped, which closes it.
    pub async fn open(&self, info: AgentInfo) -> Result<(), LinkError> {
        if self
            .registering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LinkError::RegistrationInProgress {
                addr: self.addr.clone(),
            });
        }
        let result = self.handshake(info).await;
        self.registering.store(false, Ordering::Release);
        result
    }

    async fn handshake(&self, info: AgentInfo) -> Result<(), LinkError> {
        let mut stream = self
            .stream
            .lock()
            .await
            .take()
            .ok_or_else(|| LinkError::StreamUnavailable {
                addr: self.addr.clone(),
            })?;

        let id = self.next_id();
        let register = Event {
            id,
            is_response: false,
            r#type: EventType::Register as i32,
            body: Some(event::Body::AgentInfo(info)),
        };
        if stream.outbound.send(register).await.is_err() {
            return Err(LinkError::TransportClosed {
                addr: self.addr.clone(),
            });
        }

        let mut pings: u32 = 0;
        loop {
            let event = match stream.inbound.next().await {
                Some(Ok(event)) => event,
                Some(Err(status)) => return Err(LinkError::transport(&self.addr, &status)),
                None => {
                    return Err(LinkError::TransportClosed {
                        addr: self.addr.clone(),
                    });
                }
            };

            if event.r#type() == EventType::Ping {
                pings += 1;
                if pings > self.config.max_register_pings {
                    warn!(addr = %self.addr, pings, "No registration response");
                    return Err(LinkError::RegistrationTimeout {
                        addr: self.addr.clone(),
                    });
                }
                trace!(addr = %self.addr, "PING recv while registering");
                continue;
            }

            if event.r#type() != EventType::Ok || event.id != id || !event.is_response {
                return Err(LinkError::MalformedResponse {
                    addr: self.addr.clone(),
                    detail: format!("{event:?}"),
                });
            }
            break;
        }

        *self.stream.lock().await = Some(stream);
        self.registered.store(true, Ordering::Release);
        debug!(addr = %self.addr, "Registered");
        Ok(())
    }

    /// Queue `event` and wait until the sender loop has written it.
    pub async fn send(&self, event: Event) -> Result<(), LinkError> {
        if !self.is_registered() {
            return Err(LinkError::NotRegistered);
        }
        let (done, written) = oneshot::channel();
        self.queue_tx
            .send(SendPacket { event, done })
            .await
            .map_err(|_| self.closed())?;
        written.await.map_err(|_| self.closed())?
    }

    /// Run the sender and receiver loops until the context is cancelled, the
    /// peer half-closes (`Ok`), or the transport fails (`Err`).
    pub async fn serve(
        &self,
        ctx: &LinkContext,
        handler: &dyn EventHandler,
    ) -> Result<(), LinkError> {
        if !self.is_registered() {
            return Err(LinkError::NotRegistered);
        }
        let unavailable = || LinkError::StreamUnavailable {
            addr: self.addr.clone(),
        };
        let EventStream { outbound, inbound } =
            self.stream.lock().await.take().ok_or_else(unavailable)?;
        let queue = self.queue_rx.lock().await.take().ok_or_else(unavailable)?;

        let result = tokio::select! {
            () = ctx.cancelled() => Ok(()),
            result = self.run_sender(outbound, queue) => result,
            result = self.run_receiver(inbound, handler) => result,
        };
        self.registered.store(false, Ordering::Release);
        result
    }

    async fn run_sender(
        &self,
        outbound: mpsc::Sender<Event>,
        mut queue: mpsc::Receiver<SendPacket>,
    ) -> Result<(), LinkError> {
        let mut ticker = tokio::time::interval(self.config.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if outbound.send(ping_event()).await.is_err() {
                        return Err(self.closed());
                    }
                    trace!(addr = %self.addr, "PING sent");
                }
                packet = queue.recv() => {
                    let Some(SendPacket { event, done }) = packet else {
                        return Ok(());
                    };
                    let result = outbound.send(event).await.map_err(|_| self.closed());
                    let failed = result.is_err();
                    let _ = done.send(result);
                    if failed {
                        return Err(self.closed());
                    }
                }
            }
        }
    }

    async fn run_receiver(
        &self,
        mut inbound: InboundStream<Event>,
        handler: &dyn EventHandler,
    ) -> Result<(), LinkError> {
        loop {
            match inbound.next().await {
                Some(Ok(event)) => self.dispatch(event, handler).await?,
                Some(Err(status)) => return Err(LinkError::transport(&self.addr, &status)),
                None => {
                    debug!(addr = %self.addr, "Events stream closed by peer");
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(&self, event: Event, handler: &dyn EventHandler) -> Result<(), LinkError> {
        match event.r#type() {
            EventType::Ping => {
                // Liveness only; receive-side ping timeouts are not enforced.
                trace!(addr = %self.addr, "PING recv");
                Ok(())
            }
            EventType::NewConnection => {
                let id = event.id;
                let reply = match event.body {
                    Some(event::Body::NewConnection(NewConnection { cid, connect_to })) => {
                        match handler.new_connection(&cid, &connect_to).await {
                            Ok(()) => ok_response(id),
                            Err(e) => {
                                warn!(addr = %self.addr, %cid, %connect_to, error = %e, "Unable to open connection");
                                error_response(id, e.to_string())
                            }
                        }
                    }
                    _ => error_response(id, "malformed new connection request".into()),
                };
                self.send(reply).await
            }
            other => {
                debug!(addr = %self.addr, event_type = ?other, "Unknown event type received");
                Ok(())
            }
        }
    }

    fn closed(&self) -> LinkError {
        LinkError::TransportClosed {
            addr: self.addr.clone(),
        }
    }
}

fn ping_event() -> Event {
    Event {
        id: 0, // pings are always 0
        is_response: false,
        r#type: EventType::Ping as i32,
        body: Some(event::Body::Ping(Ping {})),
    }
}

fn ok_response(id: u32) -> Event {
    Event {
        id,
        is_response: true,
        r#type: EventType::Ok as i32,
        body: None,
    }
}

fn error_response(id: u32, message: String) -> Event {
    Event {
        id,
        is_response: true,
        r#type: EventType::Error as i32,
        body: Some(event::Body::Error(EventError { message })),
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::significant_drop_tightening
)]
#[path = "events_tests.rs"]
mod tests;
