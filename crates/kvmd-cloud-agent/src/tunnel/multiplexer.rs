//! Virtual connection multiplexer.
//!
//! Each virtual connection pairs a local socket (TCP, or Unix when the target
//! is an absolute path) with a dedicated data stream on the proxy link. Two
//! pump tasks copy bytes in each direction; whichever side ends first closes
//! the whole connection.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{RwLock, mpsc};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kvmd_cloud_proto::v1::ConnectionMessage;
use kvmd_cloud_proto::v1::connection_message::{Body, Metadata};

use super::config::MultiplexerConfig;
use super::context::LinkContext;
use super::error::ForwardError;
use super::events::InboundStream;

type LocalReader = Box<dyn AsyncRead + Send + Unpin>;
type LocalWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Both halves of one virtual connection's data stream.
pub struct DataStream {
    pub tx: mpsc::Sender<ConnectionMessage>,
    pub rx: InboundStream<ConnectionMessage>,
}

/// Opens the link-side data stream of a virtual connection.
#[tonic::async_trait]
pub trait StreamOpener: Send + Sync {
    async fn open_data_stream(&self, cid: &str) -> Result<DataStream, ForwardError>;
}

/// First message of every data stream.
pub fn metadata_message(cid: &str) -> ConnectionMessage {
    ConnectionMessage {
        body: Some(Body::Metadata(Metadata {
            cid: cid.to_string(),
        })),
    }
}

pub fn chunk_message(chunk: Vec<u8>) -> ConnectionMessage {
    ConnectionMessage {
        body: Some(Body::Chunk(chunk)),
    }
}

/// Snapshot of multiplexer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiplexerStats {
    pub active: usize,
    pub opened: u64,
    pub closed: u64,
}

struct VirtualConnection {
    target: String,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct Registry {
    connections: RwLock<HashMap<String, VirtualConnection>>,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl Registry {
    /// Remove and cancel `cid`. Only the first call for a connection counts.
    async fn close(&self, cid: &str) -> bool {
        let removed = self.connections.write().await.remove(cid);
        let Some(conn) = removed else {
            return false;
        };
        conn.shutdown.cancel();
        self.closed.fetch_add(1, Ordering::Relaxed);
        info!(%cid, target = %conn.target, "Connection closed");
        true
    }
}

/// Registry of the virtual connections carried by one proxy link.
pub struct Multiplexer {
    registry: Arc<Registry>,
    config: MultiplexerConfig,
}

impl Multiplexer {
    pub fn new(config: MultiplexerConfig) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(MultiplexerConfig::default())
    }

    /// Dial `target`, open the data stream for `cid` through `opener`, and
    /// start forwarding. On error nothing is registered and any socket that
    /// was opened is closed again.
    ///
    /// The connection lives until either side closes, [`Self::close`] is
    /// called, or `link` is cancelled.
    pub async fn create_virtual(
        &self,
        cid: &str,
        target: &str,
        opener: &dyn StreamOpener,
        link: &LinkContext,
    ) -> Result<(), ForwardError> {
        if self.contains(cid).await {
            return Err(ForwardError::Duplicate {
                cid: cid.to_string(),
            });
        }

        let (reader, writer) = dial_local(target, &self.config).await?;
        // On failure the socket halves are dropped here, closing the socket.
        let stream = opener.open_data_stream(cid).await?;

        let shutdown = link.token().child_token();
        {
            let mut connections = self.registry.connections.write().await;
            if connections.contains_key(cid) {
                return Err(ForwardError::Duplicate {
                    cid: cid.to_string(),
                });
            }
            connections.insert(
                cid.to_string(),
                VirtualConnection {
                    target: target.to_string(),
                    shutdown: shutdown.clone(),
                },
            );
        }
        self.registry.opened.fetch_add(1, Ordering::Relaxed);
        info!(%cid, %target, "Connection opened");

        tokio::spawn(pump_inbound(
            Arc::clone(&self.registry),
            cid.to_string(),
            shutdown.clone(),
            stream.rx,
            writer,
        ));
        tokio::spawn(pump_outbound(
            Arc::clone(&self.registry),
            cid.to_string(),
            shutdown,
            reader,
            stream.tx,
            self.config.read_buffer_size,
        ));
        Ok(())
    }

    /// Close `cid`. Returns `false` if it was not open; repeated and
    /// concurrent calls close it once.
    pub async fn close(&self, cid: &str) -> bool {
        self.registry.close(cid).await
    }

    /// Close every open connection. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let cids: Vec<String> = self.registry.connections.read().await.keys().cloned().collect();
        let mut closed = 0;
        for cid in cids {
            if self.registry.close(&cid).await {
                closed += 1;
            }
        }
        closed
    }

    pub async fn contains(&self, cid: &str) -> bool {
        self.registry.connections.read().await.contains_key(cid)
    }

    pub async fn stats(&self) -> MultiplexerStats {
        MultiplexerStats {
            active: self.registry.connections.read().await.len(),
            opened: self.registry.opened.load(Ordering::Relaxed),
            closed: self.registry.closed.load(Ordering::Relaxed),
        }
    }
}

async fn dial_local(
    target: &str,
    config: &MultiplexerConfig,
) -> Result<(LocalReader, LocalWriter), ForwardError> {
    if target.is_empty() {
        return Err(ForwardError::EmptyTarget);
    }
    #[cfg(not(unix))]
    if target.starts_with('/') {
        return Err(ForwardError::UnsupportedTarget {
            target: target.to_string(),
        });
    }

    match tokio::time::timeout(config.dial_timeout, connect(target)).await {
        Ok(Ok(halves)) => Ok(halves),
        Ok(Err(source)) => Err(ForwardError::Dial {
            target: target.to_string(),
            source,
        }),
        Err(_) => Err(ForwardError::DialTimeout {
            target: target.to_string(),
        }),
    }
}

async fn connect(target: &str) -> io::Result<(LocalReader, LocalWriter)> {
    #[cfg(unix)]
    if target.starts_with('/') {
        let (reader, writer) = tokio::net::UnixStream::connect(target).await?.into_split();
        return Ok((Box::new(reader), Box::new(writer)));
    }
    let (reader, writer) = TcpStream::connect(target).await?.into_split();
    Ok((Box::new(reader), Box::new(writer)))
}

/// Proxy to local socket.
async fn pump_inbound(
    registry: Arc<Registry>,
    cid: String,
    shutdown: CancellationToken,
    mut rx: InboundStream<ConnectionMessage>,
    mut writer: LocalWriter,
) {
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = rx.next() => message,
        };
        let chunk = match message {
            Some(Ok(ConnectionMessage {
                body: Some(Body::Chunk(chunk)),
            })) => chunk,
            Some(Ok(_)) => continue,
            Some(Err(status)) => {
                debug!(%cid, error = %status, "Data stream failed");
                break;
            }
            None => {
                debug!(%cid, "Data stream closed by proxy");
                break;
            }
        };
        if chunk.is_empty() {
            continue;
        }
        let written = tokio::select! {
            () = shutdown.cancelled() => break,
            written = writer.write_all(&chunk) => written,
        };
        if let Err(e) = written {
            debug!(%cid, error = %e, "Local write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
    registry.close(&cid).await;
}

/// Local socket to proxy.
async fn pump_outbound(
    registry: Arc<Registry>,
    cid: String,
    shutdown: CancellationToken,
    mut reader: LocalReader,
    tx: mpsc::Sender<ConnectionMessage>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let read = tokio::select! {
            () = shutdown.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!(%cid, "Local socket closed");
                break;
            }
            Ok(n) => {
                let sent = tokio::select! {
                    () = shutdown.cancelled() => break,
                    sent = tx.send(chunk_message(buf[..n].to_vec())) => sent,
                };
                if sent.is_err() {
                    debug!(%cid, "Data stream closed while sending");
                    break;
                }
            }
            Err(e) if is_closed_error(&e) => {
                debug!(%cid, error = %e, "Local socket closed");
                break;
            }
            Err(e) => {
                warn!(%cid, error = %e, "Local read failed");
                break;
            }
        }
    }
    registry.close(&cid).await;
}

fn is_closed_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::significant_drop_tightening
)]
#[path = "multiplexer_tests.rs"]
mod tests;
