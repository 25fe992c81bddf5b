//! gRPC channel setup shared by the hive and proxy links.

use std::time::Duration;

use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info};

use super::config::TunnelConfig;
use super::context::LinkContext;
use super::error::LinkError;
use super::types::LinkEndpoint;

/// Open a channel to `endpoint`, with TLS unless `nossl` is set. Gives up
/// with [`LinkError::Cancelled`] if `ctx` ends first.
pub async fn connect(
    ctx: &LinkContext,
    endpoint: &LinkEndpoint,
    config: &TunnelConfig,
) -> Result<Channel, LinkError> {
    let addr = endpoint.address.clone();
    let dial_error = |reason: String| LinkError::Dial {
        addr: addr.clone(),
        reason,
    };

    let uri = endpoint.uri(config.tls());
    let mut builder = Endpoint::from_shared(uri.clone())
        .map_err(|e| dial_error(e.to_string()))?
        .connect_timeout(config.connect_timeout)
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true);

    if uri.starts_with("https://") {
        let mut tls_config = ClientTlsConfig::new().with_enabled_roots();
        if let Some(ca_path) = &endpoint.trust_root {
            let ca_pem = tokio::fs::read_to_string(ca_path).await.map_err(|e| {
                dial_error(format!("failed to read CA cert {}: {e}", ca_path.display()))
            })?;
            tls_config = tls_config.ca_certificate(Certificate::from_pem(ca_pem));
            debug!(ca_cert = %ca_path.display(), "TLS configured with custom CA cert");
        }
        builder = builder
            .tls_config(tls_config)
            .map_err(|e| dial_error(e.to_string()))?;
    }

    let channel = ctx.race(builder.connect()).await?.map_err(|e| {
        debug!(error = ?e, "connection error details");
        dial_error(format!("{e}: {}", error_chain(&e)))
    })?;
    info!(%addr, "Transport connected");
    Ok(channel)
}

/// Walk the `source()` chain of an error and join into a single string.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(e) = current {
        chain.push(e.to_string());
        current = e.source();
    }
    if chain.is_empty() {
        String::from("(no further details)")
    } else {
        chain.join(" -> ")
    }
}
