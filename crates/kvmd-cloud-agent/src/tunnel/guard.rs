//! Reconnecting supervisor for the hive and proxy links.
//!
//! The guard keeps one control link to the hive alive. While it is up, a
//! relay supervisor keeps one proxy link alive under a child context, so
//! losing the hive tears the proxy link down as well. Both loops retry with
//! the same policy: the very first attempt is immediate, every later one waits
//! [`RetryPolicy::delay`]. Only a shutdown of the root context stops them.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::config::RetryPolicy;
use super::context::{LinkCause, LinkContext};
use super::error::LinkError;
use super::link::{ControlLink, Dialer};
use super::status::{AgentHandle, AgentState};
use super::types::LinkEndpoint;

pub struct Guard {
    dialer: Arc<dyn Dialer>,
    policy: RetryPolicy,
    state: Arc<AgentState>,
}

impl Guard {
    pub fn new(dialer: Arc<dyn Dialer>, policy: RetryPolicy) -> Self {
        Self {
            dialer,
            policy,
            state: Arc::new(AgentState::default()),
        }
    }

    /// Handle for the control socket: readiness and forwarded hive calls.
    pub fn handle(&self) -> AgentHandle {
        AgentHandle::new(Arc::clone(&self.state))
    }

    /// Supervise the hive link until `root` is shut down.
    pub async fn run(&self, root: &LinkContext) {
        let mut first = true;
        let mut failures: u32 = 0;

        loop {
            if !first && !backoff(root, &self.policy).await {
                break;
            }
            first = false;
            if root.is_cancelled() {
                break;
            }

            let ctx = root.child();
            let control = match self.dialer.dial_control(ctx.clone()).await {
                Ok(control) => {
                    failures = 0;
                    control
                }
                Err(e) => {
                    ctx.cancel(LinkCause::from(&e));
                    if root.is_cancelled() {
                        break;
                    }
                    failures = failures.saturating_add(1);
                    warn!(error = %e, failures, "Unable to connect to hive");
                    continue;
                }
            };

            match self.run_control(control).await {
                LinkCause::Shutdown => break,
                LinkCause::Closed => info!("Hive link closed, reconnecting"),
                LinkCause::Failed(reason) => warn!(%reason, "Hive link lost, reconnecting"),
            }
        }

        self.state.set_ready(false);
        info!("Guard stopped");
    }

    /// Drive one registered control link until its context ends and return
    /// why it ended.
    async fn run_control(&self, control: Arc<dyn ControlLink>) -> LinkCause {
        let ctx = control.context().clone();
        self.state.set_control(Some(Arc::clone(&control))).await;

        let events = tokio::spawn({
            let control = Arc::clone(&control);
            async move {
                let result = control.run_events().await;
                let cause = match &result {
                    Ok(()) => LinkCause::Closed,
                    Err(e) => LinkCause::from(e),
                };
                control.context().cancel(cause);
            }
        });

        let relay = match control.available_relays().await {
            Ok(endpoints) => {
                if let Some(endpoint) = endpoints.into_iter().next() {
                    info!(addr = %endpoint, "Selected proxy");
                    Some(tokio::spawn(supervise_relay(
                        Arc::clone(&self.dialer),
                        self.policy.clone(),
                        Arc::clone(&self.state),
                        ctx.child(),
                        endpoint,
                    )))
                } else {
                    ctx.cancel(LinkCause::Failed(LinkError::NoRelays.to_string()));
                    None
                }
            }
            Err(e) => {
                debug!(addr = %control.addr(), error = %e, "Unable to get proxies");
                ctx.cancel(LinkCause::Failed(format!("unable to get proxies: {e}")));
                None
            }
        };

        ctx.cancelled().await;
        self.state.set_control(None).await;
        let _ = events.await;
        if let Some(relay) = relay {
            let _ = relay.await;
        }
        ctx.cause().unwrap_or(LinkCause::Closed)
    }
}

/// Keep one proxy link to `endpoint` alive until `parent` is cancelled.
async fn supervise_relay(
    dialer: Arc<dyn Dialer>,
    policy: RetryPolicy,
    state: Arc<AgentState>,
    parent: LinkContext,
    endpoint: LinkEndpoint,
) {
    let mut first = true;
    let mut failures: u32 = 0;

    loop {
        if !first && !backoff(&parent, &policy).await {
            break;
        }
        first = false;
        if parent.is_cancelled() {
            break;
        }

        let ctx = parent.child();
        let relay = match dialer.dial_relay(ctx.clone(), &endpoint).await {
            Ok(relay) => {
                failures = 0;
                relay
            }
            Err(e) => {
                ctx.cancel(LinkCause::from(&e));
                if parent.is_cancelled() {
                    break;
                }
                failures = failures.saturating_add(1);
                warn!(addr = %endpoint, error = %e, failures, "Unable to connect to proxy");
                continue;
            }
        };

        state.set_ready(true);
        let result = relay.run().await;
        state.set_ready(false);

        let cause = match &result {
            Ok(()) => LinkCause::Closed,
            Err(e) => LinkCause::from(e),
        };
        ctx.cancel(cause);
        if parent.is_cancelled() {
            break;
        }
        match ctx.cause() {
            Some(LinkCause::Failed(reason)) => {
                warn!(addr = %relay.addr(), %reason, "Proxy link lost, reconnecting");
            }
            _ => info!(addr = %relay.addr(), "Proxy link closed, reconnecting"),
        }
    }
    debug!(addr = %endpoint, "Proxy supervisor stopped");
}

/// Sleep for the next retry delay. Returns `false` if `ctx` ended first.
async fn backoff(ctx: &LinkContext, policy: &RetryPolicy) -> bool {
    ctx.race(tokio::time::sleep(policy.delay())).await.is_ok()
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::significant_drop_tightening
)]
#[path = "guard_tests.rs"]
mod tests;
