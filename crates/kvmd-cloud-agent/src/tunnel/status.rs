//! State the guard publishes for local collaborators.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use super::error::LinkError;
use super::link::ControlLink;

/// Readiness flag and the active control link, written by the guard.
#[derive(Default)]
pub struct AgentState {
    ready: AtomicBool,
    control: RwLock<Option<Arc<dyn ControlLink>>>,
}

impl AgentState {
    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub(crate) async fn set_control(&self, control: Option<Arc<dyn ControlLink>>) {
        *self.control.write().await = control;
    }

    async fn control(&self) -> Result<Arc<dyn ControlLink>, LinkError> {
        self.control
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(LinkError::NotConnected)
    }
}

/// Cloneable view of the agent used by the control socket.
#[derive(Clone, Default)]
pub struct AgentHandle {
    state: Arc<AgentState>,
}

impl AgentHandle {
    pub(crate) fn new(state: Arc<AgentState>) -> Self {
        Self { state }
    }

    /// Whether a relay link is registered and accepting connections.
    pub fn ready(&self) -> bool {
        self.state.ready.load(Ordering::Acquire)
    }

    /// Ask the hive to publish a DNS challenge record. Errors from the hive
    /// are returned verbatim.
    pub async fn forward_certbot_add(&self, domain_name: &str, txt: &str) -> Result<(), LinkError> {
        let control = self.state.control().await?;
        control.certbot_add(domain_name, txt).await
    }

    pub async fn forward_certbot_del(&self, domain_name: &str) -> Result<(), LinkError> {
        let control = self.state.control().await?;
        control.certbot_del(domain_name).await
    }
}
