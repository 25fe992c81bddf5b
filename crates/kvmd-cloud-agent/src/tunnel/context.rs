//! Cancellable link lifetimes.
//!
//! Every link owns a [`LinkContext`]. Cancelling a context records why it
//! ended and cancels all of its children; children never cancel their parent.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use super::error::LinkError;

/// Why a link context ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCause {
    /// Shutdown was requested; supervisors must not retry.
    Shutdown,
    /// The peer closed the link cleanly.
    Closed,
    /// The link failed.
    Failed(String),
}

impl fmt::Display for LinkCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => f.write_str("shutdown requested"),
            Self::Closed => f.write_str("closed by peer"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

impl From<&LinkError> for LinkCause {
    fn from(err: &LinkError) -> Self {
        if err.is_clean_close() {
            Self::Closed
        } else {
            Self::Failed(err.to_string())
        }
    }
}

struct ContextInner {
    token: CancellationToken,
    cause: OnceLock<LinkCause>,
    parent: Option<LinkContext>,
}

/// Cancellation scope of one link, carrying a shutdown-vs-failure cause.
#[derive(Clone)]
pub struct LinkContext {
    inner: Arc<ContextInner>,
}

impl LinkContext {
    /// A root context, typically cancelled by the process signal handler.
    pub fn root() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                token: CancellationToken::new(),
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// A child that is cancelled together with `self`.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                token: self.inner.token.child_token(),
                cause: OnceLock::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel with `cause`. The first cancellation wins: a context that is
    /// already cancelled (directly or through a parent) keeps its cause.
    pub fn cancel(&self, cause: LinkCause) {
        if self.inner.token.is_cancelled() {
            return;
        }
        let _ = self.inner.cause.set(cause);
        self.inner.token.cancel();
    }

    /// Request a clean shutdown of this context and everything below it.
    pub fn shutdown(&self) {
        self.cancel(LinkCause::Shutdown);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Completes once the context is cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Why the context ended: its own cause, or the nearest cancelled
    /// ancestor's. `None` while it is still live.
    pub fn cause(&self) -> Option<LinkCause> {
        if !self.is_cancelled() {
            return None;
        }
        if let Some(cause) = self.inner.cause.get() {
            return Some(cause.clone());
        }
        self.inner.parent.as_ref().and_then(Self::cause)
    }

    /// Whether the context ended because shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        self.cause() == Some(LinkCause::Shutdown)
    }

    /// Run `fut` unless the context is cancelled first.
    pub async fn race<F: Future>(&self, fut: F) -> Result<F::Output, LinkError> {
        tokio::select! {
            () = self.cancelled() => Err(LinkError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Underlying token, for APIs that take one directly.
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }
}

impl fmt::Debug for LinkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkContext")
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.cause())
            .finish_non_exhaustive()
    }
}
