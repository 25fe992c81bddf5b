//! Local control socket.
//!
//! A small JSON-over-HTTP API on a Unix socket, used by local tooling to
//! check tunnel readiness and to publish ACME DNS challenge records through
//! the hive.

pub mod server;

pub use server::{CtlError, CtlState, router};
#[cfg(unix)]
pub use server::serve;
