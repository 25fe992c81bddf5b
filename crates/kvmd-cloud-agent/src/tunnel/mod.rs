//! Tunnel runtime connecting the agent to the cloud.
//!
//! Provides the reconnecting guard, the hive and proxy link clients, the
//! events channel protocol, and the multiplexer that forwards virtual
//! connections to local sockets.

pub mod auth;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod events;
pub mod guard;
pub mod link;
pub mod multiplexer;
pub mod relay;
pub mod status;
pub mod transport;
pub mod types;

pub use config::{EventChannelConfig, MultiplexerConfig, RetryPolicy, TunnelConfig};
pub use context::{LinkCause, LinkContext};
pub use error::{ForwardError, LinkError};
pub use guard::Guard;
pub use link::{ControlLink, Dialer, GrpcDialer, RelayLink};
pub use status::AgentHandle;
pub use types::{AgentIdentity, LinkEndpoint, LinkRole};
