//! Metadata keys attached to every call and stream an agent opens.
//!
//! Shared by the agent interceptor and by test doubles of the cloud services
//! so the header names stay in sync.

/// `authorization: bearer <token>`
pub const AUTHORIZATION: &str = "authorization";

/// Per-process instance identifier.
pub const AGENT_UUID: &str = "agent_uuid";

/// Human-readable agent name from the configuration.
pub const AGENT_NAME: &str = "agent_name";

/// Agent version string.
pub const VERSION: &str = "version";

/// Which link the call belongs to (`hive` or `proxy`).
pub const LINK_ROLE: &str = "link_role";

/// Scheme prefix of the authorization value.
pub const BEARER_PREFIX: &str = "bearer ";
