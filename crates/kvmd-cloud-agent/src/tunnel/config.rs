//! Tunnel runtime configuration.

use std::time::Duration;

use rand::RngExt;

use kvmd_cloud_core::config::AgentConfig;

use super::types::LinkEndpoint;

/// Configuration for the agent's links to hive and proxies.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Hive endpoint (the first configured one). Its trust root is also
    /// handed to every proxy the hive advertises.
    pub hive: LinkEndpoint,

    /// Connect without TLS.
    pub nossl: bool,

    /// Reconnection policy shared by the hive and proxy supervisors.
    pub retry: RetryPolicy,

    /// Timeout for establishing a transport connection.
    pub connect_timeout: Duration,

    pub events: EventChannelConfig,

    pub multiplexer: MultiplexerConfig,
}

impl TunnelConfig {
    /// Create a tunnel config for `hive_address` with defaults.
    pub fn new(hive_address: impl Into<String>) -> Self {
        Self {
            hive: LinkEndpoint::new(hive_address),
            nossl: false,
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            events: EventChannelConfig::default(),
            multiplexer: MultiplexerConfig::default(),
        }
    }

    /// Derive the tunnel config from the agent configuration file.
    pub fn from_agent_config(config: &AgentConfig) -> kvmd_cloud_core::Result<Self> {
        let timings = &config.tunnel;
        let mut tunnel = Self::new(config.hive_endpoint()?);
        tunnel.hive.trust_root.clone_from(&config.ssl.ca);
        tunnel.nossl = config.nossl;
        tunnel.retry = RetryPolicy {
            interval: Duration::from_millis(timings.retry_interval_ms),
            jitter: Duration::from_millis(timings.retry_jitter_ms),
        };
        tunnel.connect_timeout = Duration::from_millis(timings.connect_timeout_ms);
        tunnel.events.ping_interval = Duration::from_millis(timings.ping_interval_ms);
        Ok(tunnel)
    }

    pub const fn tls(&self) -> bool {
        !self.nossl
    }
}

/// Fixed-interval reconnection with a small random jitter, so a fleet of
/// agents restarted together does not retry in lockstep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Base delay between attempts.
    pub interval: Duration,
    /// Total jitter width; the delay lands in `interval ± jitter / 2`.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// A policy without jitter.
    pub const fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            jitter: Duration::ZERO,
        }
    }

    /// Delay before the next attempt.
    #[allow(clippy::cast_possible_truncation)]
    pub fn delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.interval;
        }
        let offset = rand::rng().random_range(0..=jitter_ms);
        (self.interval + Duration::from_millis(offset)).saturating_sub(self.jitter / 2)
    }
}

/// Event channel protocol settings.
#[derive(Debug, Clone)]
pub struct EventChannelConfig {
    /// Interval of keepalive pings.
    pub ping_interval: Duration,
    /// Pings tolerated while waiting for the registration OK.
    pub max_register_pings: u32,
    /// Capacity of the outbound transport buffer.
    pub outbound_capacity: usize,
}

impl Default for EventChannelConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(2),
            max_register_pings: 3,
            outbound_capacity: 32,
        }
    }
}

/// Virtual connection forwarding settings.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Size of the buffer used for local socket reads; bounds chunk size.
    pub read_buffer_size: usize,
    /// Capacity of each data stream's outbound buffer.
    pub stream_capacity: usize,
    /// Timeout for connecting to a local target.
    pub dial_timeout: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 2048,
            stream_capacity: 64,
            dial_timeout: Duration::from_secs(10),
        }
    }
}
