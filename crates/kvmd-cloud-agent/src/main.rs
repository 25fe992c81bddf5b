//! kvmd-cloud agent
//!
//! Keeps the appliance connected to the PiKVM cloud: registers with the hive,
//! holds a tunnel to a proxy, and forwards relayed connections to local
//! services. A local control socket reports readiness and forwards ACME DNS
//! challenge records.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use kvmd_cloud_agent::ctl::{self, CtlError, CtlState};
use kvmd_cloud_agent::tunnel::{AgentIdentity, Guard, GrpcDialer, LinkContext, TunnelConfig};
use kvmd_cloud_core::config::{AgentConfig, load_config};
use kvmd_cloud_core::tracing_init::{default_filter, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "kvmd-cloud-agent")]
#[command(version, about = "kvmd-cloud agent - PiKVM cloud tunnel")]
struct Args {
    /// Main config file (default: /etc/kvmd/cloud/cloud.toml)
    #[arg(long, short, env = "KVMD_CLOUD_CONFIG")]
    config: Option<PathBuf>,

    /// Hive endpoint, overrides the first configured one
    #[arg(long, env = "KVMD_CLOUD_HIVE")]
    hive: Option<String>,

    /// Agent name reported on registration (default: host name)
    #[arg(long, env = "KVMD_CLOUD_AGENT_NAME")]
    agent_name: Option<String>,

    /// Connect to hive and proxies without TLS (development only).
    #[arg(long, env = "KVMD_CLOUD_NOSSL")]
    nossl: bool,

    /// Path to an extra CA certificate (PEM) trusted for hive and proxies.
    #[arg(long, env = "KVMD_CLOUD_CA")]
    ca: Option<PathBuf>,

    /// Control socket path
    #[arg(long, env = "KVMD_CLOUD_CTL_SOCKET")]
    ctl_socket: Option<PathBuf>,

    /// Log level filter for the agent (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Append logs to this file instead of stdout ("-" for stdout).
    #[arg(long, env = "KVMD_CLOUD_LOG_FILE")]
    log_file: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "KVMD_CLOUD_LOG_JSON")]
    log_json: bool,

    /// Print the effective configuration and exit.
    #[arg(long)]
    dump_config: bool,
}

impl Args {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(hive) = &self.hive {
            config.hive.endpoints = vec![hive.clone()];
        }
        if let Some(name) = &self.agent_name {
            config.agent_name.clone_from(name);
        }
        if self.nossl {
            config.nossl = true;
        }
        if self.ca.is_some() {
            config.ssl.ca.clone_from(&self.ca);
        }
        if let Some(path) = &self.ctl_socket {
            config.unix_ctl_socket.clone_from(path);
        }
        if let Some(level) = &self.log_level {
            config.log.level.clone_from(level);
        }
        if let Some(file) = &self.log_file {
            config.log.file.clone_from(file);
        }
        if self.log_json {
            config.log.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);

    if args.dump_config {
        #[allow(clippy::print_stdout)]
        {
            println!("{}", config.dump()?);
        }
        return Ok(());
    }

    init_tracing(&default_filter(&config.log.level), &config.log)?;
    config.validate()?;

    let identity = Arc::new(AgentIdentity::new(
        agent_name(&config),
        config.auth_token.clone(),
    ));
    let tunnel = Arc::new(TunnelConfig::from_agent_config(&config)?);

    info!(
        version = %identity.version,
        instance_uuid = %identity.instance_uuid,
        agent_name = %identity.name,
        hive = %tunnel.hive,
        tls = tunnel.tls(),
        "Starting kvmd-cloud-agent"
    );

    let dialer = GrpcDialer::new(Arc::clone(&tunnel), Arc::clone(&identity));
    let guard = Guard::new(Arc::new(dialer), tunnel.retry.clone());
    let app = ctl::router(CtlState::new(guard.handle(), &identity));
    let root = LinkContext::root();

    #[cfg(unix)]
    let mut ctl_task = {
        let path = config.unix_ctl_socket.clone();
        let ctx = root.child();
        tokio::spawn(async move { ctl::serve(&path, app, ctx).await })
    };
    #[cfg(not(unix))]
    let mut ctl_task = {
        drop(app);
        tokio::spawn(std::future::pending::<Result<(), CtlError>>())
    };

    let guard_task = tokio::spawn({
        let root = root.clone();
        async move { guard.run(&root).await }
    });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    sd_notify::notify(false, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let mut ctl_result: Result<(), CtlError> = Ok(());
    let mut ctl_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
        joined = &mut ctl_task => {
            ctl_done = true;
            ctl_result = joined.context("control socket task panicked")?;
            if let Err(e) = &ctl_result {
                error!(error = %e, "Control socket failed, shutting down");
            }
        }
    }

    root.shutdown();
    let _ = guard_task.await;
    if !ctl_done {
        let _ = ctl_task.await;
    }

    info!("Agent stopped");
    ctl_result?;
    Ok(())
}

/// Configured agent name, or the host name when none is set.
fn agent_name(config: &AgentConfig) -> String {
    if !config.agent_name.is_empty() {
        return config.agent_name.clone();
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "pikvm".to_string())
}
