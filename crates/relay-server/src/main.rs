//! MCP relay server.
//!
//! Run with: cargo run -p relay-server -- --port 8001
//!
//! Clients open `GET /sse` (or `/ws`) and post frames to `/messages`.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use relay_core::{RelayConfig, ReportSink, SessionStore};
use relay_dispatch::{BuiltinDeps, Registry, register_builtins};
use relay_reports::FileReportSink;
use relay_session::{FileSessionStore, MemoryStore, SessionCoordinator};
use relay_transport::create_router;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Back-off applied when a sweep fails.
const SWEEP_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Parser)]
#[command(name = "mcp-relay", version, about = "Session-resumable MCP relay server")]
struct Args {
    /// Address to bind.
    #[arg(long, env = "MCP_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, env = "MCP_SERVER_PORT", default_value_t = 8001)]
    port: u16,

    /// Session store root.
    #[arg(long, env = "MCP_SESSIONS_DIR", default_value = "sessions")]
    sessions_dir: PathBuf,

    /// Report sink root.
    #[arg(long, env = "MCP_REPORTS_DIR", default_value = "reports")]
    reports_dir: PathBuf,

    /// Inactivity period before a session expires.
    #[arg(long, env = "MCP_SESSION_TTL_SECS", default_value_t = 8 * 3600)]
    session_ttl_secs: u64,

    /// Period after expiry before session storage is reclaimed.
    #[arg(long, env = "MCP_EXPIRY_GRACE_SECS", default_value_t = 3600)]
    expiry_grace_secs: u64,

    #[arg(long, env = "MCP_SWEEP_INTERVAL_SECS", default_value_t = 3600)]
    sweep_interval_secs: u64,

    /// Default handler execution budget.
    #[arg(long, env = "MCP_HANDLER_TIMEOUT_SECS", default_value_t = 60)]
    handler_timeout_secs: u64,

    #[arg(long, env = "MCP_KEEPALIVE_SECS", default_value_t = 15)]
    keepalive_secs: u64,

    /// Pushed-but-unacknowledged events allowed per connection.
    #[arg(long, env = "MCP_MAX_UNACKED_EVENTS", default_value_t = relay_core::config::DEFAULT_MAX_UNACKED)]
    max_unacked_events: usize,

    /// Reclaim least-recently-active sessions beyond this count.
    #[arg(long, env = "MCP_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Reclaim unattached sessions whose storage exceeds this many bytes (0 disables).
    #[arg(long, env = "MCP_MAX_SESSION_BYTES", default_value_t = relay_core::sweep::DEFAULT_MAX_SESSION_BYTES)]
    max_session_bytes: u64,

    /// Keep sessions in memory instead of on disk.
    #[arg(long, env = "MCP_IN_MEMORY")]
    in_memory: bool,
}

impl Args {
    fn config(&self) -> RelayConfig {
        RelayConfig {
            sessions_root: self.sessions_dir.clone(),
            reports_root: self.reports_dir.clone(),
            inactivity_timeout: Duration::from_secs(self.session_ttl_secs),
            expiry_grace: Duration::from_secs(self.expiry_grace_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            max_unacked_events: self.max_unacked_events.max(1),
            handler_timeout: Duration::from_secs(self.handler_timeout_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_secs.max(1)),
            max_sessions: self.max_sessions,
            max_session_bytes: (self.max_session_bytes > 0).then_some(self.max_session_bytes),
        }
    }

    fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}

fn build(config: &RelayConfig, in_memory: bool) -> anyhow::Result<SessionCoordinator> {
    let store: Arc<dyn SessionStore> = if in_memory {
        Arc::new(MemoryStore::new(config.sweep_policy()))
    } else {
        Arc::new(
            FileSessionStore::open(&config.sessions_root, config.sweep_policy())
                .context("opening session store")?,
        )
    };
    let reports: Arc<dyn ReportSink> =
        Arc::new(FileReportSink::open(&config.reports_root).context("opening report sink")?);

    let mut builder = Registry::builder(config.handler_timeout);
    register_builtins(
        &mut builder,
        BuiltinDeps {
            config: config.clone(),
            store: Arc::clone(&store),
            reports: Arc::clone(&reports),
        },
    )
    .context("registering built-in methods")?;

    Ok(SessionCoordinator::new(
        store,
        reports,
        Arc::new(builder.build()),
        config.clone(),
    ))
}

async fn shutdown_signal(coordinator: SessionCoordinator) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
    // Open event streams never end on their own; close them so draining finishes.
    coordinator.shutdown().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = args.config();
    let addr = args.addr()?;

    let coordinator = build(&config, args.in_memory)?;
    let sweeper = coordinator.spawn_sweeper(config.sweep_interval, SWEEP_BACKOFF);
    let app = create_router(coordinator.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("MCP relay listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(coordinator))
        .await
        .context("server error")?;

    sweeper.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["mcp-relay"]).unwrap();
        assert_eq!(args.addr().unwrap().to_string(), "0.0.0.0:8001");

        let config = args.config();
        assert_eq!(config.inactivity_timeout, Duration::from_secs(8 * 3600));
        assert_eq!(config.expiry_grace, Duration::from_secs(3600));
        assert_eq!(config.max_unacked_events, 256);
        assert_eq!(config.max_sessions, None);
        assert_eq!(config.max_session_bytes, Some(100 * 1024 * 1024));
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::try_parse_from([
            "mcp-relay",
            "--port",
            "9000",
            "--session-ttl-secs",
            "60",
            "--max-sessions",
            "10",
            "--max-session-bytes",
            "0",
            "--in-memory",
        ])
        .unwrap();
        assert_eq!(args.addr().unwrap().port(), 9000);
        assert!(args.in_memory);

        let policy = args.config().sweep_policy();
        assert_eq!(policy.inactivity_timeout, Duration::from_secs(60));
        assert_eq!(policy.max_sessions, Some(10));
        assert_eq!(policy.max_session_bytes, None);
    }

    #[test]
    fn test_rejects_bad_host() {
        let args = Args::try_parse_from(["mcp-relay", "--host", "not a host"]).unwrap();
        assert!(args.addr().is_err());
    }

    #[tokio::test]
    async fn test_build_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig {
            sessions_root: dir.path().join("sessions"),
            reports_root: dir.path().join("reports"),
            ..RelayConfig::default()
        };
        let coordinator = build(&config, true).unwrap();
        assert!(coordinator.registry().resolve("echo").is_ok());
        assert!(!config.sessions_root.exists());
        assert!(config.reports_root.exists());
    }
}
