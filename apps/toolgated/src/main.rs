mod app;
mod config;
mod db_tools;
mod fs_tools;
mod stdio;
mod web_tools;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use toolgate_core::{AuditLogger, Gateway, PolicyEngine, ToolRegistry};
use tracing::{info, warn};

use crate::config::GatewayConfig;

#[derive(Debug, Parser)]
#[command(
    name = "toolgated",
    version,
    about = "Compliance-first tool gateway (MCP stdio + HTTP facade)"
)]
struct Args {
    /// Path to the gateway config file (YAML).
    #[arg(long, env = "TOOLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address for the HTTP facade, e.g. `127.0.0.1:8080`.
    #[arg(long, env = "TOOLGATE_HTTP_ADDR")]
    http_addr: Option<SocketAddr>,

    /// Disable the stdio transport (HTTP only).
    #[arg(long, env = "TOOLGATE_NO_STDIO", default_value_t = false)]
    no_stdio: bool,

    /// Actor recorded in audit events.
    #[arg(long, env = "TOOLGATE_ACTOR")]
    actor: Option<String>,

    /// Append audit events to this file in addition to stderr.
    #[arg(long, env = "TOOLGATE_AUDIT_LOG")]
    audit_log: Option<PathBuf>,

    /// Postgres connection string for the database connector.
    #[arg(long, env = "TOOLGATE_DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Stdout belongs to the stdio transport; everything else goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut cfg = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(actor) = &args.actor {
        cfg.actor = actor.clone();
    }
    if let Some(audit_log) = &args.audit_log {
        cfg.audit.log_file = Some(audit_log.clone());
    }
    if let Some(database_url) = &args.database_url {
        cfg.database.url = Some(database_url.clone());
    }

    let gateway = Arc::new(build_gateway(&cfg)?);
    info!(
        actor = %cfg.actor,
        tools = gateway.list_tools().len(),
        "gateway ready"
    );

    let http_task = args.http_addr.map(|addr| {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { app::serve(addr, gateway).await })
    });

    if !args.no_stdio {
        stdio::run(Arc::clone(&gateway)).await?;
    }

    if let Some(task) = http_task {
        task.await.context("http task join")??;
    }

    Ok(())
}

fn build_gateway(cfg: &GatewayConfig) -> anyhow::Result<Gateway> {
    let mut registry = ToolRegistry::new();
    registry.register_many(fs_tools::tools(cfg.filesystem.clone()))?;
    registry.register_many(web_tools::tools(cfg.http_fetch.clone())?)?;
    if cfg.database.url.is_some() {
        registry.register_many(db_tools::tools(cfg.database.clone())?)?;
    } else {
        warn!("database.url not configured; db tools disabled");
    }

    let policy = PolicyEngine::new(cfg.policy.clone())?;
    let audit = AuditLogger::new(&cfg.audit, &cfg.actor);
    Ok(Gateway::new(Arc::new(registry), policy, audit))
}
