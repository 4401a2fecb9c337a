//! Registry facade daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use regfacade_registry::{Config, Registry, RegistryAuth, ResolverFactory};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "regfacade")]
#[command(author, version, about = "OCI registry facade for synthesized workspace images", long_about = None)]
struct Args {
    /// Configuration file (TOML). Environment variables prefixed with
    /// REGFACADE_ override file values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Username for upstream registry authentication.
    #[arg(long, env = "REGFACADE_UPSTREAM_USER")]
    upstream_user: Option<String>,

    /// Password for upstream registry authentication.
    #[arg(long, env = "REGFACADE_UPSTREAM_PASSWORD", hide_env_values = true)]
    upstream_password: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        "regfacade=debug,regfacade_registry=debug"
    } else {
        "regfacade=info,regfacade_registry=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config from environment")?,
    };

    let mut factory = ResolverFactory::new().context("failed to create upstream resolver")?;
    if let (Some(username), Some(password)) = (args.upstream_user, args.upstream_password) {
        factory = factory.with_auth(RegistryAuth { username, password });
    }

    info!(port = config.port, store = %config.store.display(), "starting registry facade");

    let registry = Arc::new(
        Registry::new(config, factory)
            .await
            .context("failed to assemble registry facade")?,
    );

    registry.serve().await.context("registry facade failed")?;

    info!("registry facade stopped");
    Ok(())
}
