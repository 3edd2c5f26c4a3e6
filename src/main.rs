//! MCP Policy Gateway
//!
//! Identity, RBAC, rate limiting, prompt-injection detection, tool approvals
//! and audit in front of MCP servers.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use gateway_core::KeyEnvironment;
use tracing::{error, info};

use mcp_policy_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    identity::{generate_key, hash_key},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Some(Command::Keygen {
            environment,
            ref prefix,
        }) => {
            keygen(prefix, environment);
            Ok(())
        }
        Some(Command::CheckConfig) => check_config(&cli),
        Some(Command::Serve) | None => run_server(&cli).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn keygen(prefix: &str, environment: KeyEnvironment) {
    let key = generate_key(prefix, environment);
    println!("key:  {key}");
    println!("hash: {}", hash_key(&key));
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }
    Ok(config)
}

fn check_config(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    println!("Configuration OK");
    println!("  listen:        {}:{}", config.server.host, config.server.port);
    println!("  api keys:      {}", config.auth.api_keys.len());
    println!("  sessions:      {}", config.auth.sessions.len());
    println!("  roles:         {}", config.rbac.roles.len());
    println!("  policies:      {}", config.safety.policies.len());
    println!("  tool classes:  {}", config.tools.classifications.len());
    println!("  tool grants:   {}", config.tools.permissions.len());
    let mut servers: Vec<_> = config.servers.iter().collect();
    servers.sort_by_key(|(name, _)| name.as_str());
    println!("  servers:       {}", servers.len());
    for (name, server) in servers {
        println!(
            "    {name:<12} {} (timeout {:?}, ${:.6}/call)",
            server.url, server.timeout, server.pricing.per_call
        );
    }
    Ok(())
}

async fn run_server(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        servers = config.servers.len(),
        "Starting MCP Policy Gateway"
    );

    let gateway = Gateway::new(config)
        .await
        .context("Failed to create gateway")?;
    gateway.run().await.context("Gateway error")?;

    info!("Gateway shutdown complete");
    Ok(())
}
