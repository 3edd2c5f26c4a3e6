//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use gateway_core::KeyEnvironment;

/// Policy-enforcing MCP gateway
#[derive(Parser, Debug)]
#[command(name = "mcp-policy-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_POLICY_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "MCP_POLICY_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "MCP_POLICY_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "MCP_POLICY_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MCP_POLICY_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Load and validate the configuration, then print a summary
    CheckConfig,

    /// Generate an API key and the hash stored for it
    Keygen {
        /// Environment tag (dev, stg, prd)
        #[arg(long = "env", default_value = "dev")]
        environment: KeyEnvironment,

        /// Key prefix
        #[arg(long, default_value = "gwo")]
        prefix: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_serve_mode() {
        let cli = Cli::try_parse_from(["mcp-policy-gateway", "--port", "9000"]).unwrap();
        assert_eq!(cli.port, Some(9000));
        assert!(cli.command.is_none());
    }

    #[test]
    fn keygen_parses_environment() {
        let cli = Cli::try_parse_from(["mcp-policy-gateway", "keygen", "--env", "prd"]).unwrap();
        match cli.command {
            Some(Command::Keygen { environment, prefix }) => {
                assert_eq!(environment, KeyEnvironment::Prd);
                assert_eq!(prefix, "gwo");
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["mcp-policy-gateway", "keygen", "--env", "qa"]).is_err());
    }
}
