//! Command-line interface definition
//!
//! Flags double as environment variables (`WEB_MODE`, `CORS_ORIGINS`,
//! `BIND_ADDR`, `MCPLENS_TOKEN`) so the service runs unchanged under a
//! supervisor or in a container.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::Settings;

/// MCPLens - inspector backend for Model Context Protocol servers
#[derive(Debug, Parser)]
#[command(name = "mcplens", version, about)]
pub struct Cli {
    /// Address to bind the HTTP edge to
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:8377")]
    pub bind: SocketAddr,

    /// Web mode: restrict MCP server URLs to https:// and disable stdio
    /// transports (any truthy value enables it)
    #[arg(long, env = "WEB_MODE")]
    pub web_mode: Option<String>,

    /// Comma-separated CORS origin allowlist; unset means permissive
    #[arg(long, env = "CORS_ORIGINS")]
    pub cors_origins: Option<String>,

    /// Bearer token required on every route except /health
    #[arg(long, env = "MCPLENS_TOKEN")]
    pub auth_token: Option<String>,

    /// Optional YAML preset file of servers to register at startup
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Parse from `std::env::args`.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Assemble [`Settings`] from the parsed flags.
    pub fn settings(&self) -> Settings {
        Settings {
            bind_addr: self.bind,
            web_mode: self.web_mode.as_deref().is_some_and(truthy),
            cors_origins: self
                .cors_origins
                .as_deref()
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            auth_token: self.auth_token.clone(),
            ..Settings::default()
        }
    }
}

/// Environment-variable truthiness: `1`, `true`, `yes`, `on`.
fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
