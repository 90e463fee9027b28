//! Runtime settings for the MCPLens service
//!
//! Settings come from the CLI/environment (see [`crate::cli`]) plus an
//! optional YAML preset file listing MCP servers to register at startup.
//! The core holds no persistence of its own; everything else arrives over
//! the HTTP API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{McpLensError, Result};
use crate::mcp::transport::ServerConfig;

/// Ambient deadlines applied to operations that do not specify their own.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Deadline for tool/resource/prompt operations.
    pub tool: Duration,
    /// Deadline for `ping` round-trips.
    pub ping: Duration,
    /// Deadline for a whole chat turn.
    pub chat_turn: Duration,
    /// Deadline for an open elicitation before it expires.
    pub elicitation: Duration,
    /// Deadline for transport open plus the `initialize` handshake.
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            tool: Duration::from_secs(30),
            ping: Duration::from_secs(5),
            chat_turn: Duration::from_secs(300),
            elicitation: Duration::from_secs(300),
            connect: Duration::from_secs(30),
        }
    }
}

/// Backoff policy applied by the manager when reconnecting a severed session.
///
/// Delays grow exponentially from `base` by `factor` up to `ceiling`, with
/// `jitter` (a fraction of the delay) added or subtracted uniformly. After
/// `max_attempts` consecutive failures the server record transitions to
/// `failed`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// First retry delay.
    pub base: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Upper bound on any single delay.
    pub ceiling: Duration,
    /// Jitter fraction in `[0, 1)`; 0.25 means ±25%.
    pub jitter: f64,
    /// Attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            ceiling: Duration::from_secs(30),
            jitter: 0.25,
            max_attempts: 3,
        }
    }
}

impl ReconnectPolicy {
    /// Computes the jittered delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let raw = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = raw.min(self.ceiling.as_secs_f64());
        let scale = if self.jitter > 0.0 {
            rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * scale)
    }
}

/// Process-wide settings assembled from CLI flags and environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address the HTTP edge binds to.
    pub bind_addr: SocketAddr,
    /// When `true`, MCP server URLs are restricted to `https://` and stdio
    /// transports are disabled.
    pub web_mode: bool,
    /// CORS origin allowlist; empty means permissive (local development).
    pub cors_origins: Vec<String>,
    /// Optional bearer token required on every route except `/health`.
    pub auth_token: Option<String>,
    /// Ambient deadlines.
    pub timeouts: Timeouts,
    /// Reconnection backoff policy.
    pub reconnect: ReconnectPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8377".parse().expect("static addr parses"),
            web_mode: false,
            cors_origins: Vec::new(),
            auth_token: None,
            timeouts: Timeouts::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// YAML preset file listing servers to register (and connect) at startup.
///
/// ```yaml
/// servers:
///   filesystem:
///     command: npx
///     args: ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
///   remote:
///     url: https://mcp.example.com/mcp
///     authKind: bearer
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresetFile {
    /// Server configurations keyed by server id.
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

impl PresetFile {
    /// Loads and parses a preset file.
    ///
    /// # Errors
    ///
    /// Returns [`McpLensError::Config`] if the file cannot be read and
    /// [`McpLensError::Yaml`] if it does not parse.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            McpLensError::Config(format!("cannot read preset file {}: {}", path.display(), e))
        })?;
        let parsed: PresetFile = serde_yaml::from_str(&raw)?;
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let s = Settings::default();
        assert!(!s.web_mode);
        assert!(s.cors_origins.is_empty());
        assert_eq!(s.timeouts.tool, Duration::from_secs(30));
        assert_eq!(s.timeouts.ping, Duration::from_secs(5));
        assert_eq!(s.timeouts.chat_turn, Duration::from_secs(300));
    }

    #[test]
    fn test_reconnect_delay_grows_and_caps() {
        let policy = ReconnectPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        // Far past the ceiling: clamped to 30 s.
        assert_eq!(policy.delay_for(20), Duration::from_secs(30));
    }

    #[test]
    fn test_reconnect_delay_jitter_bounds() {
        let policy = ReconnectPolicy::default();
        for attempt in 0..5 {
            let raw = 0.5 * 2.0_f64.powi(attempt);
            let d = policy.delay_for(attempt as u32).as_secs_f64();
            assert!(d >= raw * 0.75 - 1e-9, "attempt {attempt}: {d} too small");
            assert!(d <= raw * 1.25 + 1e-9, "attempt {attempt}: {d} too large");
        }
    }

    #[test]
    fn test_preset_file_parses_both_shapes() {
        let yaml = r#"
servers:
  local:
    command: cat
    args: []
  remote:
    url: "https://mcp.example.com/mcp"
    authKind: bearer
"#;
        let parsed: PresetFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.servers.len(), 2);
        assert!(matches!(
            parsed.servers.get("local"),
            Some(ServerConfig::Stdio(_))
        ));
        assert!(matches!(
            parsed.servers.get("remote"),
            Some(ServerConfig::Http(_))
        ));
    }

    #[test]
    fn test_preset_file_load_missing_path_errors() {
        let result = PresetFile::load(Path::new("/nonexistent/mcplens.yaml"));
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("cannot read preset file"));
    }

    #[test]
    fn test_preset_file_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcplens.yaml");
        std::fs::write(
            &path,
            "servers:\n  local:\n    command: cat\n",
        )
        .unwrap();

        let parsed = PresetFile::load(&path).unwrap();
        assert_eq!(parsed.servers.len(), 1);
        assert!(parsed.servers.contains_key("local"));
    }
}
