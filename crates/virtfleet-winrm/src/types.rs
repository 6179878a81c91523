//! Shared types for the WinRM transport crate.

use serde::{Deserialize, Serialize};

// ─── Connection Config ───────────────────────────────────────────────

/// Credentials for a WinRM endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinRmCredential {
    pub username: String,
    pub password: String,
    /// Windows domain, prepended as `DOMAIN\user` when present.
    #[serde(default)]
    pub domain: Option<String>,
}

impl WinRmCredential {
    /// Username in `DOMAIN\user` form when a domain is configured.
    pub fn qualified_username(&self) -> String {
        match self.domain {
            Some(ref d) => format!("{}\\{}", d, self.username),
            None => self.username.clone(),
        }
    }
}

/// Connection settings for a WinRM endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinRmConfig {
    /// Target host name or address.
    pub computer_name: String,
    #[serde(default)]
    pub credential: Option<WinRmCredential>,
    /// Explicit port; 0 selects the protocol default (5985 / 5986).
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub use_ssl: bool,
    /// Accept self-signed certificates on HTTPS endpoints.
    #[serde(default)]
    pub skip_cert_check: bool,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for WinRmConfig {
    fn default() -> Self {
        Self {
            computer_name: "localhost".to_string(),
            credential: None,
            port: 0,
            use_ssl: false,
            skip_cert_check: false,
            timeout_secs: 60,
        }
    }
}

impl WinRmConfig {
    /// Effective TCP port after applying protocol defaults.
    pub fn effective_port(&self) -> u16 {
        if self.port != 0 {
            self.port
        } else if self.use_ssl {
            5986
        } else {
            5985
        }
    }

    /// Full endpoint URI (`http://host:5985/wsman`).
    pub fn endpoint_uri(&self) -> String {
        format!(
            "{}://{}:{}/wsman",
            if self.use_ssl { "https" } else { "http" },
            self.computer_name,
            self.effective_port()
        )
    }
}

// ─── Command Output ──────────────────────────────────────────────────

/// Result of one remote PowerShell invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl PsOutput {
    /// Whether the command completed successfully (exit 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_port_defaults() {
        let mut config = WinRmConfig::default();
        assert_eq!(config.effective_port(), 5985);
        config.use_ssl = true;
        assert_eq!(config.effective_port(), 5986);
        config.port = 1234;
        assert_eq!(config.effective_port(), 1234);
    }

    #[test]
    fn test_endpoint_uri() {
        let config = WinRmConfig {
            computer_name: "scvmm01".to_string(),
            ..Default::default()
        };
        assert_eq!(config.endpoint_uri(), "http://scvmm01:5985/wsman");
    }

    #[test]
    fn test_qualified_username() {
        let cred = WinRmCredential {
            username: "admin".to_string(),
            password: "pw".to_string(),
            domain: Some("CORP".to_string()),
        };
        assert_eq!(cred.qualified_username(), "CORP\\admin");
    }
}
