//! Shared types for the SCVMM management crate.
//!
//! Covers the canonical VM state model, inventory records, hardware
//! info, and connection / deployment configuration.

use serde::{Deserialize, Serialize};
use virtfleet_winrm::{WinRmConfig, WinRmCredential};

// ─── VM State ────────────────────────────────────────────────────────

/// Canonical lifecycle state of an SCVMM virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum VmState {
    Running,
    Stopped,
    Paused,
    Error,
    /// A status string we didn't map.
    Unknown,
}

impl VmState {
    /// Map the manager's free-text status string onto the canonical
    /// model. Total: unrecognized strings become [`VmState::Unknown`].
    pub fn from_status(s: &str) -> Self {
        match s.trim() {
            "Running" => Self::Running,
            "PowerOff" | "Stopped" => Self::Stopped,
            "Paused" => Self::Paused,
            "Missing" | "Creation Failed" => Self::Error,
            _ => Self::Unknown,
        }
    }

    /// Whether no transition is presumed in-flight.
    pub fn is_steady(self) -> bool {
        matches!(self, Self::Running | Self::Stopped | Self::Paused)
    }

    /// Whether the manager reports the VM as failed.
    pub fn is_failed(self) -> bool {
        matches!(self, Self::Error)
    }
}

// ─── Inventory Records ───────────────────────────────────────────────

/// One row of the combined VM / network-adapter inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInfo {
    /// VMM object id; absent when the manager reports the `None` sentinel.
    pub id: Option<String>,
    pub name: String,
    /// Raw status string as reported by the manager.
    pub status: String,
    pub ipv4: Option<String>,
}

impl VmInfo {
    /// Canonical state derived from the raw status string.
    pub fn state(&self) -> VmState {
        VmState::from_status(&self.status)
    }
}

/// Hardware configuration reported through the JSON path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmHardware {
    /// Assigned memory in MB.
    pub ram: i64,
    /// Virtual CPU count.
    pub cpu: i64,
}

// ─── Connection Config ───────────────────────────────────────────────

/// Connection settings for an SCVMM management server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScvmmConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
    /// Windows domain used for the `PSCredential` the session builds.
    pub domain: String,
    /// Explicit WinRM port; 0 selects the protocol default.
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub skip_cert_check: bool,
    /// Default bound for wait-for-state loops, in seconds.
    pub timeout_secs: u64,
    /// Sleep between state polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Library share refreshed after template mutations.
    pub library_share: String,
    /// Upper bound on DVD-drive detach iterations.
    pub dvd_detach_limit: u32,
}

impl Default for ScvmmConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            username: String::new(),
            password: String::new(),
            domain: String::new(),
            port: 0,
            use_ssl: false,
            skip_cert_check: false,
            timeout_secs: 900,
            poll_interval_ms: 5000,
            library_share: "VMMLibrary".to_string(),
            dvd_detach_limit: 8,
        }
    }
}

impl ScvmmConfig {
    /// Derive the WinRM transport config for this manager.
    pub fn winrm_config(&self) -> WinRmConfig {
        WinRmConfig {
            computer_name: self.hostname.clone(),
            credential: Some(WinRmCredential {
                username: self.username.clone(),
                password: self.password.clone(),
                domain: if self.domain.is_empty() {
                    None
                } else {
                    Some(self.domain.clone())
                },
            }),
            port: self.port,
            use_ssl: self.use_ssl,
            skip_cert_check: self.skip_cert_check,
            timeout_secs: self.timeout_secs.min(300).max(10),
        }
    }
}

// ─── Deployment Config ───────────────────────────────────────────────

/// Parameters for deploying a VM from a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployConfig {
    pub template: String,
    pub host_group: String,
    /// Name of the VM to create.
    pub name: String,
    /// Override the template's CPU count.
    #[serde(default)]
    pub cpu: Option<u32>,
    /// Override the template's memory, in MB.
    #[serde(default)]
    pub ram_mb: Option<u32>,
    /// Bound for the wait-until-running poll; falls back to the
    /// system-wide default when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}
