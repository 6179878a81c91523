//! Error types for the SCVMM management crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use virtfleet_winrm::WinRmError;

/// Error kinds for SCVMM operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScvmmErrorKind {
    /// A remote PowerShell script exited non-zero.
    RemoteExecution,
    /// A reply payload was not well-formed XML/JSON.
    Codec,
    /// A typed-property tree violated its structural contract.
    MalformedTree,
    /// A scalar value could not be coerced to its declared type.
    ParseError,
    /// The named template does not exist on the manager.
    TemplateNotFound,
    /// The named VM does not exist on the manager.
    VmNotFound,
    /// A bounded wait loop exceeded its deadline.
    Timeout,
    /// The WinRM transport failed before a reply was produced.
    Connection,
    /// A generic / uncategorised error.
    Other,
}

/// SCVMM management error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScvmmError {
    pub kind: ScvmmErrorKind,
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
    /// Remote exit code, populated for `RemoteExecution` errors.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl fmt::Display for ScvmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(ref d) = self.details {
            write!(f, ": {}", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for ScvmmError {}

impl ScvmmError {
    pub fn new(kind: ScvmmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            exit_code: None,
        }
    }

    pub fn with_details(
        kind: ScvmmErrorKind,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Some(details.into()),
            exit_code: None,
        }
    }

    pub fn remote_execution(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            kind: ScvmmErrorKind::RemoteExecution,
            message: format!("Remote script exited with code {}", exit_code),
            details: Some(stderr.into()),
            exit_code: Some(exit_code),
        }
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::new(ScvmmErrorKind::Codec, message)
    }

    pub fn malformed_tree(message: impl Into<String>) -> Self {
        Self::new(ScvmmErrorKind::MalformedTree, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ScvmmErrorKind::ParseError, message)
    }

    pub fn template_not_found(name: &str) -> Self {
        Self::new(
            ScvmmErrorKind::TemplateNotFound,
            format!("Template '{}' does not exist", name),
        )
    }

    pub fn vm_not_found(name: &str) -> Self {
        Self::new(
            ScvmmErrorKind::VmNotFound,
            format!("VM '{}' not found", name),
        )
    }

    pub fn timeout(op: &str) -> Self {
        Self::new(
            ScvmmErrorKind::Timeout,
            format!("Operation '{}' timed out", op),
        )
    }
}

impl From<WinRmError> for ScvmmError {
    fn from(e: WinRmError) -> Self {
        Self::with_details(
            ScvmmErrorKind::Connection,
            "WinRM transport failure",
            e.to_string(),
        )
    }
}

/// Convenience alias.
pub type ScvmmResult<T> = Result<T, ScvmmError>;
