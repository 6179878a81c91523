//! Error types for the WinRM transport crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error kinds for WinRM operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WinRmErrorKind {
    /// The endpoint is not reachable or the HTTP request failed.
    Connection,
    /// The endpoint rejected the supplied credentials.
    Auth,
    /// The service answered with a SOAP fault.
    SoapFault,
    /// The response did not match the WS-Management Shell protocol.
    Protocol,
    /// Stream or envelope content could not be decoded.
    Decode,
    /// The request exceeded its timeout.
    Timeout,
}

/// WinRM transport error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinRmError {
    pub kind: WinRmErrorKind,
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
}

impl fmt::Display for WinRmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(ref d) = self.details {
            write!(f, ": {}", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for WinRmError {}

impl WinRmError {
    pub fn new(kind: WinRmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        kind: WinRmErrorKind,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Some(details.into()),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(WinRmErrorKind::Connection, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(WinRmErrorKind::Auth, message)
    }

    pub fn soap_fault(message: impl Into<String>) -> Self {
        Self::new(WinRmErrorKind::SoapFault, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(WinRmErrorKind::Protocol, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(WinRmErrorKind::Decode, message)
    }

    pub fn timeout(op: &str) -> Self {
        Self::new(
            WinRmErrorKind::Timeout,
            format!("Operation '{}' timed out", op),
        )
    }
}

/// Convenience alias.
pub type WinRmResult<T> = Result<T, WinRmError>;
