//! # virtfleet – WinRM shell transport
//!
//! PowerShell execution over the WS-Management Shell protocol. Provides:
//!
//! - **Transport** – SOAP envelope construction and parsing for the
//!   Shell resource (Create / Command / Receive / Signal / Delete),
//!   `powershell.exe -EncodedCommand` invocation, basic authentication
//! - **Execution seam** – the [`ShellTransport`] trait consumed by the
//!   management crates, so orchestration logic can run against fakes
//! - **Script helpers** – fragment builders for quoting and the
//!   `ConvertTo-Xml` / `ConvertTo-Json` reply formats

pub mod types;
pub mod error;
pub mod transport;
pub mod script;

pub use error::{WinRmError, WinRmErrorKind, WinRmResult};
pub use script::PsScripts;
pub use transport::{ShellTransport, WinRmTransport};
pub use types::{PsOutput, WinRmConfig, WinRmCredential};
