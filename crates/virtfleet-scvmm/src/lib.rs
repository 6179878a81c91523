//! # virtfleet – SCVMM management
//!
//! Microsoft System Center Virtual Machine Manager control over WinRM
//! PowerShell. Provides services for:
//!
//! - **VM lifecycle** – start, stop, restart, suspend, rename, delete,
//!   clone, with steady-state guards and bounded wait-for-state polling
//! - **Templates & library** – existence checks, deletion, deployment
//!   from template, VM-to-template promotion, library cache refresh
//! - **Inventory** – VM / host / cluster / network / template listings,
//!   combined VM + adapter views
//! - **Reply decoding** – schema-free deserialization of the manager's
//!   typed-property XML into records, lists and coerced scalars, plus
//!   the JSON reply path
//!
//! All commands flow through one long-lived [`service::ScvmmSystem`]
//! session; the transport seam is [`virtfleet_winrm::ShellTransport`].

pub mod types;
pub mod error;
pub mod data;
pub mod service;
pub mod vm;
pub mod template;

pub use data::{decode_xml, deserialize, property_text, PropertyNode, PropertyValue};
pub use error::{ScvmmError, ScvmmErrorKind, ScvmmResult};
pub use service::{parse_manager_timestamp, ScvmmSystem};
pub use template::TemplateManager;
pub use types::{DeployConfig, ScvmmConfig, VmHardware, VmInfo, VmState};
pub use vm::ScvmVm;
