//! VM lifecycle operations — start, stop, restart, suspend, rename,
//! delete, clone, promote-to-template.
//!
//! Mutating actions that are undefined on a transitioning VM go through
//! [`ScvmVm::ensure_state`]: reach the steady pre-state first, then
//! mutate. The manager is not trusted to queue or reject them itself.

use crate::error::{ScvmmError, ScvmmResult};
use crate::service::ScvmmSystem;
use crate::types::{VmHardware, VmState};
use chrono::{DateTime, Utc};
use log::info;
use std::time::Duration;
use tokio::time::Instant;
use virtfleet_winrm::PsScripts;

/// Handle for one SCVMM virtual machine, addressed by name.
///
/// Borrows its owning [`ScvmmSystem`]; the session outlives every
/// handle. Renaming updates the handle in place, deleting consumes it.
pub struct ScvmVm<'a> {
    system: &'a ScvmmSystem,
    name: String,
}

impl std::fmt::Debug for ScvmVm<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScvmVm").field("name", &self.name).finish()
    }
}

impl<'a> ScvmVm<'a> {
    pub(crate) fn new(system: &'a ScvmmSystem, name: String) -> Self {
        Self { system, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the manager knows a VM under this name.
    pub async fn exists(&self) -> ScvmmResult<bool> {
        let reply = self
            .system
            .run_script(&format!(
                "Get-SCVirtualMachine -Name '{}' -VMMServer $scvmm_server",
                PsScripts::escape(&self.name)
            ))
            .await?;
        Ok(!reply.trim().is_empty())
    }

    /// Current canonical state.
    pub async fn state(&self) -> ScvmmResult<VmState> {
        self.system.vm_state(&self.name).await
    }

    /// Full typed-property record.
    pub async fn data(&self) -> ScvmmResult<crate::data::PropertyValue> {
        self.system.vm_data(&self.name).await
    }

    pub async fn hardware(&self) -> ScvmmResult<VmHardware> {
        self.system.vm_hardware(&self.name).await
    }

    pub async fn creation_time(&self) -> ScvmmResult<DateTime<Utc>> {
        self.system.vm_creation_time(&self.name).await
    }

    pub async fn ip_address(&self) -> ScvmmResult<Option<String>> {
        self.system.ip_address(&self.name).await
    }

    /// Pipe the VM through a `<Action>-SCVirtualMachine` cmdlet.
    async fn issue_action(&self, action: &str, params: &str) -> ScvmmResult<()> {
        info!("{} {} SCVMM VM '{}'", action, params, self.name);
        let script = format!(
            "Get-SCVirtualMachine -Name '{}' -VMMServer $scvmm_server | {}-SCVirtualMachine {}",
            PsScripts::escape(&self.name),
            action,
            params
        );
        self.system.run_script(script.trim()).await?;
        Ok(())
    }

    // ─── Power Transitions ───────────────────────────────────────────

    /// Start the VM; a paused VM is resumed instead.
    pub async fn start(&self) -> ScvmmResult<()> {
        if self.state().await? == VmState::Paused {
            self.issue_action("Resume", "").await
        } else {
            self.issue_action("Start", "").await
        }
    }

    /// Stop the VM — guest shutdown when `graceful`, hard power-off
    /// otherwise.
    pub async fn stop(&self, graceful: bool) -> ScvmmResult<()> {
        self.issue_action("Stop", if graceful { "-Shutdown" } else { "-Force" })
            .await
    }

    /// Reset the VM. Fire-and-confirm: no wait is performed here.
    pub async fn restart(&self) -> ScvmmResult<()> {
        self.issue_action("Reset", "").await
    }

    pub async fn suspend(&self) -> ScvmmResult<()> {
        self.issue_action("Suspend", "").await
    }

    // ─── Guarded Transitions ─────────────────────────────────────────

    /// Poll until the VM reaches `target`, sleeping the configured
    /// interval between probes. Fails with `Timeout` past the deadline;
    /// the action that triggered the wait is not rolled back.
    pub async fn wait_for(&self, target: VmState, timeout: Duration) -> ScvmmResult<()> {
        let deadline = Instant::now() + timeout;
        let interval = Duration::from_millis(self.system.config().poll_interval_ms);
        loop {
            if self.state().await? == target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ScvmmError::timeout(&format!(
                    "wait for VM '{}' to reach {:?}",
                    self.name, target
                )));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Drive the VM into `target` and block until it is steady there.
    /// No command is issued when the VM is already in `target`.
    pub async fn ensure_state(&self, target: VmState, timeout: Duration) -> ScvmmResult<()> {
        let current = self.state().await?;
        if current == target {
            return Ok(());
        }
        match target {
            VmState::Stopped => self.stop(false).await?,
            VmState::Running => {
                if current == VmState::Paused {
                    self.issue_action("Resume", "").await?;
                } else {
                    self.issue_action("Start", "").await?;
                }
            }
            VmState::Paused => self.suspend().await?,
            other => {
                return Err(ScvmmError::new(
                    crate::error::ScvmmErrorKind::Other,
                    format!("Cannot drive VM '{}' into {:?}", self.name, other),
                ));
            }
        }
        self.wait_for(target, timeout).await
    }

    // ─── Destructive Operations ──────────────────────────────────────

    /// Delete the VM. The handle is consumed: a removed VM has no
    /// identity left to address.
    pub async fn delete(self) -> ScvmmResult<()> {
        info!("Deleting SCVMM VM '{}'", self.name);
        let timeout = Duration::from_secs(self.system.config().timeout_secs);
        self.ensure_state(VmState::Stopped, timeout).await?;
        self.issue_action("Remove", "").await
    }

    /// Rename the VM, updating the handle, then re-fetch details so
    /// later accessors observe the new identity.
    pub async fn rename(&mut self, new_name: &str) -> ScvmmResult<()> {
        info!("Renaming SCVMM VM '{}' to '{}'", self.name, new_name);
        let timeout = Duration::from_secs(self.system.config().timeout_secs);
        self.ensure_state(VmState::Stopped, timeout).await?;
        self.issue_action("Set", &format!("-Name '{}'", PsScripts::escape(new_name)))
            .await?;
        self.name = new_name.to_string();
        self.system.vm_data(&self.name).await?;
        Ok(())
    }

    /// Create a new VM from this one's definition on the given host.
    pub async fn clone_to(
        &self,
        name: &str,
        host: &str,
        path: &str,
        start_vm: bool,
    ) -> ScvmmResult<ScvmVm<'a>> {
        info!(
            "Deploying SCVMM VM '{}' from clone of '{}'",
            name, self.name
        );
        let mut script = format!(
            "$vm_src = Get-SCVirtualMachine -Name '{src}' -VMMServer $scvmm_server\n\
             $vm_host = Get-SCVMHost -VMMServer $scvmm_server -ComputerName '{host}'\n\
             New-SCVirtualMachine -Name '{name}' -VM $vm_src -VMHost $vm_host -Path '{path}'",
            src = PsScripts::escape(&self.name),
            host = PsScripts::escape(host),
            name = PsScripts::escape(name),
            path = PsScripts::escape(path),
        );
        if start_vm {
            script.push_str(" -StartVM");
        }
        self.system.run_script(&script).await?;
        Ok(ScvmVm::new(self.system, name.to_string()))
    }

    /// Promote the VM to a library template. Destructive: the VM ceases
    /// to exist under this name, so the handle is consumed.
    pub async fn into_template(
        self,
        library_server: &str,
        share_path: &str,
    ) -> ScvmmResult<()> {
        self.system
            .templates()
            .create_from_vm(&self.name, library_server, share_path)
            .await
    }
}
