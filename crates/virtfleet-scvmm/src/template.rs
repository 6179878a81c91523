//! Template and library operations.
//!
//! Template mutations are followed by a library refresh; the manager's
//! library cache lags otherwise and existence checks give false
//! negatives.

use crate::error::{ScvmmError, ScvmmResult};
use crate::service::ScvmmSystem;
use crate::types::{DeployConfig, VmState};
use crate::vm::ScvmVm;
use log::{info, warn};
use std::time::Duration;
use virtfleet_winrm::PsScripts;

/// Template operations backed by an [`ScvmmSystem`].
pub struct TemplateManager<'a> {
    system: &'a ScvmmSystem,
}

impl<'a> TemplateManager<'a> {
    pub(crate) fn new(system: &'a ScvmmSystem) -> Self {
        Self { system }
    }

    /// Whether a template with this name exists in the library.
    pub async fn exists(&self, name: &str) -> ScvmmResult<bool> {
        let reply = self
            .system
            .run_script(&format!(
                "Get-SCVMTemplate -Name '{}' -VMMServer $scvmm_server",
                PsScripts::escape(name)
            ))
            .await?;
        Ok(!reply.trim().is_empty())
    }

    /// Remove a template. A missing template is a logged no-op, not an
    /// error.
    pub async fn delete(&self, name: &str) -> ScvmmResult<()> {
        if !self.exists(name).await? {
            info!("Template '{}' does not exist in SCVMM", name);
            return Ok(());
        }
        info!("Removing SCVMM template '{}'", name);
        let script = format!(
            "$Template = Get-SCVMTemplate -Name '{}' -VMMServer $scvmm_server\n\
             Remove-SCVMTemplate -VMTemplate $Template -Force",
            PsScripts::escape(name)
        );
        self.system.run_script(&script).await?;
        self.system.refresh_library().await
    }

    /// Deploy a new VM from a template.
    ///
    /// Fails with `TemplateNotFound` before any mutating command when
    /// the template is missing. On success the VM is created, the guest
    /// service interface enabled, the VM started and polled until
    /// Running (or `Timeout`), and the manager's cached view refreshed.
    pub async fn deploy(&self, config: &DeployConfig) -> ScvmmResult<ScvmVm<'a>> {
        if !self.exists(&config.template).await? {
            warn!("Template '{}' does not exist", config.template);
            return Err(ScvmmError::template_not_found(&config.template));
        }

        let mut script = format!(
            "$tpl = Get-SCVMTemplate -Name '{template}' -VMMServer $scvmm_server\n\
             $vm_hg = Get-SCVMHostGroup -Name '{host_group}' -VMMServer $scvmm_server\n\
             $vmc = New-SCVMConfiguration -VMTemplate $tpl -Name '{name}' -VMHostGroup $vm_hg\n\
             Update-SCVMConfiguration -VMConfiguration $vmc\n\
             New-SCVirtualMachine -Name '{name}' -VMConfiguration $vmc",
            template = PsScripts::escape(&config.template),
            host_group = PsScripts::escape(&config.host_group),
            name = PsScripts::escape(&config.name),
        );
        if let Some(cpu) = config.cpu {
            script.push_str(&format!(" -CPUCount {}", cpu));
        }
        if let Some(ram) = config.ram_mb {
            script.push_str(&format!(" -MemoryMB {}", ram));
        }

        info!(
            "Deploying SCVMM VM '{}' from template '{}' on host group '{}'",
            config.name, config.template, config.host_group
        );
        self.system.run_script(&script).await?;
        self.system.enable_virtual_services(&config.name).await?;

        let vm = self.system.vm(config.name.clone());
        vm.start().await?;
        let timeout = Duration::from_secs(
            config
                .timeout_secs
                .unwrap_or(self.system.config().timeout_secs),
        );
        vm.wait_for(VmState::Running, timeout).await?;
        self.system.refresh_vm(&config.name).await?;
        Ok(vm)
    }

    /// Convert an existing VM into a template. The VM no longer exists
    /// under its name afterwards. Ends with a library refresh so the
    /// new template is immediately discoverable.
    pub async fn create_from_vm(
        &self,
        vm_name: &str,
        library_server: &str,
        share_path: &str,
    ) -> ScvmmResult<()> {
        info!(
            "Creating SCVMM template '{}' from VM '{}'",
            vm_name, vm_name
        );
        let script = format!(
            "$VM = Get-SCVirtualMachine -Name '{vm}' -VMMServer $scvmm_server\n\
             New-SCVMTemplate -Name '{vm}' -VM $VM -LibraryServer '{server}' -SharePath '{share}'",
            vm = PsScripts::escape(vm_name),
            server = PsScripts::escape(library_server),
            share = PsScripts::escape(share_path),
        );
        self.system.run_script(&script).await?;
        self.system.refresh_library().await
    }
}
