//! SCVMM system facade.
//!
//! Owns the long-lived management session: a [`ShellTransport`] plus the
//! credential preamble every script needs. All remote operations flow
//! through [`ScvmmSystem::run_script`], one command in flight at a time.

use crate::data::{self, PropertyValue};
use crate::error::{ScvmmError, ScvmmResult};
use crate::template::TemplateManager;
use crate::types::{ScvmmConfig, VmHardware, VmInfo, VmState};
use crate::vm::ScvmVm;

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use log::{debug, info};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use virtfleet_winrm::{PsScripts, ShellTransport, WinRmTransport};

const MANAGER_TIMESTAMP_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";

/// Connection to one SCVMM management server.
///
/// Construct once and pass by reference to every handle/manager; the
/// session authenticates per script through the credential preamble
/// rather than holding server-side state.
pub struct ScvmmSystem {
    transport: Arc<dyn ShellTransport>,
    config: ScvmmConfig,
}

impl ScvmmSystem {
    /// Open a session against the configured manager over WinRM.
    pub fn connect(config: ScvmmConfig) -> ScvmmResult<Self> {
        let transport = WinRmTransport::new(&config.winrm_config())?;
        info!("Opened SCVMM session to {}", config.hostname);
        Ok(Self {
            transport: Arc::new(transport),
            config,
        })
    }

    /// Build a system around an existing transport (tests, pooling).
    pub fn with_transport(config: ScvmmConfig, transport: Arc<dyn ShellTransport>) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &ScvmmConfig {
        &self.config
    }

    /// End the session. No remote teardown is required; the transport
    /// closes its shell per command.
    pub fn close(self) {
        info!("Closed SCVMM session to {}", self.config.hostname);
    }

    /// Handle for a VM by name.
    pub fn vm(&self, name: impl Into<String>) -> ScvmVm<'_> {
        ScvmVm::new(self, name.into())
    }

    /// Template and library operations.
    pub fn templates(&self) -> TemplateManager<'_> {
        TemplateManager::new(self)
    }

    // ─── Script Execution ────────────────────────────────────────────

    /// Credential preamble loaded ahead of every script.
    ///
    /// Plain WinRM logins cannot reach the VMM server without the
    /// domain, so each script rebuilds a `PSCredential` and binds
    /// `$scvmm_server` before the payload runs.
    fn pre_script(&self) -> String {
        format!(
            "$secpasswd = ConvertTo-SecureString '{password}' -AsPlainText -Force\n\
             $mycreds = New-Object System.Management.Automation.PSCredential ('{domain}\\{user}', $secpasswd)\n\
             $scvmm_server = Get-SCVMMServer -ComputerName localhost -Credential $mycreds",
            password = PsScripts::escape(&self.config.password),
            domain = PsScripts::escape(&self.config.domain),
            user = PsScripts::escape(&self.config.username),
        )
    }

    /// Run a PowerShell script against the manager and return trimmed
    /// stdout. Non-zero exit surfaces as a `RemoteExecution` error.
    pub async fn run_script(&self, script: &str) -> ScvmmResult<String> {
        debug!(
            "Running PowerShell script ({} chars): {}",
            script.len(),
            &script[..script.len().min(160)]
        );
        let full = format!("{}\n\n{}", self.pre_script(), script);
        let output = self.transport.run_powershell(&full).await?;
        if !output.success() {
            return Err(ScvmmError::remote_execution(output.exit_code, output.stderr));
        }
        Ok(output.stdout.trim().to_string())
    }

    // ─── Inventory ───────────────────────────────────────────────────

    /// Names of all VMs known to the manager.
    pub async fn list_vms(&self) -> ScvmmResult<Vec<String>> {
        self.list_names("Get-SCVirtualMachine -All -VMMServer $scvmm_server | Select Name")
            .await
    }

    /// Names of all managed hosts.
    pub async fn list_hosts(&self) -> ScvmmResult<Vec<String>> {
        self.list_names("Get-SCVMHost -VMMServer $scvmm_server").await
    }

    /// Names of all host clusters.
    pub async fn list_clusters(&self) -> ScvmmResult<Vec<String>> {
        self.list_names("Get-SCVMHostCluster -VMMServer $scvmm_server | Select Name")
            .await
    }

    /// Names of all logical networks.
    pub async fn list_networks(&self) -> ScvmmResult<Vec<String>> {
        self.list_names("Get-SCLogicalNetwork -VMMServer $scvmm_server")
            .await
    }

    /// Names of all VM templates in the library.
    pub async fn list_templates(&self) -> ScvmmResult<Vec<String>> {
        self.list_names("Get-SCVMTemplate -VMMServer $scvmm_server | Select Name")
            .await
    }

    async fn list_names(&self, query: &str) -> ScvmmResult<Vec<String>> {
        let script = format!("{} {}", query, PsScripts::to_xml());
        let reply = self.run_script(&script).await?;
        let objects = data::decode_xml(&reply)?;
        Ok(data::property_text(&objects, "Name"))
    }

    /// Combined VM / network-adapter inventory.
    pub async fn all_vms(&self) -> ScvmmResult<Vec<VmInfo>> {
        let script = format!(
            r#"$outputCollection = @()
$VMs = Get-SCVirtualMachine -All -VMMServer $scvmm_server |
Select VMId, Name, StatusString
$NetAdapter = Get-SCVirtualNetworkAdapter -VMMServer $scvmm_server -All |
Select ID, Name, IPv4Addresses
$VMs | ForEach-Object {{
    $vm_object = $_
    $ip_object = $NetAdapter | Where-Object {{$_.Name -eq $vm_object.Name}}

    $outObj = "" | Select VMId, Name, Status, IPv4
    $outObj.VMId = if($vm_object.VMId){{$vm_object.VMId}} else {{"None"}}
    $outObj.Name = $vm_object.Name
    $outObj.Status = $vm_object.StatusString
    $outObj.IPv4 = if($ip_object.IPv4Addresses){{$ip_object.IPv4Addresses}} else {{"None"}}

    $outputCollection += $outObj
}}
$outputCollection {}"#,
            PsScripts::to_xml()
        );
        let reply = self.run_script(&script).await?;
        let objects = data::decode_xml(&reply)?;

        let mut vms = Vec::new();
        for object in &objects {
            let record = data::deserialize(object)?;
            let name = record
                .get("Name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ScvmmError::codec("Inventory row without a Name property"))?
                .to_string();
            vms.push(VmInfo {
                id: record
                    .get("VMId")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                name,
                status: record
                    .get("Status")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                ipv4: record
                    .get("IPv4")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            });
        }
        Ok(vms)
    }

    // ─── Detail Accessors ────────────────────────────────────────────

    async fn fetch_vm_objects(&self, name: &str) -> ScvmmResult<Vec<data::PropertyNode>> {
        let script = format!(
            "Get-SCVirtualMachine -Name '{}' -VMMServer $scvmm_server {}",
            PsScripts::escape(name),
            PsScripts::to_xml()
        );
        let reply = self.run_script(&script).await?;
        data::decode_xml(&reply)
    }

    /// The manager's raw status string for a VM.
    pub async fn vm_status(&self, name: &str) -> ScvmmResult<String> {
        let objects = self.fetch_vm_objects(name).await?;
        data::property_text(&objects, "StatusString")
            .into_iter()
            .next()
            .ok_or_else(|| ScvmmError::vm_not_found(name))
    }

    /// Canonical state for a VM.
    pub async fn vm_state(&self, name: &str) -> ScvmmResult<VmState> {
        Ok(VmState::from_status(&self.vm_status(name).await?))
    }

    /// Full typed-property record for a VM.
    pub async fn vm_data(&self, name: &str) -> ScvmmResult<PropertyValue> {
        let objects = self.fetch_vm_objects(name).await?;
        let object = objects
            .first()
            .ok_or_else(|| ScvmmError::vm_not_found(name))?;
        data::deserialize(object)
    }

    /// When the VM was created, as a UTC instant.
    ///
    /// The manager reports local wall-clock time; it is parsed naive,
    /// bound to this process's local zone and converted.
    pub async fn vm_creation_time(&self, name: &str) -> ScvmmResult<DateTime<Utc>> {
        let objects = self.fetch_vm_objects(name).await?;
        let raw = data::property_text(&objects, "CreationTime")
            .into_iter()
            .next()
            .ok_or_else(|| ScvmmError::vm_not_found(name))?;
        parse_manager_timestamp(&raw, &chrono::Local)
    }

    /// CPU / memory assignment, via the JSON reply path.
    pub async fn vm_hardware(&self, name: &str) -> ScvmmResult<VmHardware> {
        let script = format!(
            "$vm = Get-SCVirtualMachine -Name '{}' -VMMServer $scvmm_server\n\
             $conf = @{{\"ram\"=$vm.Memory; \"cpu\"=$vm.CPUCount}}\n\
             $conf {}",
            PsScripts::escape(name),
            PsScripts::to_json(3)
        );
        let reply = self.run_script(&script).await?;
        serde_json::from_str(&reply)
            .map_err(|e| ScvmmError::codec(format!("Failed to decode hardware JSON: {}", e)))
    }

    /// Which host a VM currently runs on.
    pub async fn vm_host(&self, name: &str) -> ScvmmResult<Option<String>> {
        let script = format!(
            "Get-SCVirtualMachine -Name '{}' -VMMServer $scvmm_server | Select VMHost {}",
            PsScripts::escape(name),
            PsScripts::to_xml()
        );
        let reply = self.run_script(&script).await?;
        let objects = data::decode_xml(&reply)?;
        Ok(data::property_text(&objects, "VMHost").into_iter().next())
    }

    // ─── Cache Refreshers ────────────────────────────────────────────

    /// Force the manager to re-read a VM that changed underneath it.
    pub async fn refresh_vm(&self, name: &str) -> ScvmmResult<()> {
        info!("Refreshing SCVMM view of VM '{}'", name);
        let script = format!(
            "$vm = Get-SCVirtualMachine -Name '{}'\nRead-SCVirtualMachine -VM $vm",
            PsScripts::escape(name)
        );
        self.run_script(&script).await?;
        Ok(())
    }

    /// Force the manager to re-read all VMs on a host.
    pub async fn refresh_host(&self, host: &str) -> ScvmmResult<()> {
        info!("Refreshing SCVMM view of host '{}'", host);
        let script = format!(
            "Read-SCVirtualMachine -VMHost '{}'",
            PsScripts::escape(host)
        );
        self.run_script(&script).await?;
        Ok(())
    }

    /// Re-scan the library share. Must follow template mutations —
    /// without it existence checks can observe the stale cache.
    pub async fn refresh_library(&self) -> ScvmmResult<()> {
        info!("Refreshing SCVMM library share '{}'", self.config.library_share);
        let script = format!(
            "$lib = Get-SCLibraryShare | where {{$_.name -eq '{}'}}\n\
             Read-SCLibraryShare -LibraryShare $lib[0] -Path VHDs -RunAsynchronously",
            PsScripts::escape(&self.config.library_share)
        );
        self.run_script(&script).await?;
        Ok(())
    }

    // ─── Guest Integration ───────────────────────────────────────────

    /// Enable the Guest Service Interface on the VM's Hyper-V host,
    /// then re-read the VM so the manager notices.
    pub async fn enable_virtual_services(&self, name: &str) -> ScvmmResult<()> {
        let script = format!(
            "$vm = Get-SCVirtualMachine -Name '{vm}'\n\
             $pwd = ConvertTo-SecureString '{password}' -AsPlainText -Force\n\
             $creds = New-Object System.Management.Automation.PSCredential('LOCAL\\{user}', $pwd)\n\
             Invoke-Command -ComputerName $vm.HostName -Credential $creds -ScriptBlock {{\n\
                 Enable-VMIntegrationService -Name 'Guest Service Interface' -VMName '{vm}' }}\n\
             Read-SCVirtualMachine -VM $vm",
            vm = PsScripts::escape(name),
            password = PsScripts::escape(&self.config.password),
            user = PsScripts::escape(&self.config.username),
        );
        self.run_script(&script).await?;
        Ok(())
    }

    // ─── IP Discovery ────────────────────────────────────────────────

    /// Raw adapter address listing with PowerShell's brace decoration
    /// stripped.
    pub async fn current_ip_address(&self, name: &str) -> ScvmmResult<String> {
        let script = format!(
            "Get-SCVirtualMachine -Name '{}' -VMMServer $scvmm_server |\
             Get-SCVirtualNetworkAdapter | Select IPv4Addresses |\
             ft -HideTableHeaders",
            PsScripts::escape(name)
        );
        let reply = self.run_script(&script).await?;
        Ok(reply.replace(['{', '}'], ""))
    }

    /// IPv4 address of a VM, forcing a refresh first to absorb delayed
    /// status changes. `None` when no address is assigned yet.
    pub async fn ip_address(&self, name: &str) -> ScvmmResult<Option<String>> {
        self.refresh_vm(name).await?;
        let raw = self.current_ip_address(name).await?;
        if ipv4_regex().is_match(&raw) {
            Ok(Some(raw))
        } else {
            Ok(None)
        }
    }

    // ─── DVD Drives ──────────────────────────────────────────────────

    /// Detach DVD drives one at a time until none remain, returning how
    /// many were removed. Bounded by `dvd_detach_limit`; a drive that
    /// never detaches surfaces as a `Timeout` error.
    pub async fn disconnect_dvd_drives(&self, name: &str) -> ScvmmResult<u32> {
        let script = format!(
            "$VM = Get-SCVirtualMachine -Name '{}' -VMMServer $scvmm_server\n\
             $DVDDrive = Get-SCVirtualDVDDrive -VM $VM\n\
             $DVDDrive[0] | Remove-SCVirtualDVDDrive",
            PsScripts::escape(name)
        );

        let mut detached = 0u32;
        loop {
            let details = self.vm_data(name).await?;
            let remaining = details
                .get("VirtualDVDDrives")
                .map(|v| !v.is_null())
                .unwrap_or(false);
            if !remaining {
                return Ok(detached);
            }
            if detached >= self.config.dvd_detach_limit {
                return Err(ScvmmError::timeout("disconnect_dvd_drives"));
            }
            self.run_script(&script).await?;
            detached += 1;
        }
    }
}

// ─── Timestamp Conversion ────────────────────────────────────────────

fn ipv4_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[0-9]+(?:\.[0-9]+){3}").expect("valid literal pattern"))
}

/// Parse a manager-reported local timestamp (`MM/DD/YYYY hh:mm:ss AM|PM`)
/// in the given zone and convert it to UTC. DST-ambiguous times resolve
/// to the earlier instant; nonexistent local times are a parse error.
pub fn parse_manager_timestamp<Tz: TimeZone>(
    raw: &str,
    tz: &Tz,
) -> ScvmmResult<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), MANAGER_TIMESTAMP_FORMAT)
        .map_err(|e| ScvmmError::parse(format!("Bad manager timestamp '{}': {}", raw, e)))?;
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earlier, _) => Ok(earlier.with_timezone(&Utc)),
        LocalResult::None => Err(ScvmmError::parse(format!(
            "Manager timestamp '{}' does not exist in the local zone",
            raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn test_parse_manager_timestamp_fixed_offset() {
        let tz = FixedOffset::east_opt(2 * 3600).expect("offset");
        let utc = parse_manager_timestamp("07/15/2026 02:30:45 PM", &tz).unwrap();
        assert_eq!(utc.to_rfc3339(), "2026-07-15T12:30:45+00:00");
    }

    #[test]
    fn test_parse_manager_timestamp_morning() {
        let tz = FixedOffset::west_opt(5 * 3600).expect("offset");
        let utc = parse_manager_timestamp("01/02/2026 09:05:00 AM", &tz).unwrap();
        assert_eq!(utc.to_rfc3339(), "2026-01-02T14:05:00+00:00");
    }

    #[test]
    fn test_parse_manager_timestamp_rejects_garbage() {
        let tz = FixedOffset::east_opt(0).expect("offset");
        assert!(parse_manager_timestamp("yesterday", &tz).is_err());
        assert!(parse_manager_timestamp("2026-07-15 14:30:45", &tz).is_err());
    }

    #[test]
    fn test_ipv4_regex_matches_addresses() {
        assert!(ipv4_regex().is_match("192.168.1.10"));
        assert!(!ipv4_regex().is_match("no address yet"));
    }
}
