//! Shared test fixtures: a recording fake transport and reply builders.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use virtfleet_scvmm::{ScvmmConfig, ScvmmSystem};
use virtfleet_winrm::{PsOutput, ShellTransport, WinRmResult};

/// Transport fake that records every script and replays queued replies.
/// When the queue runs dry it keeps answering with the default reply.
pub struct ScriptedTransport {
    calls: Mutex<Vec<String>>,
    replies: Mutex<VecDeque<PsOutput>>,
    default_reply: PsOutput,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::with_default(ok(""))
    }

    pub fn with_default(default_reply: PsOutput) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
            default_reply,
        }
    }

    /// Queue a successful reply with the given stdout.
    pub fn push_ok(&self, stdout: &str) {
        self.push(ok(stdout));
    }

    pub fn push(&self, output: PsOutput) {
        self.replies.lock().unwrap().push_back(output);
    }

    /// Every script issued so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Index of the first issued script containing `needle`.
    pub fn position_of(&self, needle: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.contains(needle))
    }

    /// How many issued scripts contain `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

#[async_trait]
impl ShellTransport for ScriptedTransport {
    async fn run_powershell(&self, script: &str) -> WinRmResult<PsOutput> {
        self.calls.lock().unwrap().push(script.to_string());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone());
        Ok(reply)
    }
}

pub fn ok(stdout: &str) -> PsOutput {
    PsOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

pub fn failed(exit_code: i32, stderr: &str) -> PsOutput {
    PsOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code,
    }
}

/// A `ConvertTo-Xml` reply carrying just a StatusString property.
pub fn status_xml(status: &str) -> String {
    format!(
        r#"<Objects><Object Type="Microsoft.SystemCenter.VirtualMachineManager.VM"><Property Name="StatusString" Type="System.String">{}</Property></Object></Objects>"#,
        status
    )
}

/// A system wired to the fake transport, polling without real sleeps.
pub fn test_system(transport: Arc<ScriptedTransport>) -> ScvmmSystem {
    let config = ScvmmConfig {
        hostname: "scvmm01".to_string(),
        username: "admin".to_string(),
        password: "hunter2".to_string(),
        domain: "CORP".to_string(),
        poll_interval_ms: 1,
        ..Default::default()
    };
    ScvmmSystem::with_transport(config, transport)
}
