//! WS-Management Shell SOAP/HTTP transport.
//!
//! Runs PowerShell on a remote Windows host through the WinRM shell
//! resource: create shell, issue `powershell.exe -EncodedCommand`,
//! poll Receive until the command completes, then tear the shell down.

use crate::error::{WinRmError, WinRmResult};
use crate::types::{PsOutput, WinRmConfig};
use async_trait::async_trait;
use log::{debug, trace, warn};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use std::time::Duration;
use uuid::Uuid;

// ─── Constants ───────────────────────────────────────────────────────

const NS_SOAP: &str = "http://www.w3.org/2003/05/soap-envelope";
const NS_WSA: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const NS_WSMAN: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const NS_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";

const RESOURCE_CMD_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";

const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";
const COMMAND_STATE_DONE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done";

// ─── Execution Seam ──────────────────────────────────────────────────

/// Capability to run a PowerShell script on the managed endpoint.
///
/// The management crates depend on this trait only, so orchestration can
/// be exercised against recording fakes.
#[async_trait]
pub trait ShellTransport: Send + Sync {
    async fn run_powershell(&self, script: &str) -> WinRmResult<PsOutput>;
}

// ─── Transport ───────────────────────────────────────────────────────

/// WinRM shell transport over HTTP(S).
pub struct WinRmTransport {
    client: reqwest::Client,
    endpoint: String,
    auth_header: Option<String>,
    operation_timeout: String,
}

impl WinRmTransport {
    /// Create a new transport from a connection config.
    pub fn new(config: &WinRmConfig) -> WinRmResult<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(10)))
            .connect_timeout(Duration::from_secs(15));

        if config.skip_cert_check {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().map_err(|e| {
            WinRmError::connection(format!("Failed to build HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            endpoint: config.endpoint_uri(),
            auth_header: Self::build_auth_header(config),
            operation_timeout: format!("PT{}S", config.timeout_secs),
        })
    }

    /// Build a Basic auth header from the configured credential.
    fn build_auth_header(config: &WinRmConfig) -> Option<String> {
        let cred = config.credential.as_ref()?;
        let encoded = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            format!("{}:{}", cred.qualified_username(), cred.password),
        );
        Some(format!("Basic {}", encoded))
    }

    /// Endpoint this transport talks to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    // ─── HTTP Layer ──────────────────────────────────────────────────

    /// Send a SOAP envelope and return the response body.
    async fn send_message(&self, envelope: &str) -> WinRmResult<String> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/soap+xml;charset=UTF-8"),
        );
        if let Some(ref auth) = self.auth_header {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                HeaderValue::from_str(auth)
                    .map_err(|e| WinRmError::protocol(format!("Invalid auth header: {}", e)))?,
            );
        }

        debug!("WinRM request to {} ({} bytes)", self.endpoint, envelope.len());
        trace!("WinRM request body:\n{}", envelope);

        let resp = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .body(envelope.to_string())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WinRmError::timeout("WinRM request")
                } else {
                    WinRmError::connection(format!("WinRM HTTP request failed: {}", e))
                }
            })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| {
            WinRmError::connection(format!("Failed to read WinRM response: {}", e))
        })?;

        trace!("WinRM response: status={}, {} bytes", status, body.len());

        if status.as_u16() == 401 {
            return Err(WinRmError::auth("WinRM endpoint rejected credentials"));
        }
        if !status.is_success() {
            let fault = parse_soap_fault(&body)
                .unwrap_or_else(|| format!("HTTP error {}", status.as_u16()));
            return Err(WinRmError::with_details(
                crate::error::WinRmErrorKind::SoapFault,
                fault,
                format!("HTTP {}", status.as_u16()),
            ));
        }
        if body.contains(":Fault") || body.contains("<Fault") {
            let fault =
                parse_soap_fault(&body).unwrap_or_else(|| "Unknown SOAP fault".to_string());
            return Err(WinRmError::soap_fault(fault));
        }

        Ok(body)
    }

    // ─── Shell Operations ────────────────────────────────────────────

    /// Create a remote cmd shell, returning its shell ID.
    async fn create_shell(&self) -> WinRmResult<String> {
        let message_id = Uuid::new_v4().to_string();
        let envelope = build_create_shell_envelope(
            &self.endpoint,
            &message_id,
            &self.operation_timeout,
        );
        let response = self.send_message(&envelope).await?;
        let shell_id = extract_shell_id(&response)
            .ok_or_else(|| WinRmError::protocol("No ShellId in Create response"))?;
        debug!("Created WinRM shell {}", shell_id);
        Ok(shell_id)
    }

    /// Delete (close) a shell.
    async fn delete_shell(&self, shell_id: &str) -> WinRmResult<()> {
        let message_id = Uuid::new_v4().to_string();
        let envelope = build_delete_shell_envelope(
            &self.endpoint,
            &message_id,
            shell_id,
            &self.operation_timeout,
        );
        self.send_message(&envelope).await?;
        debug!("Deleted WinRM shell {}", shell_id);
        Ok(())
    }

    /// Launch `powershell.exe -EncodedCommand` and return the command ID.
    async fn execute_ps(&self, shell_id: &str, script: &str) -> WinRmResult<String> {
        let message_id = Uuid::new_v4().to_string();
        let encoded = encode_ps_command(script);
        let envelope = build_command_envelope(
            &self.endpoint,
            &message_id,
            shell_id,
            "powershell.exe",
            &[
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-EncodedCommand".to_string(),
                encoded,
            ],
            &self.operation_timeout,
        );
        let response = self.send_message(&envelope).await?;
        extract_command_id(&response)
            .ok_or_else(|| WinRmError::protocol("No CommandId in Command response"))
    }

    /// Poll Receive until the command completes; returns collected output.
    async fn receive_all(&self, shell_id: &str, command_id: &str) -> WinRmResult<PsOutput> {
        let mut stdout = String::new();
        let mut stderr = String::new();

        loop {
            let message_id = Uuid::new_v4().to_string();
            let envelope = build_receive_envelope(
                &self.endpoint,
                &message_id,
                shell_id,
                command_id,
                &self.operation_timeout,
            );
            let response = self.send_message(&envelope).await?;
            let chunk = parse_receive_response(&response);
            stdout.push_str(&chunk.stdout);
            stderr.push_str(&chunk.stderr);

            if chunk.done {
                return Ok(PsOutput {
                    stdout,
                    stderr,
                    exit_code: chunk.exit_code.unwrap_or(-1),
                });
            }
        }
    }

    /// Signal command termination; failure here is non-fatal.
    async fn signal_terminate(&self, shell_id: &str, command_id: &str) {
        let message_id = Uuid::new_v4().to_string();
        let envelope = build_signal_envelope(
            &self.endpoint,
            &message_id,
            shell_id,
            command_id,
            SIGNAL_TERMINATE,
            &self.operation_timeout,
        );
        if let Err(e) = self.send_message(&envelope).await {
            warn!("Failed to signal command {}: {}", command_id, e);
        }
    }
}

#[async_trait]
impl ShellTransport for WinRmTransport {
    async fn run_powershell(&self, script: &str) -> WinRmResult<PsOutput> {
        let shell_id = self.create_shell().await?;

        let result = async {
            let command_id = self.execute_ps(&shell_id, script).await?;
            let output = self.receive_all(&shell_id, &command_id).await?;
            self.signal_terminate(&shell_id, &command_id).await;
            Ok(output)
        }
        .await;

        // The shell is closed regardless of command outcome.
        if let Err(e) = self.delete_shell(&shell_id).await {
            warn!("Failed to delete shell {}: {}", shell_id, e);
        }

        result
    }
}

// ─── Envelope Builders ───────────────────────────────────────────────

fn build_soap_header(
    action: &str,
    endpoint: &str,
    message_id: &str,
    shell_id: Option<&str>,
    timeout: &str,
) -> String {
    let mut header = format!(
        r#"<s:Header>
      <a:To>{endpoint}</a:To>
      <a:Action s:mustUnderstand="true">{action}</a:Action>
      <w:ResourceURI s:mustUnderstand="true">{resource}</w:ResourceURI>
      <a:MessageID>uuid:{message_id}</a:MessageID>
      <a:ReplyTo>
        <a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
      </a:ReplyTo>
      <w:OperationTimeout>{timeout}</w:OperationTimeout>"#,
        endpoint = endpoint,
        action = action,
        resource = RESOURCE_CMD_SHELL,
        message_id = message_id,
        timeout = timeout,
    );

    if let Some(sid) = shell_id {
        header.push_str(&format!(
            r#"
      <w:SelectorSet>
        <w:Selector Name="ShellId">{}</w:Selector>
      </w:SelectorSet>"#,
            sid
        ));
    }

    header.push_str("\n    </s:Header>");
    header
}

fn wrap_envelope(header: &str, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{soap}" xmlns:a="{addr}" xmlns:w="{wsman}" xmlns:rsp="{shell}">
    {header}
    <s:Body>
      {body}
    </s:Body>
</s:Envelope>"#,
        soap = NS_SOAP,
        addr = NS_WSA,
        wsman = NS_WSMAN,
        shell = NS_SHELL,
        header = header,
        body = body,
    )
}

fn build_create_shell_envelope(endpoint: &str, message_id: &str, timeout: &str) -> String {
    let header = build_soap_header(ACTION_CREATE, endpoint, message_id, None, timeout);
    let body = r#"<rsp:Shell>
        <rsp:InputStreams>stdin</rsp:InputStreams>
        <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>
        <w:OptionSet xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd">
          <w:Option Name="WINRS_NOPROFILE">TRUE</w:Option>
          <w:Option Name="WINRS_CODEPAGE">65001</w:Option>
        </w:OptionSet>
      </rsp:Shell>"#;
    wrap_envelope(&header, body)
}

fn build_delete_shell_envelope(
    endpoint: &str,
    message_id: &str,
    shell_id: &str,
    timeout: &str,
) -> String {
    let header = build_soap_header(ACTION_DELETE, endpoint, message_id, Some(shell_id), timeout);
    wrap_envelope(&header, "")
}

fn build_command_envelope(
    endpoint: &str,
    message_id: &str,
    shell_id: &str,
    command: &str,
    arguments: &[String],
    timeout: &str,
) -> String {
    let header = build_soap_header(ACTION_COMMAND, endpoint, message_id, Some(shell_id), timeout);

    let args_xml: String = arguments
        .iter()
        .map(|a| format!("<rsp:Arguments>{}</rsp:Arguments>", xml_escape(a)))
        .collect::<Vec<_>>()
        .join("\n        ");

    let body = format!(
        r#"<rsp:CommandLine>
        <rsp:Command>{command}</rsp:Command>
        {args}
      </rsp:CommandLine>"#,
        command = xml_escape(command),
        args = args_xml,
    );

    wrap_envelope(&header, &body)
}

fn build_receive_envelope(
    endpoint: &str,
    message_id: &str,
    shell_id: &str,
    command_id: &str,
    timeout: &str,
) -> String {
    let header = build_soap_header(ACTION_RECEIVE, endpoint, message_id, Some(shell_id), timeout);
    let body = format!(
        r#"<rsp:Receive>
        <rsp:DesiredStream CommandId="{command_id}">stdout stderr</rsp:DesiredStream>
      </rsp:Receive>"#,
        command_id = command_id,
    );
    wrap_envelope(&header, &body)
}

fn build_signal_envelope(
    endpoint: &str,
    message_id: &str,
    shell_id: &str,
    command_id: &str,
    signal_code: &str,
    timeout: &str,
) -> String {
    let header = build_soap_header(ACTION_SIGNAL, endpoint, message_id, Some(shell_id), timeout);
    let body = format!(
        r#"<rsp:Signal CommandId="{command_id}">
        <rsp:Code>{signal}</rsp:Code>
      </rsp:Signal>"#,
        command_id = command_id,
        signal = signal_code,
    );
    wrap_envelope(&header, &body)
}

// ─── Response Parsing ────────────────────────────────────────────────

/// One Receive round: decoded streams plus completion state.
#[derive(Debug, Default)]
struct ReceiveChunk {
    stdout: String,
    stderr: String,
    done: bool,
    exit_code: Option<i32>,
}

fn extract_shell_id(response: &str) -> Option<String> {
    // <rsp:ShellId> element form
    let pattern = "<rsp:ShellId>";
    if let Some(start) = response.find(pattern) {
        let rest = &response[start + pattern.len()..];
        if let Some(end) = rest.find('<') {
            return Some(rest[..end].to_string());
        }
    }
    // ShellId="..." attribute form
    let pattern2 = "ShellId=\"";
    if let Some(start) = response.find(pattern2) {
        let rest = &response[start + pattern2.len()..];
        if let Some(end) = rest.find('"') {
            return Some(rest[..end].to_string());
        }
    }
    None
}

fn extract_command_id(response: &str) -> Option<String> {
    let pattern = "<rsp:CommandId>";
    if let Some(start) = response.find(pattern) {
        let rest = &response[start + pattern.len()..];
        if let Some(end) = rest.find('<') {
            return Some(rest[..end].to_string());
        }
    }
    let pattern2 = "CommandId=\"";
    if let Some(start) = response.find(pattern2) {
        let rest = &response[start + pattern2.len()..];
        if let Some(end) = rest.find('"') {
            return Some(rest[..end].to_string());
        }
    }
    None
}

fn parse_receive_response(response: &str) -> ReceiveChunk {
    let mut chunk = ReceiveChunk::default();

    extract_stream_data(response, "stdout", &mut chunk.stdout);
    extract_stream_data(response, "stderr", &mut chunk.stderr);

    chunk.done = response.contains(COMMAND_STATE_DONE);
    if chunk.done {
        let pattern = "<rsp:ExitCode>";
        if let Some(start) = response.find(pattern) {
            let rest = &response[start + pattern.len()..];
            if let Some(end) = rest.find('<') {
                chunk.exit_code = rest[..end].trim().parse().ok();
            }
        }
    }

    chunk
}

/// Decode the base64 payloads of every stream element with the given name.
fn extract_stream_data(response: &str, stream_name: &str, output: &mut String) {
    let pattern = format!("Name=\"{}\"", stream_name);
    let mut search_from = 0;

    while let Some(attr_pos) = response[search_from..].find(&pattern) {
        let abs_pos = search_from + attr_pos;
        let Some(gt_pos) = response[abs_pos..].find('>') else {
            break;
        };
        // Self-closing stream elements carry no payload.
        if response[abs_pos..abs_pos + gt_pos].ends_with('/') {
            search_from = abs_pos + gt_pos + 1;
            continue;
        }
        let data_start = abs_pos + gt_pos + 1;
        let Some(end_pos) = response[data_start..].find("</rsp:Stream>") else {
            break;
        };
        let encoded = response[data_start..data_start + end_pos].trim();
        if !encoded.is_empty() {
            if let Ok(decoded) =
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
            {
                output.push_str(&String::from_utf8_lossy(&decoded));
            }
        }
        search_from = data_start + end_pos;
    }
}

/// Extract a human-readable fault message from a WinRM error response.
fn parse_soap_fault(response: &str) -> Option<String> {
    if let Some(start) = response.find("Message=\"") {
        let rest = &response[start + 9..];
        if let Some(end) = rest.find('"') {
            return Some(rest[..end].to_string());
        }
    }
    if let Some(start) = response.find("<s:Text") {
        if let Some(gt) = response[start..].find('>') {
            let text_start = start + gt + 1;
            if let Some(end) = response[text_start..].find("</s:Text>") {
                return Some(response[text_start..text_start + end].to_string());
            }
        }
    }
    if let Some(start) = response.find("<faultstring>") {
        let text_start = start + 13;
        if let Some(end) = response[text_start..].find("</faultstring>") {
            return Some(response[text_start..text_start + end].to_string());
        }
    }
    None
}

/// Encode a script as UTF-16LE base64 for `powershell.exe -EncodedCommand`.
fn encode_ps_command(script: &str) -> String {
    let utf16: Vec<u8> = script
        .encode_utf16()
        .flat_map(|c| c.to_le_bytes())
        .collect();
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, utf16)
}

/// XML-escape a string for inclusion in SOAP envelopes.
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_ps_command() {
        // "dir" in UTF-16LE: 64 00 69 00 72 00
        assert_eq!(encode_ps_command("dir"), "ZABpAHIA");
    }

    #[test]
    fn test_extract_shell_id_element() {
        let xml = "<rsp:Shell><rsp:ShellId>ABC-123</rsp:ShellId></rsp:Shell>";
        assert_eq!(extract_shell_id(xml).as_deref(), Some("ABC-123"));
    }

    #[test]
    fn test_extract_command_id_element() {
        let xml = "<rsp:CommandResponse><rsp:CommandId>CMD-9</rsp:CommandId></rsp:CommandResponse>";
        assert_eq!(extract_command_id(xml).as_deref(), Some("CMD-9"));
    }

    #[test]
    fn test_parse_receive_response_streams() {
        // base64("hello") = aGVsbG8=, base64("oops") = b29wcw==
        let xml = format!(
            r#"<rsp:ReceiveResponse>
                <rsp:Stream Name="stdout" CommandId="C">aGVsbG8=</rsp:Stream>
                <rsp:Stream Name="stderr" CommandId="C">b29wcw==</rsp:Stream>
                <rsp:CommandState CommandId="C" State="{}">
                  <rsp:ExitCode>2</rsp:ExitCode>
                </rsp:CommandState>
              </rsp:ReceiveResponse>"#,
            COMMAND_STATE_DONE
        );
        let chunk = parse_receive_response(&xml);
        assert_eq!(chunk.stdout, "hello");
        assert_eq!(chunk.stderr, "oops");
        assert!(chunk.done);
        assert_eq!(chunk.exit_code, Some(2));
    }

    #[test]
    fn test_parse_receive_response_pending() {
        let xml = r#"<rsp:ReceiveResponse>
                <rsp:Stream Name="stdout" CommandId="C">aGVsbG8=</rsp:Stream>
              </rsp:ReceiveResponse>"#;
        let chunk = parse_receive_response(xml);
        assert_eq!(chunk.stdout, "hello");
        assert!(!chunk.done);
        assert_eq!(chunk.exit_code, None);
    }

    #[test]
    fn test_parse_soap_fault() {
        let xml = r#"<s:Fault><s:Reason><s:Text xml:lang="en-US">Access denied</s:Text></s:Reason></s:Fault>"#;
        assert_eq!(parse_soap_fault(xml).as_deref(), Some("Access denied"));
    }

    #[test]
    fn test_command_envelope_contains_encoded_args() {
        let envelope = build_command_envelope(
            "http://host:5985/wsman",
            "msg-1",
            "SHELL-1",
            "powershell.exe",
            &["-EncodedCommand".to_string(), "ZABpAHIA".to_string()],
            "PT60S",
        );
        assert!(envelope.contains("<rsp:Command>powershell.exe</rsp:Command>"));
        assert!(envelope.contains("<rsp:Arguments>ZABpAHIA</rsp:Arguments>"));
        assert!(envelope.contains(r#"<w:Selector Name="ShellId">SHELL-1</w:Selector>"#));
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(
            xml_escape(r#"a & <b> "c""#),
            "a &amp; &lt;b&gt; &quot;c&quot;"
        );
    }
}
