//! Readiness probes for external tools a sandbox depends on (a device
//! driver server, a browser, ...).

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::errors::SupervisorError;
use crate::models::Platform;

const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const COMMAND_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How readiness of a tool is checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ToolCheck {
    /// GET must return a 2xx status.
    Http { url: String },
    /// A TCP connection to `host:port` must succeed.
    Tcp { address: String },
    /// `sh -c <command>` must exit 0.
    Command { command: String },
}

/// One `[[supervisor.tools]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    /// Tasks on this platform require the tool. `auto-detect` means every task.
    #[serde(default)]
    pub platform: Platform,
    #[serde(flatten)]
    pub check: ToolCheck,
}

impl ToolSpec {
    pub fn applies_to(&self, platform: Platform) -> bool {
        platform.covers(self.platform)
    }

    /// Run the check once.
    pub async fn check_once(&self, client: &reqwest::Client) -> bool {
        match &self.check {
            ToolCheck::Http { url } => match client.get(url).timeout(HTTP_PROBE_TIMEOUT).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(e) => {
                    tracing::trace!(tool = %self.name, error = %e, "HTTP probe failed");
                    false
                }
            },
            ToolCheck::Tcp { address } => matches!(
                tokio::time::timeout(TCP_PROBE_TIMEOUT, tokio::net::TcpStream::connect(address))
                    .await,
                Ok(Ok(_))
            ),
            ToolCheck::Command { command } => {
                let child = Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status();
                matches!(
                    tokio::time::timeout(COMMAND_PROBE_TIMEOUT, child).await,
                    Ok(Ok(status)) if status.success()
                )
            }
        }
    }

    /// Poll until the tool answers or `limit` has passed.
    pub async fn wait_until_ready(
        &self,
        client: &reqwest::Client,
        limit: Duration,
        interval: Duration,
    ) -> Result<(), SupervisorError> {
        let start = Instant::now();
        loop {
            if self.check_once(client).await {
                tracing::debug!(tool = %self.name, waited_ms = start.elapsed().as_millis() as u64, "Tool ready");
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= limit {
                return Err(SupervisorError::ToolUnavailable {
                    tool: self.name.clone(),
                    waited,
                });
            }
            tokio::time::sleep(interval.min(limit - waited)).await;
        }
    }
}
