//! Child-process connector for the tool's MCP server.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::{CallResult, ConnectError, TransportError, TransportResult};
use super::protocol::{Implementation, ToolInfo};
use super::session::{Connector, McpSession, Response, Session};
use super::transport::RpcTransport;
use crate::config::ToolConfig;
use crate::manifest::DbtCli;

/// Spawns the configured server command and performs the handshake.
///
/// The child runs in the project directory with `DBT_PROJECT_DIR`,
/// `DBT_PROFILES_DIR` and `DBT_PATH` set. If the connect future is dropped
/// before it resolves, the child is killed.
#[derive(Debug, Clone)]
pub struct StdioConnector {
    config: ToolConfig,
}

impl StdioConnector {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    fn spawn(&self) -> TransportResult<Child> {
        Command::new(&self.config.command)
            .args(&self.config.args)
            .current_dir(&self.config.project_dir)
            .envs(self.config.environment())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(TransportError::SpawnFailed)
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(&self) -> Result<Box<dyn Session>, ConnectError> {
        if self.config.prepare_manifest {
            let cli = DbtCli::from_config(&self.config);
            // The server can still start without a manifest; it just has fewer verbs
            if let Err(e) = cli.ensure_manifest().await {
                warn!(error = %e, "dbt parse failed, starting tool anyway");
            }
        }

        info!(
            command = %self.config.command,
            project_dir = %self.config.project_dir.display(),
            "starting semantic-layer tool"
        );
        let mut child = self.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConnectError::failed("tool stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectError::failed("tool stdout not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr);
        }

        let transport = RpcTransport::new(stdout, stdin);
        let session = McpSession::handshake(transport).await?;

        Ok(Box::new(StdioSession {
            session,
            child: Mutex::new(Some(child)),
            grace: self.config.shutdown_grace,
        }))
    }
}

/// Relay the tool's stderr to the log, one line per event.
fn forward_stderr(stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                debug!(target: "headless_bi::tool::stderr", "{}", line);
            }
        }
    });
}

/// An MCP session that owns its child process.
struct StdioSession {
    session: McpSession,
    child: Mutex<Option<Child>>,
    grace: Duration,
}

#[async_trait]
impl Session for StdioSession {
    async fn call_tool(&self, verb: &str, arguments: Map<String, Value>) -> CallResult<Response> {
        self.session.call_tool(verb, arguments).await
    }

    async fn list_tools(&self) -> CallResult<Vec<ToolInfo>> {
        self.session.list_tools().await
    }

    /// Close stdin, give the process a grace period, then kill it.
    async fn shutdown(&self) -> TransportResult<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = self.session.shutdown().await {
            debug!(error = %e, "closing tool stdin failed");
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(%status, "tool exited");
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::ReadFailed(e)),
            Err(_) => {
                warn!(
                    grace_secs = self.grace.as_secs(),
                    "tool did not exit after stdin closed, killing it"
                );
                child.kill().await.map_err(TransportError::WriteFailed)
            }
        }
    }

    fn server_info(&self) -> Option<Implementation> {
        self.session.server_info()
    }
}
