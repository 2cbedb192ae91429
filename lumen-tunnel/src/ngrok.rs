use crate::error::{Result, TunnelError};
use crate::manager::TunnelHandle;
use crate::provider::TunnelProvider;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;

const NGROK_PROVIDER_ID: &str = "ngrok";
const NGROK_AUTHTOKEN_ENV: &str = "NGROK_AUTHTOKEN";
const NGROK_TUNNEL_NAME_PREFIX: &str = "lumen";
const AGENT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const AGENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const AGENT_STDERR_MAX_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct NgrokAgentConfig {
    /// Path to the `ngrok` binary.
    pub binary: PathBuf,
    /// Address of the agent's local API (`web_addr` in the agent config).
    pub api_addr: String,
    pub startup_timeout: Duration,
}

impl Default for NgrokAgentConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ngrok"),
            api_addr: "127.0.0.1:4040".to_string(),
            startup_timeout: Duration::from_secs(15),
        }
    }
}

/// Drives a local `ngrok` agent process through its HTTP API.
pub struct NgrokAgent {
    config: NgrokAgentConfig,
    api: AgentApi,
    process: Mutex<Option<AgentProcess>>,
}

/// A running agent plus the config file it was started with. The file must
/// outlive the process.
struct AgentProcess {
    child: Child,
    _config_file: NamedTempFile,
}

impl NgrokAgent {
    pub fn new(config: NgrokAgentConfig) -> Result<Self> {
        let api = AgentApi::new(&format!("http://{}", config.api_addr))?;
        Ok(Self {
            config,
            api,
            process: Mutex::new(None),
        })
    }

    /// Another agent answering on our API address would mask a failed spawn.
    async fn ensure_api_addr_free(&self) -> Result<()> {
        match self.api.list_tunnels().await {
            Ok(_) => Err(TunnelError::Auth(format!(
                "ngrok agent api address {} is already served by another process",
                self.config.api_addr
            ))),
            Err(_) => Ok(()),
        }
    }

    async fn wait_until_ready(&self, child: &mut Child) -> Result<()> {
        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let stderr = read_stderr(child).await;
                    return Err(TunnelError::Auth(format!(
                        "ngrok agent exited during startup with {status}: {stderr}"
                    )));
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(TunnelError::Auth(format!("ngrok agent wait failed: {e}")));
                }
            }

            match self.api.list_tunnels().await {
                Ok(_) => return Ok(()),
                Err(e) => tracing::debug!(error = %e, "ngrok agent api not ready yet"),
            }

            if Instant::now() >= deadline {
                return Err(TunnelError::Auth(format!(
                    "ngrok agent api at {} not ready after {}s",
                    self.config.api_addr,
                    self.config.startup_timeout.as_secs()
                )));
            }
            tokio::time::sleep(AGENT_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl TunnelProvider for NgrokAgent {
    fn provider_id(&self) -> &str {
        NGROK_PROVIDER_ID
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn authenticate(&self, token: &str) -> Result<()> {
        let mut guard = self.process.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        self.ensure_api_addr_free().await?;

        let config_file = write_agent_config(&self.config.api_addr)?;
        let mut child = Command::new(&self.config.binary)
            .args(agent_args(config_file.path()))
            .env(NGROK_AUTHTOKEN_ENV, token)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TunnelError::Auth(format!(
                    "spawn {} failed: {e}",
                    self.config.binary.display()
                ))
            })?;
        tracing::info!(pid = ?child.id(), api_addr = %self.config.api_addr, "ngrok agent spawned");

        if let Err(e) = self.wait_until_ready(&mut child).await {
            if let Err(kill_err) = child.kill().await {
                tracing::warn!(error = %kill_err, "ngrok agent kill failed");
            }
            return Err(e);
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }
        *guard = Some(AgentProcess {
            child,
            _config_file: config_file,
        });
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn open(&self, local_port: u16) -> Result<String> {
        let tunnel = self
            .api
            .start_tunnel(&tunnel_name(local_port), local_port)
            .await?;
        Ok(tunnel.public_url)
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn close_tunnel(&self, handle: &TunnelHandle) -> Result<()> {
        self.api.stop_tunnel(&tunnel_name(handle.local_port)).await
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn shutdown(&self) -> Result<()> {
        let Some(mut process) = self.process.lock().await.take() else {
            return Ok(());
        };
        process
            .child
            .kill()
            .await
            .map_err(|e| TunnelError::Connect(format!("kill ngrok agent: {e}")))?;
        tracing::info!("ngrok agent stopped");
        Ok(())
    }
}

fn tunnel_name(local_port: u16) -> String {
    format!("{NGROK_TUNNEL_NAME_PREFIX}-{local_port}")
}

/// Agent config pinning the local API to `api_addr`. The `version: "2"`
/// layout is read by both v2 and v3 agents.
fn agent_config_yaml(api_addr: &str) -> String {
    format!("version: \"2\"\nweb_addr: {api_addr}\n")
}

fn write_agent_config(api_addr: &str) -> Result<NamedTempFile> {
    let write = || -> std::io::Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("lumen-ngrok-")
            .suffix(".yml")
            .tempfile()?;
        file.write_all(agent_config_yaml(api_addr).as_bytes())?;
        file.flush()?;
        Ok(file)
    };
    write().map_err(|e| TunnelError::Auth(format!("write ngrok agent config: {e}")))
}

fn agent_args(config_path: &Path) -> Vec<std::ffi::OsString> {
    let mut args: Vec<std::ffi::OsString> = ["start", "--none", "--log", "false", "--config"]
        .into_iter()
        .map(Into::into)
        .collect();
    args.push(config_path.as_os_str().to_owned());
    args
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(target: "lumen_tunnel::agent", "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "ngrok agent stderr closed");
                break;
            }
        }
    }
}

async fn read_stderr(child: &mut Child) -> String {
    let Some(stderr) = child.stderr.take() else {
        return String::new();
    };
    let mut buf = Vec::new();
    let mut limited = stderr.take(AGENT_STDERR_MAX_BYTES as u64);
    if let Err(e) = limited.read_to_end(&mut buf).await {
        tracing::debug!(error = %e, "reading ngrok agent stderr failed");
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

/// Client for the agent's local tunnel API (`/api/tunnels`).
#[derive(Clone)]
pub struct AgentApi {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentTunnel {
    pub name: String,
    pub public_url: String,
    #[serde(default)]
    pub proto: String,
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    #[serde(default)]
    tunnels: Vec<AgentTunnel>,
}

#[derive(Debug, Serialize)]
struct StartTunnelRequest<'a> {
    name: &'a str,
    addr: String,
    proto: &'static str,
}

#[derive(Debug, Deserialize)]
struct AgentErrorBody {
    #[serde(default)]
    msg: String,
}

impl AgentApi {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(AGENT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TunnelError::Connect(format!("build agent http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn tunnels_url(&self) -> String {
        format!("{}/api/tunnels", self.base_url)
    }

    pub async fn list_tunnels(&self) -> Result<Vec<AgentTunnel>> {
        let response = self
            .http
            .get(self.tunnels_url())
            .send()
            .await
            .map_err(|e| TunnelError::Connect(format!("ngrok agent unreachable: {e}")))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(agent_error("list tunnels", status, &body));
        }
        let parsed: TunnelList = serde_json::from_str(&body)
            .map_err(|e| TunnelError::Connect(format!("ngrok tunnel list parse error: {e}")))?;
        Ok(parsed.tunnels)
    }

    pub async fn start_tunnel(&self, name: &str, local_port: u16) -> Result<AgentTunnel> {
        let req = StartTunnelRequest {
            name,
            addr: local_port.to_string(),
            proto: "http",
        };
        let response = self
            .http
            .post(self.tunnels_url())
            .json(&req)
            .send()
            .await
            .map_err(|e| TunnelError::Connect(format!("ngrok agent unreachable: {e}")))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(agent_error("start tunnel", status, &body));
        }

        let tunnel: AgentTunnel = serde_json::from_str(&body)
            .map_err(|e| TunnelError::Connect(format!("ngrok tunnel parse error: {e}")))?;
        if tunnel.public_url.trim().is_empty() {
            return Err(TunnelError::Connect(
                "ngrok returned an empty public url".to_string(),
            ));
        }
        if tunnel.public_url.starts_with("https://") {
            return Ok(tunnel);
        }

        // Older agents open a pair: `<name>` on https and `<name> (http)`.
        let https = self
            .list_tunnels()
            .await
            .ok()
            .and_then(|all| {
                all.into_iter()
                    .find(|t| t.name == name && t.public_url.starts_with("https://"))
            });
        Ok(https.unwrap_or(tunnel))
    }

    pub async fn stop_tunnel(&self, name: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/{name}", self.tunnels_url()))
            .send()
            .await
            .map_err(|e| TunnelError::Connect(format!("ngrok agent unreachable: {e}")))?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(agent_error("stop tunnel", status, &body))
    }
}

fn agent_error(action: &str, status: reqwest::StatusCode, body: &str) -> TunnelError {
    let msg = serde_json::from_str::<AgentErrorBody>(body)
        .ok()
        .map(|b| b.msg)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| body.trim().to_string());
    TunnelError::Connect(format!("ngrok {action} status={status}: {msg}"))
}
