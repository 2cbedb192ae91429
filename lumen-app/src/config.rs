//! Gateway configuration loader.
//!
//! Sources, lowest to highest precedence: built-in defaults, TOML file,
//! `.env` / process environment, interactive prompt (only for secrets still
//! blank). Missing secrets are not an error here; dependents check lazily.

use anyhow::Result;
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const NGROK_TOKEN_PROMPT: &str =
    "Enter your Ngrok Authtoken (from https://dashboard.ngrok.com/get-started/your-authtoken):";
const MODEL_KEY_PROMPT: &str = "Enter your Gemini API Key:";

/// A credential that never prints its value.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// `None` for blank input: blank means "feature disabled".
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into().trim().to_string();
        if value.is_empty() {
            None
        } else {
            Some(Self(value))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

/// Secrets pulled from the deployment context. Immutable after startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    pub tunnel_token: Option<Secret>,
    pub model_key: Option<Secret>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub tunnel: TunnelConfig,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_seconds: u64,
    pub max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            request_timeout_seconds: 30,
            max_in_flight: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub authtoken: Option<Secret>,
    /// Abort startup when the tunnel cannot be established.
    pub required: bool,
    pub agent_path: String,
    pub api_addr: String,
    pub startup_timeout_seconds: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            authtoken: None,
            required: false,
            agent_path: "ngrok".to_string(),
            api_addr: "127.0.0.1:4040".to_string(),
            startup_timeout_seconds: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub api_key: Option<Secret>,
    pub model: String,
    pub base_url: String,
    pub timeout_seconds: u64,
    /// Prompt used by the model route when the caller supplies none.
    pub test_prompt: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: lumen_llm::DEFAULT_MODEL.to_string(),
            base_url: lumen_llm::DEFAULT_BASE_URL.to_string(),
            timeout_seconds: lumen_llm::DEFAULT_TIMEOUT.as_secs(),
            test_prompt: "Hello, satisfy the request: say 'Hello from Colab!'".to_string(),
        }
    }
}

impl GatewayConfig {
    pub async fn load(path: Option<PathBuf>, interactive: bool) -> Result<Self> {
        load_dotenv();
        let mut cfg = Self::read(path).await?;
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        if interactive {
            cfg = tokio::task::spawn_blocking(move || {
                cfg.prompt_missing_secrets(ask_masked)?;
                Ok::<_, anyhow::Error>(cfg)
            })
            .await??;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// An explicitly named file must exist; the default path is optional.
    async fn read(path: Option<PathBuf>) -> Result<Self> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents, &path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                tracing::debug!(config_path = %path.display(), "no config file; using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        }
    }

    fn parse(contents: &str, path: &Path) -> Result<Self> {
        toml::from_str(contents).map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("NGROK_AUTHTOKEN").and_then(Secret::new) {
            self.tunnel.authtoken = Some(v);
        }
        if let Some(v) = lookup("GEMINI_API_KEY")
            .and_then(Secret::new)
            .or_else(|| lookup("VITE_GEMINI_API_KEY").and_then(Secret::new))
        {
            self.model.api_key = Some(v);
        }
        if let Some(v) = lookup("LUMEN_MODEL").filter(|v| !v.trim().is_empty()) {
            self.model.model = v.trim().to_string();
        }
        if let Some(v) = lookup("LUMEN_HOST").filter(|v| !v.trim().is_empty()) {
            self.server.host = v.trim().to_string();
        }
        if let Some(v) = lookup("LUMEN_PORT").filter(|v| !v.trim().is_empty()) {
            self.server.port = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("LUMEN_PORT={v:?} is not a valid port: {e}"))?;
        }
        Ok(())
    }

    /// Ask for secrets that are still blank. A blank answer keeps the feature off.
    fn prompt_missing_secrets(
        &mut self,
        mut ask: impl FnMut(&str) -> Result<Option<String>>,
    ) -> Result<()> {
        let credentials = self.credentials();
        if credentials.tunnel_token.is_none() {
            self.tunnel.authtoken = ask(NGROK_TOKEN_PROMPT)?.and_then(Secret::new);
        }
        if credentials.model_key.is_none() {
            self.model.api_key = ask(MODEL_KEY_PROMPT)?.and_then(Secret::new);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server.port must be > 0"));
        }
        if self.server.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.request_timeout_seconds must be > 0"));
        }
        if self.server.max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.max_in_flight must be > 0"));
        }
        if self.model.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("model.timeout_seconds must be > 0"));
        }
        // Otherwise the HTTP timeout answers first with a bare 408.
        if self.model.timeout_seconds >= self.server.request_timeout_seconds {
            return Err(anyhow::anyhow!(
                "model.timeout_seconds ({}) must be below server.request_timeout_seconds ({})",
                self.model.timeout_seconds,
                self.server.request_timeout_seconds
            ));
        }
        if self.model.model.trim().is_empty() {
            return Err(anyhow::anyhow!("model.model is required"));
        }
        if self.model.test_prompt.trim().is_empty() {
            return Err(anyhow::anyhow!("model.test_prompt must not be blank"));
        }
        if self.tunnel.startup_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("tunnel.startup_timeout_seconds must be > 0"));
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn credentials(&self) -> Configuration {
        Configuration {
            tunnel_token: self
                .tunnel
                .authtoken
                .as_ref()
                .and_then(|s| Secret::new(s.expose())),
            model_key: self
                .model
                .api_key
                .as_ref()
                .and_then(|s| Secret::new(s.expose())),
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| {
                anyhow::anyhow!(
                    "invalid bind address {}:{}: {e}",
                    self.server.host,
                    self.server.port
                )
            })
    }

    pub fn model_client_config(&self) -> lumen_llm::ModelClientConfig {
        lumen_llm::ModelClientConfig {
            model: self.model.model.clone(),
            base_url: self.model.base_url.clone(),
            timeout: Duration::from_secs(self.model.timeout_seconds),
        }
    }

    pub fn agent_config(&self) -> lumen_tunnel::NgrokAgentConfig {
        lumen_tunnel::NgrokAgentConfig {
            binary: PathBuf::from(&self.tunnel.agent_path),
            api_addr: self.tunnel.api_addr.clone(),
            startup_timeout: Duration::from_secs(self.tunnel.startup_timeout_seconds),
        }
    }
}

/// Masked terminal prompt. Esc skips the secret; ctrl-c aborts startup.
fn ask_masked(prompt: &str) -> Result<Option<String>> {
    match inquire::Password::new(prompt)
        .without_confirmation()
        .with_display_mode(inquire::PasswordDisplayMode::Masked)
        .with_help_message("leave blank to disable this feature")
        .prompt()
    {
        Ok(answer) => Ok(Some(answer)),
        Err(inquire::InquireError::OperationCanceled) => Ok(None),
        Err(e) => Err(anyhow::anyhow!("failed to read secret: {e}")),
    }
}

fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), "loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!(error = %e, "ignoring unreadable .env"),
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".lumen").join("config.toml")
}
