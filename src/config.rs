//! Configuration for Pagewise, read from `.pagewise/pagewise.toml`.
//!
//! Layering is file → environment → CLI flags. Every field has a default, so
//! a missing file or a partial file is fine.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3142
//! db_path = ".pagewise/library.db"
//! dev_mode = false
//! session_idle_minutes = 30
//!
//! [identity]
//! user_header = "x-auth-user"
//! email_header = "x-auth-email"
//! name_header = "x-auth-name"
//! photo_header = "x-auth-photo"
//! secret_header = "x-pagewise-proxy-secret"
//! trusted_proxy_secret = "change-me"
//!
//! [sandbox]
//! enabled = true
//! interpreter = "python3"
//! timeout = 10
//! memory = "256m"
//! cpus = 1.0
//! image = "python:3.12-slim"
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_DIR: &str = ".pagewise";
pub const CONFIG_FILE: &str = "pagewise.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Relative paths are resolved against the project directory.
    pub db_path: PathBuf,
    /// Permissive CORS and bind on all interfaces (for a separate dev frontend).
    pub dev_mode: bool,
    /// Reader sessions untouched for this long are dropped. 0 keeps them forever.
    pub session_idle_minutes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3142,
            db_path: PathBuf::from(".pagewise/library.db"),
            dev_mode: false,
            session_idle_minutes: 30,
        }
    }
}

impl ServerConfig {
    pub fn bind_host(&self) -> &str {
        if self.dev_mode { "0.0.0.0" } else { &self.host }
    }

    /// Whether anything other than the local machine can reach the server.
    pub fn is_exposed(&self) -> bool {
        !matches!(self.bind_host(), "127.0.0.1" | "localhost" | "::1")
    }

    pub fn session_idle_timeout(&self) -> Option<Duration> {
        (self.session_idle_minutes > 0).then(|| Duration::from_secs(self.session_idle_minutes * 60))
    }
}

/// Headers the fronting identity provider uses to forward the signed-in user.
///
/// With `trusted_proxy_secret` set, the identity headers are only honored on
/// requests that also carry the secret in `secret_header`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub user_header: String,
    pub email_header: String,
    pub name_header: String,
    pub photo_header: String,
    pub secret_header: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted_proxy_secret: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_header: "x-auth-user".to_string(),
            email_header: "x-auth-email".to_string(),
            name_header: "x-auth-name".to_string(),
            photo_header: "x-auth-photo".to_string(),
            secret_header: "x-pagewise-proxy-secret".to_string(),
            trusted_proxy_secret: None,
        }
    }
}

/// Limits applied to every program run in the code sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub interpreter: String,
    /// Wall-clock limit per run, in seconds.
    pub timeout: u64,
    /// Memory limit per run, e.g. `"256m"` or `"1g"`.
    pub memory: String,
    /// CPU share per run. Only enforced inside a container.
    pub cpus: f64,
    /// Run each program with `docker run` in this image instead of on the host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interpreter: "python3".to_string(),
            timeout: 10,
            memory: "256m".to_string(),
            cpus: 1.0,
            image: None,
        }
    }
}

impl SandboxConfig {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// The memory limit in bytes, or `None` if it doesn't parse.
    pub fn memory_bytes(&self) -> Option<u64> {
        parse_memory(&self.memory)
    }
}

/// Parse a size such as `512k`, `256m` or `1g` (case-insensitive, optional
/// trailing `b`). A bare number is bytes.
pub fn parse_memory(value: &str) -> Option<u64> {
    let value = value.trim().to_ascii_lowercase();
    let value = value.strip_suffix('b').unwrap_or(&value);
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1u64 << 10),
        'm' => (&value[..value.len() - 1], 1 << 20),
        'g' => (&value[..value.len() - 1], 1 << 30),
        _ => (value, 1),
    };
    let amount: u64 = digits.trim().parse().ok()?;
    amount.checked_mul(multiplier).filter(|bytes| *bytes > 0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `tracing` filter directive when `PAGEWISE_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
    /// Also write logs to this file (no rotation).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagewiseConfig {
    pub server: ServerConfig,
    pub identity: IdentityConfig,
    pub sandbox: SandboxConfig,
    pub logging: LoggingConfig,
}

impl PagewiseConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pagewise.toml")
    }

    /// Load `<project>/.pagewise/pagewise.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = Self::path_in(project_dir);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load from the project directory and apply environment overrides.
    pub fn resolve(project_dir: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(project_dir)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn path_in(project_dir: &Path) -> PathBuf {
        project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Save configuration to a TOML file, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize pagewise.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `PAGEWISE_*` environment overrides. Unparseable values are ignored
    /// with a warning.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = var("PAGEWISE_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid PAGEWISE_PORT"),
            }
        }
        if let Some(path) = var("PAGEWISE_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(interpreter) = var("PAGEWISE_PYTHON") {
            self.sandbox.interpreter = interpreter;
        }
        if let Some(secret) = var("PAGEWISE_PROXY_SECRET").filter(|s| !s.trim().is_empty()) {
            self.identity.trusted_proxy_secret = Some(secret);
        }
    }

    /// Database path, resolved against the project directory when relative.
    pub fn db_path(&self, project_dir: &Path) -> PathBuf {
        if self.server.db_path.is_absolute() {
            self.server.db_path.clone()
        } else {
            project_dir.join(&self.server.db_path)
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.server.port == 0 {
            warnings.push("server.port is 0: an ephemeral port will be chosen".to_string());
        }
        if self.sandbox.enabled && self.sandbox.interpreter.trim().is_empty() {
            warnings.push("sandbox.interpreter is empty; the sandbox will fail to start".to_string());
        }
        if self.sandbox.enabled {
            if self.sandbox.timeout == 0 {
                warnings.push("sandbox.timeout is 0; every run will time out".to_string());
            }
            if self.sandbox.memory_bytes().is_none() {
                warnings.push(format!("Invalid sandbox.memory '{}'", self.sandbox.memory));
            }
            if self.sandbox.image.is_some() && self.sandbox.cpus <= 0.0 {
                warnings.push("sandbox.cpus must be positive".to_string());
            }
        }
        if self.identity.user_header.trim().is_empty() {
            warnings.push("identity.user_header is empty; nobody can sign in".to_string());
        }
        if self.server.is_exposed() && self.identity.trusted_proxy_secret.is_none() {
            warnings.push(format!(
                "server listens on {} but identity.trusted_proxy_secret is unset; \
                 any client can claim any identity",
                self.server.bind_host()
            ));
        }
        if self.server.session_idle_minutes == 0 {
            warnings.push("server.session_idle_minutes is 0; idle sessions are never dropped".to_string());
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!("Invalid logging.level '{}'", self.logging.level));
        }
        warnings
    }
}
