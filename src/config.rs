use hyper::Uri;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file picked up from the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "frontgate.toml";

/// Environment variable overriding the front-end listen port
pub const ENV_PORT: &str = "PORT";
/// Environment variable overriding the backend base URL
pub const ENV_BACKEND_URL: &str = "BACKEND_URL";
/// Environment variable overriding the static root directory
pub const ENV_STATIC_DIR: &str = "STATIC_DIR";

/// Global configuration for the front-end process
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and static bundle settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Forwarding settings for the API prefix
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Backend launch settings (supervising mode only)
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Front-end listen port (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Directory holding the pre-built web bundle
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,

    /// Root document served for unmatched paths
    #[serde(default = "default_index_file")]
    pub index_file: String,
}

impl ServerConfig {
    /// Listen address; `bind` is a bare IPv4 or IPv6 address
    pub fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let ip: IpAddr = self.bind.trim().parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            static_dir: default_static_dir(),
            index_file: default_index_file(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Path prefix forwarded to the backend (default: /api)
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Base URL of the backend (default: http://localhost:8001)
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Remove the prefix from the path before forwarding (default: false)
    #[serde(default)]
    pub strip_prefix: bool,

    /// Upper bound on a forwarded request, unset means wait indefinitely
    pub request_timeout_secs: Option<u64>,

    /// Maximum idle connections kept to the backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            backend_url: default_backend_url(),
            strip_prefix: false,
            request_timeout_secs: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

/// Configuration for the supervised backend process
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// front-end process. Configuration files must only come from trusted sources.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Program to run. When `args` is empty this may hold a full command line,
    /// which is split using shell quoting rules.
    #[serde(default = "default_backend_command")]
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default = "default_backend_args")]
    pub args: Vec<String>,

    /// Working directory (default: the front-end's own working directory)
    pub working_dir: Option<PathBuf>,

    /// Port pinned into the backend's `PORT` environment variable
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Extra environment variables for the backend
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// How long shutdown waits for the killed child to be reaped
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_backend_command(),
            args: default_backend_args(),
            working_dir: None,
            port: default_backend_port(),
            env: HashMap::new(),
            kill_timeout_ms: default_kill_timeout(),
        }
    }
}

impl BackendConfig {
    /// Create a backend config running `command` with `args` on `port`
    pub fn new(command: &str, args: Vec<String>, port: u16) -> Self {
        Self {
            command: command.to_string(),
            args,
            port,
            ..Self::default()
        }
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    /// Resolve program and arguments.
    ///
    /// With explicit `args` the command is taken as the program verbatim,
    /// otherwise it is split like a shell would.
    pub fn program_and_args(&self) -> anyhow::Result<(String, Vec<String>)> {
        if !self.args.is_empty() {
            return Ok((self.command.clone(), self.args.clone()));
        }

        let mut words = shell_words::split(&self.command)
            .map_err(|e| anyhow::anyhow!("Invalid backend command '{}': {}", self.command, e))?;
        if words.is_empty() {
            anyhow::bail!("Backend command is empty");
        }
        let program = words.remove(0);
        Ok((program, words))
    }

    /// Validate the backend configuration
    pub fn validate(&self, frontend_port: u16) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("backend: 'command' must not be empty".to_string());
        }

        if let Err(e) = self.program_and_args() {
            return Err(format!("backend: {}", e));
        }

        if self.port == 0 {
            return Err("backend: 'port' must be greater than 0".to_string());
        }

        if self.port == frontend_port {
            return Err(format!(
                "backend: 'port' ({}) must differ from the front-end port",
                self.port
            ));
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Resolve configuration the way both binaries do: an explicit path must
    /// exist, otherwise `frontgate.toml` is used when present, then defaults.
    /// Environment overrides are applied last.
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => Self::load(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `PORT`, `BACKEND_URL` and `STATIC_DIR` overrides
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid {} value '{}': {}", ENV_PORT, port, e))?;
        }

        if let Some(url) = lookup(ENV_BACKEND_URL) {
            self.proxy.backend_url = url;
        }

        if let Some(dir) = lookup(ENV_STATIC_DIR) {
            self.server.static_dir = PathBuf::from(dir);
        }

        Ok(())
    }

    /// Validate all configuration. Backend settings are only checked when the
    /// backend is going to be supervised.
    pub fn validate(&self, supervised: bool) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        }

        if let Err(e) = self.server.socket_addr() {
            errors.push(format!(
                "server: 'bind' must be an IP address (got '{}'): {}",
                self.server.bind, e
            ));
        }

        if self.server.index_file.is_empty() {
            errors.push("server: 'index_file' must not be empty".to_string());
        }

        let prefix = &self.proxy.prefix;
        if !prefix.starts_with('/') || prefix.len() < 2 || prefix.ends_with('/') {
            errors.push(format!(
                "proxy: 'prefix' must start with '/', not end with '/', and not be the root (got '{}')",
                prefix
            ));
        }

        if let Err(e) = parse_backend_url(&self.proxy.backend_url) {
            errors.push(format!("proxy: {}", e));
        }

        if supervised {
            if let Err(e) = self.backend.validate(self.server.port) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

/// Parse and check a backend base URL. Only plain `http://` is relayed.
pub fn parse_backend_url(url: &str) -> Result<Uri, String> {
    let uri: Uri = url
        .parse()
        .map_err(|e| format!("invalid backend URL '{}': {}", url, e))?;

    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => {
            return Err(format!(
                "unsupported backend URL scheme '{}' (only http is supported)",
                other
            ))
        }
        None => return Err(format!("backend URL '{}' must be absolute", url)),
    }

    if uri.authority().is_none() {
        return Err(format!("backend URL '{}' has no host", url));
    }

    if uri.query().is_some() {
        return Err(format!("backend URL '{}' must not carry a query string", url));
    }

    Ok(uri)
}

// Default value functions
fn default_listen_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("frontend/dist")
}

fn default_index_file() -> String {
    "index.html".to_string()
}

fn default_prefix() -> String {
    "/api".to_string()
}

fn default_backend_url() -> String {
    "http://localhost:8001".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_backend_command() -> String {
    "python".to_string()
}

fn default_backend_args() -> Vec<String> {
    vec!["-m".to_string(), "backend.main".to_string()]
}

fn default_backend_port() -> u16 {
    8001
}

fn default_kill_timeout() -> u64 {
    2000
}
