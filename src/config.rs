use crate::tasks::Schedule;
use crate::tenant::TenantRecord;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Config file read when no path is given
pub const DEFAULT_CONFIG_PATH: &str = "multisite.toml";

/// Global configuration for the site host
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Deployment environment (dev, staging, prod)
    #[serde(default)]
    pub env: Environment,

    /// Secret handed to every site instance for signing sessions
    pub session_secret: Option<String>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    /// How site instances are started
    #[serde(default)]
    pub instances: InstancesConfig,

    /// The control-plane site
    #[serde(default)]
    pub control: ControlConfig,

    #[serde(default)]
    pub hostnames: HostnamesConfig,

    #[serde(default)]
    pub janitor: JanitorConfig,

    #[serde(default)]
    pub rotation: RotationConfig,

    #[serde(default)]
    pub tasks: TasksConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    #[serde(alias = "development")]
    Dev,
    Staging,
    #[serde(alias = "production")]
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }

    pub fn is_production(&self) -> bool {
        *self == Environment::Prod
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "staging" => Ok(Environment::Staging),
            "prod" | "production" => Ok(Environment::Prod),
            other => anyhow::bail!("Unknown environment '{}'", other),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Site listener port (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Port for the loopback admin API (default: 9999, 0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// HTTP keep-alive on client connections (default: true)
    #[serde(default = "default_true")]
    pub keep_alive: bool,

    /// Seconds an idle keep-alive connection may wait for its next request
    /// (default: 100). Keep this above the load balancer's idle timeout.
    #[serde(default = "default_keep_alive_timeout")]
    pub keep_alive_timeout_secs: u64,

    /// Maximum idle connections per site instance (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_port: default_admin_port(),
            admin_token: None,
            pid_file: None,
            keep_alive: true,
            keep_alive_timeout_secs: default_keep_alive_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite database shared by the fleet
    #[serde(default = "default_store_path")]
    pub path: String,

    /// A task lock not released within this time expires
    #[serde(default = "default_lock_lease")]
    pub lock_lease_secs: u64,

    /// Give up waiting for a task lock after this long
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    #[serde(default = "default_lock_retry")]
    pub lock_retry_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            lock_lease_secs: default_lock_lease(),
            lock_timeout_secs: default_lock_timeout(),
            lock_retry_ms: default_lock_retry(),
        }
    }
}

impl StoreConfig {
    pub fn lock_settings(&self) -> crate::db::LockSettings {
        crate::db::LockSettings {
            lease: Duration::from_secs(self.lock_lease_secs),
            timeout: Duration::from_secs(self.lock_timeout_secs),
            retry: Duration::from_millis(self.lock_retry_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstancesConfig {
    /// Command line that starts one site, e.g. "node app.js"
    #[serde(default)]
    pub command: String,

    /// Extra arguments appended to the command
    #[serde(default)]
    pub args: Vec<String>,

    pub working_dir: Option<String>,

    /// Environment variables for site instances
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Environment variables for site instances and task runs
    #[serde(default)]
    pub shared_env: HashMap<String, String>,

    /// First port handed out to instances
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Last port handed out to instances (inclusive)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Path polled until the instance answers with 2xx (default: /)
    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// A build still running after this long is abandoned
    #[serde(default = "default_max_build")]
    pub max_build_secs: u64,

    /// Time allowed for in-flight requests to finish before teardown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Time between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            shared_env: HashMap::new(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            health_path: default_health_path(),
            startup_timeout_secs: default_startup_timeout(),
            health_check_interval_ms: default_health_interval(),
            max_build_secs: default_max_build(),
            drain_timeout_secs: default_drain_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl InstancesConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn max_build(&self) -> Duration {
        Duration::from_secs(self.max_build_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    /// Tenant id of the control-plane site
    #[serde(default = "default_control_tenant")]
    pub tenant_id: String,

    /// Hostnames served by the control-plane site
    #[serde(default)]
    pub hostnames: Vec<String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tenant_id: default_control_tenant(),
            hostnames: Vec::new(),
        }
    }
}

impl ControlConfig {
    /// Record for the control-plane site. It never changes while the
    /// process runs, so its instance is never considered stale.
    pub fn record(&self) -> TenantRecord {
        let mut record = TenantRecord::new(&self.tenant_id, "");
        record.short_name = Some(self.tenant_id.clone());
        record.hostnames = self.hostnames.clone();
        record.updated_at = DateTime::<Utc>::default();
        record
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HostnameMode {
    /// Match the request hostname against each site's hostname list
    #[default]
    Explicit,
    /// Serve `<short_name>.<base domain>` for the current environment
    ShortName,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct HostnamesConfig {
    #[serde(default)]
    pub mode: HostnameMode,

    /// Base domain per environment, e.g. `prod = "sites.example.com"`
    #[serde(default)]
    pub base_domains: HashMap<String, String>,
}

impl HostnamesConfig {
    pub fn base_domain(&self, env: Environment) -> Option<&str> {
        self.base_domains.get(env.as_str()).map(String::as_str)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct JanitorConfig {
    #[serde(default = "default_janitor_interval")]
    pub interval_secs: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_janitor_interval(),
        }
    }
}

impl JanitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RotationConfig {
    /// Rotate after roughly this many requests (unset disables rotation)
    pub max_requests: Option<u64>,

    /// Upper bound of the random number of requests added to `max_requests`
    #[serde(default = "default_additional_requests")]
    pub additional_requests: u64,

    /// How long open connections get to finish when rotating
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_requests: None,
            additional_requests: default_additional_requests(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

impl RotationConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TasksConfig {
    /// Command line for task runs (default: the instance command)
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Command line that drops a temporary site's data after its task run
    pub discard_command: Option<String>,

    /// Sites a task runs against at once
    #[serde(default = "default_task_concurrency")]
    pub concurrency: usize,

    /// Task names to run for `tasks --frequency`
    #[serde(flatten)]
    pub schedule: Schedule,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            discard_command: None,
            concurrency: default_task_concurrency(),
            schedule: Schedule::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    3000
}

fn default_admin_port() -> u16 {
    9999
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_keep_alive_timeout() -> u64 {
    100
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_store_path() -> String {
    "data/multisite.db".to_string()
}

fn default_lock_lease() -> u64 {
    300
}

fn default_lock_timeout() -> u64 {
    60
}

fn default_lock_retry() -> u64 {
    250
}

fn default_port_range_start() -> u16 {
    4000
}

fn default_port_range_end() -> u16 {
    4999
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_health_interval() -> u64 {
    100
}

fn default_max_build() -> u64 {
    120
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_control_tenant() -> String {
    "dashboard".to_string()
}

fn default_janitor_interval() -> u64 {
    60
}

fn default_additional_requests() -> u64 {
    crate::rotation::DEFAULT_ADDITIONAL_REQUESTS
}

fn default_task_concurrency() -> usize {
    1
}

/// Split a comma or whitespace separated hostname list
fn parse_hostname_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|h| !h.is_empty())
        .map(|h| h.to_lowercase())
        .collect()
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e))
}

impl Config {
    /// Parse the file if it exists, then apply environment overrides.
    ///
    /// A missing file is only an error when the path was given explicitly.
    pub fn read(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Config::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.normalize();
        Ok(config)
    }

    /// Read and validate
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Apply overrides from environment variables looked up through `var`
    pub fn apply_env<F>(&mut self, var: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = var("PORT") {
            self.server.port = parse_var("PORT", &port)?;
        }
        if let Some(bind) = var("BIND") {
            self.server.bind = bind;
        }
        if let Some(path) = var("DATABASE_PATH") {
            self.store.path = path;
        }
        if let Some(secret) = var("SESSION_SECRET") {
            self.session_secret = Some(secret);
        }
        if let Some(hostnames) = var("CONTROL_HOSTNAMES") {
            self.control.hostnames = parse_hostname_list(&hostnames);
        }
        if let Some(env) = var("ENV") {
            self.env = parse_var("ENV", &env)?;
        }
        if let Some(domain) = var("BASE_DOMAIN") {
            self.hostnames
                .base_domains
                .insert(self.env.as_str().to_string(), domain);
        }
        if let Some(max) = var("MAX_REQUESTS_BEFORE_SHUTDOWN") {
            self.rotation.max_requests = Some(parse_var("MAX_REQUESTS_BEFORE_SHUTDOWN", &max)?);
        }
        if let Some(additional) = var("ADDITIONAL_REQUESTS_BEFORE_SHUTDOWN") {
            self.rotation.additional_requests =
                parse_var("ADDITIONAL_REQUESTS_BEFORE_SHUTDOWN", &additional)?;
        }
        if let Some(token) = var("ADMIN_TOKEN") {
            self.server.admin_token = Some(token);
        }
        Ok(())
    }

    /// Hostnames are compared lower-case everywhere
    fn normalize(&mut self) {
        for hostname in &mut self.control.hostnames {
            *hostname = hostname.to_lowercase();
        }
        for domain in self.hostnames.base_domains.values_mut() {
            *domain = domain.to_lowercase();
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self
            .session_secret
            .as_deref()
            .map_or(true, |s| s.trim().is_empty())
        {
            errors.push("SESSION_SECRET (session_secret) must be set".to_string());
        }

        if self.control.hostnames.is_empty() {
            errors.push("CONTROL_HOSTNAMES ([control] hostnames) must list at least one hostname".to_string());
        }

        match shell_words::split(&self.instances.command) {
            Ok(words) if !words.is_empty() => {}
            Ok(_) => errors.push("[instances] command must be set".to_string()),
            Err(e) => errors.push(format!("[instances] command is not a valid command line: {}", e)),
        }

        if self.instances.port_range_start == 0
            || self.instances.port_range_start > self.instances.port_range_end
        {
            errors.push(format!(
                "[instances] port range {}-{} is empty",
                self.instances.port_range_start, self.instances.port_range_end
            ));
        }

        if self.hostnames.mode == HostnameMode::ShortName
            && self.hostnames.base_domain(self.env).is_none()
        {
            errors.push(format!(
                "[hostnames] short-name mode needs a base domain for {}",
                self.env.as_str()
            ));
        }

        if self.server.keep_alive && self.server.keep_alive_timeout_secs == 0 {
            errors.push("[server] keep_alive_timeout_secs must be at least 1".to_string());
        }

        if self.tasks.concurrency == 0 {
            errors.push("[tasks] concurrency must be at least 1".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
