//! Site instances backed by child processes
//!
//! Every site gets its own copy of the configured site command, listening on
//! a port from the configured range. Requests are forwarded over the shared
//! connection pool. Task runs spawn the same program with the task name as
//! extra arguments and wait for it to exit.

use crate::config::{Environment, InstancesConfig};
use crate::error::{Error, Result};
use crate::instance::{ConfigOverlay, InstanceFactory, SiteRequest, SiteResponse, TenantInstance};
use crate::pool::ConnectionPool;
use crate::tasks::TaskRunner;
use crate::tenant::TenantRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Hands out listening ports to instances
pub struct PortAllocator {
    start: u16,
    end: u16,
    in_use: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve a port nobody in this process holds and nothing else is
    /// listening on
    pub fn allocate(&self) -> Option<u16> {
        let mut in_use = self.in_use.lock();
        let port = (self.start..=self.end)
            .filter(|port| !in_use.contains(port))
            .find(|port| std::net::TcpListener::bind(("127.0.0.1", *port)).is_ok())?;
        in_use.insert(port);
        Some(port)
    }

    pub fn release(&self, port: u16) {
        self.in_use.lock().remove(&port);
    }

    pub fn in_use(&self) -> usize {
        self.in_use.lock().len()
    }
}

/// A reserved port, returned to the allocator on drop
pub struct PortLease {
    ports: Arc<PortAllocator>,
    port: u16,
}

impl PortLease {
    pub fn acquire(ports: &Arc<PortAllocator>) -> Option<Self> {
        let port = ports.allocate()?;
        Some(Self {
            ports: Arc::clone(ports),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.ports.release(self.port);
    }
}

/// Values every site process receives in its environment
#[derive(Debug, Clone)]
pub struct SiteEnvironment {
    pub env: Environment,
    pub session_secret: String,
    pub shared: HashMap<String, String>,
}

impl SiteEnvironment {
    fn apply(&self, cmd: &mut Command, record: &TenantRecord) {
        cmd.envs(&self.shared);
        cmd.env("SITE_ID", &record.id);
        if let Some(short_name) = &record.short_name {
            cmd.env("SITE_SHORT_NAME", short_name);
        }
        cmd.env("SESSION_SECRET", &self.session_secret);
        cmd.env("MULTISITE_ENV", self.env.as_str());
        if let Some(base_url) = record.base_url(self.env.as_str()) {
            cmd.env("BASE_URL", base_url);
        }
        if let Some(theme) = &record.theme {
            cmd.env("SITE_THEME", theme);
        }
    }
}

/// Split a command line and append extra arguments
pub fn command_from_line(line: &str, extra: &[String]) -> anyhow::Result<Command> {
    let words = shell_words::split(line)?;
    let Some((program, args)) = words.split_first() else {
        anyhow::bail!("empty command line");
    };
    let mut cmd = Command::new(program);
    cmd.args(args).args(extra);
    Ok(cmd)
}

/// Send each line of the child's stdout and stderr to the log
fn forward_output(child: &mut Child, site: &str) {
    if let Some(stdout) = child.stdout.take() {
        let site = site.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim_end();
                if !line.is_empty() {
                    info!(target: "site", site = %site, stream = "stdout", "{}", line);
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let site = site.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim_end();
                if !line.is_empty() {
                    warn!(target: "site", site = %site, stream = "stderr", "{}", line);
                }
            }
        });
    }
}

/// SIGTERM, then SIGKILL once the grace period runs out
async fn stop_child(site: &str, child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(site, pid, "Sending SIGTERM to site process");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(site, ?status, "Site process exited");
        }
        Ok(Err(e)) => {
            warn!(site, error = %e, "Error waiting for site process to exit");
        }
        Err(_) => {
            warn!(
                site,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

pub struct ProcessFactory {
    config: InstancesConfig,
    site_env: SiteEnvironment,
    pool: Arc<ConnectionPool>,
    ports: Arc<PortAllocator>,
}

impl ProcessFactory {
    pub fn new(config: InstancesConfig, site_env: SiteEnvironment, pool: Arc<ConnectionPool>) -> Self {
        let ports = Arc::new(PortAllocator::new(
            config.port_range_start,
            config.port_range_end,
        ));
        Self {
            config,
            site_env,
            pool,
            ports,
        }
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    fn build_failure(record: &TenantRecord, message: impl Into<String>) -> Error {
        Error::BuildFailure {
            tenant_id: record.id.clone(),
            message: message.into(),
        }
    }

    fn spawn(&self, record: &TenantRecord, overlay: &ConfigOverlay, port: u16) -> Result<Child> {
        let extra: Vec<String> = self
            .config
            .args
            .iter()
            .chain(overlay.args.iter())
            .cloned()
            .collect();
        let mut cmd = command_from_line(&self.config.command, &extra)
            .map_err(|e| Self::build_failure(record, e.to_string()))?;

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // An abandoned build must not leave a process behind
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        cmd.envs(&self.config.env);
        self.site_env.apply(&mut cmd, record);
        cmd.env("PORT", port.to_string());
        cmd.envs(&overlay.env);

        let site = record.display_name();
        info!(site, tenant_id = %record.id, port, command = %self.config.command, "Starting site process");

        let mut child = cmd
            .spawn()
            .map_err(|e| Self::build_failure(record, format!("failed to spawn: {}", e)))?;
        debug!(site, pid = child.id().unwrap_or(0), "Site process spawned");
        forward_output(&mut child, site);
        Ok(child)
    }

    /// Poll the health path until it answers, the process exits or the
    /// startup timeout runs out
    async fn wait_until_healthy(&self, record: &TenantRecord, child: &mut Child, port: u16) -> Result<()> {
        let site = record.display_name();
        let timeout = self.config.startup_timeout();
        let interval = self.config.health_check_interval();
        let start = Instant::now();

        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(Self::build_failure(
                    record,
                    format!("process exited during startup with {}", status),
                ));
            }

            if self
                .pool
                .check_instance(port, &self.config.health_path)
                .await
            {
                debug!(site, elapsed_ms = start.elapsed().as_millis(), "Site process answered health check");
                return Ok(());
            }

            if start.elapsed() > timeout {
                return Err(Self::build_failure(
                    record,
                    format!("no healthy response within {}s", timeout.as_secs()),
                ));
            }

            tokio::time::sleep(interval).await;
        }
    }
}

#[async_trait]
impl InstanceFactory for ProcessFactory {
    async fn build(
        &self,
        record: &TenantRecord,
        overlay: &ConfigOverlay,
    ) -> Result<Arc<dyn TenantInstance>> {
        // Released on every early return, including a cancelled build
        let lease = PortLease::acquire(&self.ports)
            .ok_or_else(|| Self::build_failure(record, "no free port in the instance range"))?;
        let port = lease.port();

        let mut child = self.spawn(record, overlay, port)?;

        if let Err(e) = self.wait_until_healthy(record, &mut child, port).await {
            stop_child(record.display_name(), &mut child, self.config.shutdown_grace_period()).await;
            return Err(e);
        }

        Ok(Arc::new(ProcessInstance {
            tenant_id: record.id.clone(),
            site: record.display_name().to_string(),
            port,
            running: tokio::sync::Mutex::new(Some((child, lease))),
            pool: Arc::clone(&self.pool),
            request_timeout: self.config.request_timeout(),
            grace_period: self.config.shutdown_grace_period(),
        }))
    }
}

/// A running site process
pub struct ProcessInstance {
    tenant_id: String,
    site: String,
    port: u16,
    running: tokio::sync::Mutex<Option<(Child, PortLease)>>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    grace_period: Duration,
}

#[async_trait]
impl TenantInstance for ProcessInstance {
    async fn dispatch(&self, req: SiteRequest) -> Result<SiteResponse> {
        match tokio::time::timeout(self.request_timeout, self.pool.forward(req, self.port)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(Error::Dispatch {
                tenant_id: self.tenant_id.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(Error::DispatchTimeout {
                tenant_id: self.tenant_id.clone(),
                timeout: self.request_timeout,
            }),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let Some((mut child, lease)) = self.running.lock().await.take() else {
            return Ok(());
        };
        stop_child(&self.site, &mut child, self.grace_period).await;
        drop(lease);
        Ok(())
    }
}

/// Runs tasks by spawning the task command once per site
pub struct CommandTaskRunner {
    command: String,
    args: Vec<String>,
    working_dir: Option<String>,
    site_env: SiteEnvironment,
    discard_command: Option<String>,
}

impl CommandTaskRunner {
    pub fn new(
        command: String,
        args: Vec<String>,
        working_dir: Option<String>,
        site_env: SiteEnvironment,
    ) -> Self {
        Self {
            command,
            args,
            working_dir,
            site_env,
            discard_command: None,
        }
    }

    /// Command line run with the site's environment to drop the data of a
    /// temporary site
    pub fn with_discard_command(mut self, discard_command: Option<String>) -> Self {
        self.discard_command = discard_command;
        self
    }

    /// Spawn `line` for `record`, forward its output and wait for a zero exit
    async fn run_to_completion(
        &self,
        line: &str,
        extra: &[String],
        env: &HashMap<String, String>,
        record: &TenantRecord,
        label: &str,
    ) -> std::result::Result<(), String> {
        let mut cmd = command_from_line(line, extra).map_err(|e| e.to_string())?;
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        if let Some(ref working_dir) = self.working_dir {
            cmd.current_dir(working_dir);
        }
        self.site_env.apply(&mut cmd, record);
        cmd.envs(env);

        let site = record.display_name();
        info!(site, task = label, "Running task");
        let start = Instant::now();

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn: {}", e))?;
        forward_output(&mut child, site);

        let status = child
            .wait()
            .await
            .map_err(|e| format!("failed to wait: {}", e))?;
        if !status.success() {
            return Err(format!("exited with {}", status));
        }

        info!(site, task = label, elapsed_ms = start.elapsed().as_millis(), "Task finished");
        Ok(())
    }
}

#[async_trait]
impl TaskRunner for CommandTaskRunner {
    async fn run(&self, task: &str, args: &[String], record: &TenantRecord) -> Result<()> {
        let overlay = ConfigOverlay::default()
            .with_env("MULTISITE_TASK", task)
            .with_args(std::iter::once(task.to_string()).chain(args.iter().cloned()).collect());
        let extra: Vec<String> = self.args.iter().chain(overlay.args.iter()).cloned().collect();

        self.run_to_completion(&self.command, &extra, &overlay.env, record, task)
            .await
            .map_err(|message| Error::TaskFailed {
                task: task.to_string(),
                tenant_id: record.id.clone(),
                message,
            })
    }

    async fn discard_site_data(&self, record: &TenantRecord) -> Result<()> {
        let Some(line) = &self.discard_command else {
            debug!(tenant_id = %record.id, "No discard command configured");
            return Ok(());
        };
        self.run_to_completion(line, &[], &HashMap::new(), record, "discard")
            .await
            .map_err(|message| Error::TaskFailed {
                task: "discard".to_string(),
                tenant_id: record.id.clone(),
                message,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;

    fn site_env() -> SiteEnvironment {
        SiteEnvironment {
            env: Environment::Staging,
            session_secret: "secret".to_string(),
            shared: HashMap::new(),
        }
    }

    #[test]
    fn test_port_allocator() {
        let ports = PortAllocator::new(46100, 46102);
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(ports.in_use(), 2);

        ports.release(a);
        assert_eq!(ports.in_use(), 1);
        assert!(ports.allocate().is_some());
    }

    #[test]
    fn test_port_allocator_exhausted() {
        let ports = PortAllocator::new(46110, 46110);
        assert!(ports.allocate().is_some());
        assert!(ports.allocate().is_none());
    }

    #[test]
    fn test_command_from_line() {
        let cmd = command_from_line("node 'my app.js' --flag", &["extra".to_string()]).unwrap();
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "node");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, vec!["my app.js", "--flag", "extra"]);

        assert!(command_from_line("", &[]).is_err());
        assert!(command_from_line("node 'unterminated", &[]).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_fails_when_process_exits() {
        let config = InstancesConfig {
            command: "sh -c 'exit 3'".to_string(),
            port_range_start: 46120,
            port_range_end: 46129,
            startup_timeout_secs: 5,
            ..Default::default()
        };
        let factory = ProcessFactory::new(config, site_env(), Arc::new(ConnectionPool::new(PoolConfig::default())));

        let record = TenantRecord::new("s1", "one.example");
        let err = match factory.build(&record, &ConfigOverlay::default()).await {
            Ok(_) => panic!("build should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::BuildFailure { .. }));
        assert_eq!(factory.ports().in_use(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_fails_for_missing_program() {
        let config = InstancesConfig {
            command: "/nonexistent/site-server".to_string(),
            port_range_start: 46130,
            port_range_end: 46139,
            ..Default::default()
        };
        let factory = ProcessFactory::new(config, site_env(), Arc::new(ConnectionPool::new(PoolConfig::default())));

        let record = TenantRecord::new("s1", "one.example");
        assert!(factory.build(&record, &ConfigOverlay::default()).await.is_err());
        assert_eq!(factory.ports().in_use(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_task_runner_passes_site_env() {
        let runner = CommandTaskRunner::new(
            "sh -c".to_string(),
            vec![r#"test "$SITE_ID" = s1 && test "$MULTISITE_TASK" = "$0" && test "$MULTISITE_ENV" = staging"#.to_string()],
            None,
            site_env(),
        );
        let record = TenantRecord::new("s1", "one.example");
        runner.run("reindex", &[], &record).await.unwrap();

        let other = TenantRecord::new("s2", "two.example");
        let err = runner.run("reindex", &[], &other).await.unwrap_err();
        assert!(matches!(err, Error::TaskFailed { ref tenant_id, .. } if tenant_id == "s2"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_task_runner_base_url() {
        let runner = CommandTaskRunner::new(
            "sh -c".to_string(),
            vec![r#"test "$BASE_URL" = https://one.staging.example"#.to_string()],
            None,
            site_env(),
        );
        let mut record = TenantRecord::new("s1", "one.example");
        record
            .base_urls
            .insert("staging".to_string(), "https://one.staging.example".to_string());
        runner.run("noop", &[], &record).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_discard_command_runs_with_site_env() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut record = TenantRecord::temporary(Some("blog".to_string()));
        let marker = dir.path().join(&record.id);
        std::fs::write(&marker, b"data").unwrap();

        let runner = CommandTaskRunner::new("true".to_string(), vec![], None, site_env())
            .with_discard_command(Some(format!(
                r#"sh -c 'test "$SITE_THEME" = blog && rm "{}/$SITE_ID"'"#,
                dir.path().display()
            )));
        runner.discard_site_data(&record).await.unwrap();
        assert!(!marker.exists());

        record.theme = Some("other".to_string());
        let err = runner.discard_site_data(&record).await.unwrap_err();
        assert!(matches!(err, Error::TaskFailed { ref task, .. } if task == "discard"));
    }

    #[tokio::test]
    async fn test_discard_without_command_is_noop() {
        let runner = CommandTaskRunner::new("true".to_string(), vec![], None, site_env());
        let record = TenantRecord::temporary(None);
        runner.discard_site_data(&record).await.unwrap();
    }
}
