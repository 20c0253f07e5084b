//! Scheduled maintenance tasks across the fleet
//!
//! Every host process may be asked by cron to run the same scheduled task.
//! A distributed lock plus a run log make sure only one of them does it per
//! guard window.

use crate::error::{Error, Result};
use crate::tenant::{SiteStore, TenantFilter, TenantRecord, TenantRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Proof of holding a lock, required to release it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutex shared by every process in the fleet
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire the lock, retrying until the service's timeout
    async fn lock(&self, key: &str) -> Result<LockToken>;

    async fn unlock(&self, key: &str, token: &LockToken) -> Result<()>;
}

/// Start times of guarded task runs
#[async_trait]
pub trait RunLog: Send + Sync {
    /// Latest start recorded for `task` at or after `since`
    async fn last_started_since(
        &self,
        task: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;

    async fn record_start(&self, task: &str, started_at: DateTime<Utc>) -> Result<()>;
}

/// Runs one task against one tenant
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &str, args: &[String], record: &TenantRecord) -> Result<()>;

    /// Drop whatever data a throwaway site accumulated during its run
    async fn discard_site_data(&self, _record: &TenantRecord) -> Result<()> {
        Ok(())
    }
}

/// Which tenants a scheduled task applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskScope {
    /// Every live tenant
    AllTenants,
    /// The control-plane tenant only
    Control,
}

impl TaskScope {
    /// Key used for both the lock and the run log
    pub fn lock_key(&self, task: &str) -> String {
        match self {
            TaskScope::AllTenants => format!("all-{}", task),
            TaskScope::Control => format!("dashboard-{}", task),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Hourly,
    Daily,
}

impl Frequency {
    /// Runs closer together than this are skipped. Shorter than the period
    /// so a slightly early cron invocation still runs.
    pub fn guard_minutes(&self) -> i64 {
        match self {
            Frequency::Hourly => 50,
            Frequency::Daily => 23 * 60,
        }
    }
}

impl FromStr for Frequency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hourly" => Ok(Frequency::Hourly),
            "daily" => Ok(Frequency::Daily),
            other => Err(Error::Config(format!(
                "frequency must be hourly or daily, got '{}'",
                other
            ))),
        }
    }
}

/// Task names for one frequency, per scope
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScopedTasks {
    /// Run once per live tenant
    #[serde(default)]
    pub all: Vec<String>,
    /// Run against the control-plane tenant
    #[serde(default)]
    pub control: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub hourly: ScopedTasks,
    #[serde(default)]
    pub daily: ScopedTasks,
}

impl Schedule {
    pub fn tasks(&self, frequency: Frequency) -> &ScopedTasks {
        match frequency {
            Frequency::Hourly => &self.hourly,
            Frequency::Daily => &self.daily,
        }
    }
}

/// Targets of a directly invoked task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskTargets {
    /// One tenant by id or hostname, published or not
    Site(String),
    /// Several tenants by id or hostname
    Sites(Vec<String>),
    /// Every live tenant
    All,
    /// The control-plane tenant
    Control,
    /// A throwaway unpublished site, deleted with its data afterwards
    Temporary { theme: Option<String> },
}

/// Per-target results of one task run
#[derive(Debug, Default)]
pub struct TaskOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
pub enum GuardedRun {
    /// Another run started inside the guard window
    Skipped { last_started: DateTime<Utc> },
    Ran(TaskOutcome),
}

/// Result of one guarded task inside a scheduled run
#[derive(Debug)]
pub struct ScheduledRun {
    pub key: String,
    pub result: Result<GuardedRun>,
}

impl ScheduledRun {
    pub fn is_success(&self) -> bool {
        match &self.result {
            Ok(GuardedRun::Skipped { .. }) => true,
            Ok(GuardedRun::Ran(outcome)) => outcome.is_success(),
            Err(_) => false,
        }
    }
}

pub struct TaskCoordinator {
    registry: Arc<dyn TenantRegistry>,
    locks: Arc<dyn LockService>,
    run_log: Arc<dyn RunLog>,
    runner: Arc<dyn TaskRunner>,
    sites: Option<Arc<dyn SiteStore>>,
    control: TenantRecord,
    concurrency: usize,
}

impl TaskCoordinator {
    pub fn new(
        registry: Arc<dyn TenantRegistry>,
        locks: Arc<dyn LockService>,
        run_log: Arc<dyn RunLog>,
        runner: Arc<dyn TaskRunner>,
        control: TenantRecord,
    ) -> Self {
        Self {
            registry,
            locks,
            run_log,
            runner,
            sites: None,
            control,
            concurrency: 1,
        }
    }

    /// Store used to create and delete temporary sites
    pub fn with_site_store(mut self, sites: Arc<dyn SiteStore>) -> Self {
        self.sites = Some(sites);
        self
    }

    /// Number of targets a task runs against at once
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn run_guarded(
        &self,
        task: &str,
        scope: TaskScope,
        guard_minutes: i64,
    ) -> Result<GuardedRun> {
        self.run_guarded_at(task, scope, guard_minutes, Utc::now())
            .await
    }

    /// Run `task` unless a run started within `guard_minutes` before `now`.
    ///
    /// The lock is only held while checking and recording the start, never
    /// while the task runs.
    pub async fn run_guarded_at(
        &self,
        task: &str,
        scope: TaskScope,
        guard_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<GuardedRun> {
        let key = scope.lock_key(task);
        let token = self.locks.lock(&key).await?;

        let previous = self.check_and_record(&key, guard_minutes, now).await;

        if let Err(e) = self.locks.unlock(&key, &token).await {
            warn!(key = %key, error = %e, "Failed to release task lock");
        }

        if let Some(last_started) = previous? {
            info!(key = %key, %last_started, "Skipping task, already ran recently");
            return Ok(GuardedRun::Skipped { last_started });
        }

        let targets = match scope {
            TaskScope::AllTenants => self.live_targets().await?,
            TaskScope::Control => vec![self.control.clone()],
        };
        info!(key = %key, targets = targets.len(), "Running scheduled task");
        Ok(GuardedRun::Ran(self.fan_out(task, &[], targets).await))
    }

    async fn check_and_record(
        &self,
        key: &str,
        guard_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let since = now - chrono::Duration::minutes(guard_minutes);
        if let Some(last) = self.run_log.last_started_since(key, since).await? {
            return Ok(Some(last));
        }
        self.run_log.record_start(key, now).await?;
        Ok(None)
    }

    /// Run every configured task for `frequency`, tenant tasks first.
    ///
    /// A failing task does not stop the ones after it.
    pub async fn run_scheduled(&self, schedule: &Schedule, frequency: Frequency) -> Vec<ScheduledRun> {
        let tasks = schedule.tasks(frequency);
        let guard = frequency.guard_minutes();
        let scoped = tasks
            .all
            .iter()
            .map(|t| (t, TaskScope::AllTenants))
            .chain(tasks.control.iter().map(|t| (t, TaskScope::Control)));

        let mut runs = Vec::new();
        for (task, scope) in scoped {
            let key = scope.lock_key(task);
            let result = self.run_guarded(task, scope, guard).await;
            if let Err(e) = &result {
                error!(key = %key, error = %e, "Scheduled task abandoned");
            }
            runs.push(ScheduledRun { key, result });
        }
        runs
    }

    /// Run a task directly, without the guard. Fails if any target fails.
    pub async fn run_task(
        &self,
        task: &str,
        args: &[String],
        targets: TaskTargets,
    ) -> Result<TaskOutcome> {
        let records = match targets {
            TaskTargets::Site(site) => vec![self.resolve(&site).await?],
            TaskTargets::Sites(sites) => {
                let mut records = Vec::with_capacity(sites.len());
                for site in &sites {
                    records.push(self.resolve(site).await?);
                }
                records
            }
            TaskTargets::All => self.live_targets().await?,
            TaskTargets::Control => vec![self.control.clone()],
            TaskTargets::Temporary { theme } => {
                return self.run_on_temporary_site(task, args, theme).await;
            }
        };

        let total = records.len();
        let outcome = self.fan_out(task, args, records).await;
        Self::check_outcome(task, total, outcome)
    }

    /// Create an unpublished site, run the task on it, then delete the
    /// site's data and its record whether or not the task succeeded
    async fn run_on_temporary_site(
        &self,
        task: &str,
        args: &[String],
        theme: Option<String>,
    ) -> Result<TaskOutcome> {
        let sites = self.sites.as_ref().ok_or_else(|| {
            Error::Config("temporary sites need a writable site store".to_string())
        })?;

        let record = sites.create_site(&TenantRecord::temporary(theme)).await?;
        info!(tenant_id = %record.id, task, theme = ?record.theme, "Created temporary site");

        let outcome = self.fan_out(task, args, vec![record.clone()]).await;

        if let Err(e) = self.runner.discard_site_data(&record).await {
            warn!(tenant_id = %record.id, error = %e, "Failed to discard temporary site data");
        }
        match sites.remove_site(&record.id).await {
            Ok(_) => info!(tenant_id = %record.id, "Removed temporary site"),
            Err(e) => {
                error!(tenant_id = %record.id, error = %e, "Failed to remove temporary site");
                if outcome.is_success() {
                    return Err(e);
                }
            }
        }

        Self::check_outcome(task, 1, outcome)
    }

    fn check_outcome(task: &str, total: usize, outcome: TaskOutcome) -> Result<TaskOutcome> {
        if !outcome.is_success() {
            let ids: Vec<&str> = outcome.failed.iter().map(|(id, _)| id.as_str()).collect();
            return Err(Error::TaskFailed {
                task: task.to_string(),
                tenant_id: ids.join(","),
                message: format!("{} of {} targets failed", ids.len(), total),
            });
        }
        Ok(outcome)
    }

    async fn resolve(&self, id_or_hostname: &str) -> Result<TenantRecord> {
        if id_or_hostname == self.control.id {
            return Ok(self.control.clone());
        }
        self.registry
            .find_any(id_or_hostname)
            .await?
            .ok_or_else(|| Error::TenantNotFound(id_or_hostname.to_string()))
    }

    async fn live_targets(&self) -> Result<Vec<TenantRecord>> {
        let mut records = self.registry.list(TenantFilter::Live).await?;
        records.retain(|r| r.id != self.control.id);
        Ok(records)
    }

    async fn fan_out(&self, task: &str, args: &[String], targets: Vec<TenantRecord>) -> TaskOutcome {
        let results: Vec<(String, Result<()>)> = stream::iter(targets)
            .map(|record| async move {
                let result = self.runner.run(task, args, &record).await;
                (record.id, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut outcome = TaskOutcome::default();
        for (tenant_id, result) in results {
            match result {
                Ok(()) => outcome.succeeded.push(tenant_id),
                Err(e) => {
                    error!(task, tenant_id = %tenant_id, error = %e, "Task failed");
                    outcome.failed.push((tenant_id, e));
                }
            }
        }
        outcome.succeeded.sort();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::testing::MemoryRegistry;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MemoryCoordination {
        held: Mutex<HashMap<String, String>>,
        log: Mutex<Vec<(String, DateTime<Utc>)>>,
    }

    #[async_trait]
    impl LockService for MemoryCoordination {
        async fn lock(&self, key: &str) -> Result<LockToken> {
            let mut held = self.held.lock();
            if held.contains_key(key) {
                return Err(Error::LockTimeout {
                    key: key.to_string(),
                    waited: std::time::Duration::ZERO,
                });
            }
            let token = LockToken::new();
            held.insert(key.to_string(), token.as_str().to_string());
            Ok(token)
        }

        async fn unlock(&self, key: &str, token: &LockToken) -> Result<()> {
            let mut held = self.held.lock();
            if held.get(key).map(String::as_str) == Some(token.as_str()) {
                held.remove(key);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RunLog for MemoryCoordination {
        async fn last_started_since(
            &self,
            task: &str,
            since: DateTime<Utc>,
        ) -> Result<Option<DateTime<Utc>>> {
            Ok(self
                .log
                .lock()
                .iter()
                .filter(|(t, at)| t == task && *at >= since)
                .map(|(_, at)| *at)
                .max())
        }

        async fn record_start(&self, task: &str, started_at: DateTime<Utc>) -> Result<()> {
            self.log.lock().push((task.to_string(), started_at));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingRunner {
        runs: Mutex<Vec<(String, String)>>,
        seen: Mutex<Vec<TenantRecord>>,
        discarded: Mutex<Vec<String>>,
        fail_for: Option<String>,
        fail_all: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskRunner for RecordingRunner {
        async fn run(&self, task: &str, _args: &[String], record: &TenantRecord) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.runs.lock().push((task.to_string(), record.id.clone()));
            self.seen.lock().push(record.clone());
            if self.fail_all || self.fail_for.as_deref() == Some(record.id.as_str()) {
                return Err(Error::TaskFailed {
                    task: task.to_string(),
                    tenant_id: record.id.clone(),
                    message: "exit status 1".to_string(),
                });
            }
            Ok(())
        }

        async fn discard_site_data(&self, record: &TenantRecord) -> Result<()> {
            self.discarded.lock().push(record.id.clone());
            Ok(())
        }
    }

    fn create_test_coordinator(
        runner: Arc<RecordingRunner>,
    ) -> (TaskCoordinator, Arc<MemoryRegistry>, Arc<MemoryCoordination>) {
        let registry = Arc::new(MemoryRegistry::default());
        registry.put(TenantRecord::new("a", "a.example"));
        registry.put(TenantRecord::new("b", "b.example"));
        let mut hidden = TenantRecord::new("c", "c.example");
        hidden.published = false;
        registry.put(hidden);

        let coordination = Arc::new(MemoryCoordination::default());
        let coordinator = TaskCoordinator::new(
            registry.clone(),
            coordination.clone(),
            coordination.clone(),
            runner,
            TenantRecord::new("dashboard", "dashboard.example"),
        )
        .with_concurrency(2);
        (coordinator, registry, coordination)
    }

    #[test]
    fn test_lock_keys() {
        assert_eq!(TaskScope::AllTenants.lock_key("reindex"), "all-reindex");
        assert_eq!(TaskScope::Control.lock_key("reindex"), "dashboard-reindex");
    }

    #[test]
    fn test_frequency_guard() {
        assert_eq!("hourly".parse::<Frequency>().unwrap().guard_minutes(), 50);
        assert_eq!("daily".parse::<Frequency>().unwrap().guard_minutes(), 1380);
        assert!("weekly".parse::<Frequency>().is_err());
    }

    #[tokio::test]
    async fn test_guarded_run_covers_live_tenants() {
        let runner = Arc::new(RecordingRunner::default());
        let (coordinator, _, _) = create_test_coordinator(runner.clone());

        let run = coordinator
            .run_guarded("reindex", TaskScope::AllTenants, 60)
            .await
            .unwrap();
        match run {
            GuardedRun::Ran(outcome) => assert_eq!(outcome.succeeded, vec!["a", "b"]),
            other => panic!("expected a run, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_guard_window() {
        let runner = Arc::new(RecordingRunner::default());
        let (coordinator, _, coordination) = create_test_coordinator(runner.clone());
        let t0 = Utc::now();

        let first = coordinator
            .run_guarded_at("reindex", TaskScope::AllTenants, 60, t0)
            .await
            .unwrap();
        assert!(matches!(first, GuardedRun::Ran(_)));

        let at_60 = t0 + chrono::Duration::minutes(60);
        let second = coordinator
            .run_guarded_at("reindex", TaskScope::AllTenants, 60, at_60)
            .await
            .unwrap();
        assert!(matches!(second, GuardedRun::Skipped { last_started } if last_started == t0));

        let at_61 = t0 + chrono::Duration::minutes(61);
        let third = coordinator
            .run_guarded_at("reindex", TaskScope::AllTenants, 60, at_61)
            .await
            .unwrap();
        assert!(matches!(third, GuardedRun::Ran(_)));

        assert_eq!(runner.calls.load(Ordering::SeqCst), 4);
        assert_eq!(coordination.log.lock().len(), 2);
        assert!(coordination.held.lock().is_empty());
    }

    #[tokio::test]
    async fn test_held_lock_abandons_run() {
        let runner = Arc::new(RecordingRunner::default());
        let (coordinator, _, coordination) = create_test_coordinator(runner.clone());
        let _token = coordination.lock("all-reindex").await.unwrap();

        let err = coordinator
            .run_guarded("reindex", TaskScope::AllTenants, 60)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert!(coordination.log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failing_target_does_not_abort_others() {
        let runner = Arc::new(RecordingRunner {
            fail_for: Some("a".to_string()),
            ..Default::default()
        });
        let (coordinator, _, _) = create_test_coordinator(runner.clone());

        let run = coordinator
            .run_guarded("reindex", TaskScope::AllTenants, 60)
            .await
            .unwrap();
        let GuardedRun::Ran(outcome) = run else {
            panic!("expected a run");
        };
        assert_eq!(outcome.succeeded, vec!["b"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "a");
    }

    #[tokio::test]
    async fn test_scheduled_run_uses_both_scopes() {
        let runner = Arc::new(RecordingRunner::default());
        let (coordinator, _, coordination) = create_test_coordinator(runner.clone());
        let schedule = Schedule {
            hourly: ScopedTasks {
                all: vec!["reindex".to_string()],
                control: vec!["cleanup".to_string()],
            },
            daily: ScopedTasks::default(),
        };

        let runs = coordinator.run_scheduled(&schedule, Frequency::Hourly).await;
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(ScheduledRun::is_success));
        assert_eq!(runs[0].key, "all-reindex");
        assert_eq!(runs[1].key, "dashboard-cleanup");
        assert!(runner
            .runs
            .lock()
            .contains(&("cleanup".to_string(), "dashboard".to_string())));

        // A second invocation inside the window is skipped
        let runs = coordinator.run_scheduled(&schedule, Frequency::Hourly).await;
        assert!(runs
            .iter()
            .all(|r| matches!(r.result, Ok(GuardedRun::Skipped { .. }))));
        assert_eq!(coordination.log.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_run_task_targets() {
        let runner = Arc::new(RecordingRunner::default());
        let (coordinator, _, _) = create_test_coordinator(runner.clone());

        // Unpublished sites can be addressed directly
        let outcome = coordinator
            .run_task("migrate", &[], TaskTargets::Site("c.example".to_string()))
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, vec!["c"]);

        let outcome = coordinator
            .run_task(
                "migrate",
                &[],
                TaskTargets::Sites(vec!["a".to_string(), "b".to_string()]),
            )
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, vec!["a", "b"]);

        let err = coordinator
            .run_task("migrate", &[], TaskTargets::Site("nope".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TenantNotFound(_)));
    }

    #[tokio::test]
    async fn test_run_task_fails_when_any_target_fails() {
        let runner = Arc::new(RecordingRunner {
            fail_for: Some("b".to_string()),
            ..Default::default()
        });
        let (coordinator, _, _) = create_test_coordinator(runner.clone());

        let err = coordinator
            .run_task("migrate", &[], TaskTargets::All)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskFailed { ref tenant_id, .. } if tenant_id == "b"));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_temporary_site_removed_after_run() {
        let runner = Arc::new(RecordingRunner::default());
        let (coordinator, registry, _) = create_test_coordinator(runner.clone());
        let coordinator = coordinator.with_site_store(registry.clone());

        let outcome = coordinator
            .run_task(
                "import",
                &[],
                TaskTargets::Temporary {
                    theme: Some("blog".to_string()),
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.succeeded.len(), 1);
        let tmp_id = outcome.succeeded[0].clone();
        assert!(tmp_id.starts_with("tmp-"));

        let seen = runner.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].published);
        assert_eq!(seen[0].theme.as_deref(), Some("blog"));

        assert_eq!(*runner.discarded.lock(), vec![tmp_id.clone()]);
        assert!(!registry.contains(&tmp_id));
        assert!(registry.contains("a"));
    }

    #[tokio::test]
    async fn test_temporary_site_removed_when_task_fails() {
        let runner = Arc::new(RecordingRunner {
            fail_all: true,
            ..Default::default()
        });
        let (coordinator, registry, _) = create_test_coordinator(runner.clone());
        let coordinator = coordinator.with_site_store(registry.clone());

        let err = coordinator
            .run_task("import", &[], TaskTargets::Temporary { theme: None })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskFailed { .. }));

        let tmp_id = runner.runs.lock()[0].1.clone();
        assert_eq!(*runner.discarded.lock(), vec![tmp_id.clone()]);
        assert!(!registry.contains(&tmp_id));
    }

    #[tokio::test]
    async fn test_temporary_site_needs_store() {
        let runner = Arc::new(RecordingRunner::default());
        let (coordinator, _, _) = create_test_coordinator(runner.clone());

        let err = coordinator
            .run_task("import", &[], TaskTargets::Temporary { theme: None })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }
}
