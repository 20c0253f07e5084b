use multisite::admin::{AdminServer, PKG_NAME, VERSION};
use multisite::cache::{CacheSettings, TenantCache};
use multisite::cli::{self, Command, SitesCommand};
use multisite::config::{Config, HostnameMode};
use multisite::db::{parse_sites_file, Database};
use multisite::factory::{CommandTaskRunner, ProcessFactory, SiteEnvironment};
use multisite::janitor::Janitor;
use multisite::pool::{ConnectionPool, PoolConfig};
use multisite::rotation::RotationController;
use multisite::server::{Dispatcher, SiteServer};
use multisite::tasks::{Frequency, GuardedRun, TaskCoordinator, TaskTargets};
use multisite::tenant::{TenantFilter, TenantRegistry};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("multisite=debug".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = cli::parse_args(&args)?;
    let config_path = invocation
        .config_path
        .or_else(|| std::env::var_os("MULTISITE_CONFIG").map(PathBuf::from));

    match invocation.command {
        Command::Help => {
            println!("{}", cli::USAGE);
            Ok(())
        }
        Command::Serve => serve(config_path.as_deref()).await,
        Command::Sites(command) => sites(config_path.as_deref(), command).await,
        Command::Task {
            name,
            args,
            targets,
            concurrency,
        } => task(config_path.as_deref(), &name, &args, targets, concurrency).await,
        Command::Tasks { frequency } => scheduled_tasks(config_path.as_deref(), frequency).await,
    }
}

fn open_store(config: &Config) -> anyhow::Result<Arc<Database>> {
    let db = Database::open(&config.store.path)
        .map_err(|e| anyhow::anyhow!("Failed to open store {}: {}", config.store.path, e))?
        .with_lock_settings(config.store.lock_settings());
    Ok(Arc::new(db))
}

fn site_environment(config: &Config) -> SiteEnvironment {
    SiteEnvironment {
        env: config.env,
        session_secret: config.session_secret.clone().unwrap_or_default(),
        shared: config.instances.shared_env.clone(),
    }
}

async fn serve(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::load(config_path).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let db = open_store(&config)?;

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    }));

    let factory = Arc::new(ProcessFactory::new(
        config.instances.clone(),
        site_environment(&config),
        Arc::clone(&pool),
    ));

    let cache = TenantCache::new(
        db.clone(),
        factory,
        CacheSettings {
            max_build: config.instances.max_build(),
            drain_timeout: config.instances.drain_timeout(),
        },
    );

    let rotation = Arc::new(RotationController::new(
        config.rotation.max_requests,
        config.rotation.additional_requests,
    ));

    let control = config.control.record();
    let mut dispatcher = Dispatcher::new(Arc::clone(&cache), control.clone(), config.env)
        .with_rotation(Arc::clone(&rotation));
    if config.hostnames.mode == HostnameMode::ShortName {
        if let Some(domain) = config.hostnames.base_domain(config.env) {
            info!(base_domain = domain, "Serving sites by short name");
            dispatcher = dispatcher.with_short_names(domain);
        }
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = SiteServer::bind(bind_addr, Arc::new(dispatcher), shutdown_rx.clone())
        .await?
        .with_keep_alive(
            config
                .server
                .keep_alive
                .then(|| config.server.keep_alive_timeout()),
        )
        .with_drain_timeout(config.rotation.drain_timeout());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Site server error");
        }
    });

    let admin_handle = if config.server.admin_port > 0 {
        // Generate or use configured admin token
        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });
        let admin_server = AdminServer::bind(
            config.server.admin_port,
            Arc::clone(&cache),
            admin_token,
            shutdown_rx.clone(),
        )
        .await?
        .with_pool(Arc::clone(&pool));
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    let janitor = Janitor::new(Arc::clone(&cache), config.janitor.interval());
    tokio::spawn(janitor.run(shutdown_rx.clone()));

    // Start the control site before its first request arrives
    let warm_cache = Arc::clone(&cache);
    tokio::spawn(async move {
        if let Err(e) = warm_cache.acquire(control).await {
            warn!(error = %e, "Control site failed to start, will retry on first request");
        }
    });

    wait_for_shutdown(rotation.subscribe()).await?;

    let _ = shutdown_tx.send(true);

    // Open connections finish before their instances go away
    let drain = config.rotation.drain_timeout() + Duration::from_secs(5);
    if tokio::time::timeout(drain, server_handle).await.is_err() {
        warn!("Site server did not stop in time");
    }

    info!(instances = cache.len(), "Stopping all site instances...");
    cache.shutdown_all().await;

    if let Some(handle) = admin_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C, SIGTERM, or the request limit being reached
async fn wait_for_shutdown(mut rotate_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
    let rotate = async move {
        while !*rotate_rx.borrow() {
            if rotate_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            _ = rotate => info!("Request limit reached, draining for restart..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
            _ = rotate => info!("Request limit reached, draining for restart..."),
        }
    }

    Ok(())
}

async fn sites(config_path: Option<&Path>, command: SitesCommand) -> anyhow::Result<()> {
    let config = Config::read(config_path)?;
    let db = open_store(&config)?;

    match command {
        SitesCommand::List => {
            let records = db.list(TenantFilter::All).await?;
            for record in &records {
                let status = if record.published { "published" } else { "unpublished" };
                println!(
                    "{:<24} {:<12} {}",
                    record.id,
                    status,
                    record.hostnames.join(",")
                );
            }
            println!("{} site(s)", records.len());
        }
        SitesCommand::Put(path) => {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
            let records = parse_sites_file(&contents)?;
            for record in &records {
                let saved = db.save_site(record)?;
                println!("saved {} ({})", saved.id, saved.hostnames.join(","));
            }
        }
    }
    Ok(())
}

fn task_coordinator(config: &Config, db: Arc<Database>) -> TaskCoordinator {
    let command = config
        .tasks
        .command
        .clone()
        .unwrap_or_else(|| config.instances.command.clone());
    let runner = CommandTaskRunner::new(
        command,
        config.tasks.args.clone(),
        config.instances.working_dir.clone(),
        site_environment(config),
    )
    .with_discard_command(config.tasks.discard_command.clone());
    TaskCoordinator::new(
        db.clone(),
        db.clone(),
        db.clone(),
        Arc::new(runner),
        config.control.record(),
    )
    .with_site_store(db)
    .with_concurrency(config.tasks.concurrency)
}

async fn task(
    config_path: Option<&Path>,
    name: &str,
    args: &[String],
    targets: TaskTargets,
    concurrency: Option<usize>,
) -> anyhow::Result<()> {
    let config = Config::read(config_path)?;
    let db = open_store(&config)?;
    let mut coordinator = task_coordinator(&config, db);
    if let Some(concurrency) = concurrency {
        coordinator = coordinator.with_concurrency(concurrency);
    }

    let outcome = coordinator.run_task(name, args, targets).await?;
    info!(task = name, succeeded = outcome.succeeded.len(), "Task finished");
    Ok(())
}

async fn scheduled_tasks(config_path: Option<&Path>, frequency: Frequency) -> anyhow::Result<()> {
    let config = Config::read(config_path)?;
    let db = open_store(&config)?;
    let coordinator = task_coordinator(&config, db);

    let runs = coordinator
        .run_scheduled(&config.tasks.schedule, frequency)
        .await;

    let mut failed = 0;
    for run in &runs {
        match &run.result {
            Ok(GuardedRun::Skipped { last_started }) => {
                info!(key = %run.key, %last_started, "Skipped");
            }
            Ok(GuardedRun::Ran(outcome)) => {
                info!(
                    key = %run.key,
                    succeeded = outcome.succeeded.len(),
                    failed = outcome.failed.len(),
                    "Ran"
                );
            }
            Err(e) => error!(key = %run.key, error = %e, "Failed"),
        }
        if !run.is_success() {
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} scheduled task(s) failed", failed, runs.len());
    }
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Another host process already owns this PID file
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, env = config.env.as_str(), "Starting site host");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        store = %config.store.path,
        "Server configuration"
    );
    info!(
        control_site = %config.control.tenant_id,
        control_hostnames = ?config.control.hostnames,
        hostname_mode = ?config.hostnames.mode,
        "Routing"
    );
    info!(
        command = %config.instances.command,
        ports = %format!("{}-{}", config.instances.port_range_start, config.instances.port_range_end),
        startup_timeout_secs = config.instances.startup_timeout_secs,
        max_build_secs = config.instances.max_build_secs,
        request_timeout_secs = config.instances.request_timeout_secs,
        "Instance settings"
    );
    info!(
        drain_timeout_secs = config.instances.drain_timeout_secs,
        shutdown_grace_period_secs = config.instances.shutdown_grace_period_secs,
        janitor_interval_secs = config.janitor.interval_secs,
        "Shutdown settings"
    );
}
