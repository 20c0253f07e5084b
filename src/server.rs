//! The public HTTP listener and hostname dispatcher
//!
//! Every request is routed by hostname to the control-plane site, a tenant
//! redirect, a canonical-hostname redirect, a tenant instance, or the orphan
//! handler when no live tenant owns the hostname.

use crate::cache::{TenantCache, TenantRef};
use crate::config::{Environment, HostnameMode};
use crate::error::{json_error_response, Error, SiteErrorCode};
use crate::instance::{SiteRequest, SiteResponse};
use crate::rotation::RotationController;
use crate::tenant::TenantRecord;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Interval for polling open connections while draining (in milliseconds)
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// Produces the response for hostnames no live tenant owns
pub type OrphanHandler = Arc<dyn Fn(&str, &SiteRequest) -> SiteResponse + Send + Sync>;

pub fn default_orphan_handler() -> OrphanHandler {
    Arc::new(|_hostname, _req| json_error_response(SiteErrorCode::UnknownHost, "Unknown site"))
}

/// Where a request goes, decided from the hostname alone
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Control,
    Orphan,
    Redirect { status: StatusCode, location: String },
    Serve(TenantRecord),
}

fn redirect_status(status: u16) -> StatusCode {
    StatusCode::from_u16(status)
        .ok()
        .filter(|s| s.is_redirection())
        .unwrap_or(StatusCode::FOUND)
}

pub struct Dispatcher {
    cache: Arc<TenantCache>,
    control: TenantRecord,
    env: Environment,
    mode: HostnameMode,
    base_domain: Option<String>,
    orphan: OrphanHandler,
    rotation: Option<Arc<RotationController>>,
}

impl Dispatcher {
    /// `control` carries the control-plane tenant id and hostnames. The
    /// tenant is pinned in the cache.
    pub fn new(cache: Arc<TenantCache>, control: TenantRecord, env: Environment) -> Self {
        cache.pin(&control.id);
        Self {
            cache,
            control,
            env,
            mode: HostnameMode::Explicit,
            base_domain: None,
            orphan: default_orphan_handler(),
            rotation: None,
        }
    }

    /// Map `<short_name>.<base_domain>` to tenants by short name
    pub fn with_short_names(mut self, base_domain: &str) -> Self {
        self.mode = HostnameMode::ShortName;
        self.base_domain = Some(base_domain.trim_start_matches('.').to_lowercase());
        self
    }

    pub fn with_orphan_handler(mut self, orphan: OrphanHandler) -> Self {
        self.orphan = orphan;
        self
    }

    pub fn with_rotation(mut self, rotation: Arc<RotationController>) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn cache(&self) -> &Arc<TenantCache> {
        &self.cache
    }

    fn short_name_for<'a>(&self, hostname: &'a str) -> Option<&'a str> {
        let domain = self.base_domain.as_deref()?;
        let short_name = hostname.strip_suffix(domain)?.strip_suffix('.')?;
        (!short_name.is_empty() && !short_name.contains('.')).then_some(short_name)
    }

    async fn find_tenant(&self, hostname: &str) -> crate::error::Result<Option<TenantRecord>> {
        let registry = self.cache.registry();
        if self.mode == HostnameMode::ShortName {
            if let Some(short_name) = self.short_name_for(hostname) {
                if let Some(record) = registry.find_by_short_name(short_name).await? {
                    return Ok(Some(record));
                }
            }
        }
        registry.find_by_hostname(hostname).await
    }

    /// Decide where a request for `hostname` goes
    pub async fn resolve_route(
        &self,
        hostname: &str,
        path_and_query: &str,
        proto: &str,
    ) -> crate::error::Result<Route> {
        if self.control.has_hostname(hostname) {
            return Ok(Route::Control);
        }

        let Some(record) = self.find_tenant(hostname).await? else {
            return Ok(Route::Orphan);
        };

        if let Some(redirect) = &record.redirect {
            return Ok(Route::Redirect {
                status: redirect_status(redirect.status),
                location: redirect.location(path_and_query),
            });
        }

        if self.env.is_production() {
            if let Some(canonical) = record.canonical_redirect_target(hostname) {
                return Ok(Route::Redirect {
                    status: redirect_status(record.canonicalize_status),
                    location: format!("{}://{}{}", proto, canonical, path_and_query),
                });
            }
        }

        Ok(Route::Serve(record))
    }

    /// Handle one request end to end. Never fails: errors become JSON
    /// responses.
    pub async fn handle(&self, mut req: SiteRequest, client_addr: SocketAddr) -> SiteResponse {
        strip_absolute_form(&mut req);

        let hostname = match extract_hostname(&req) {
            Some(h) => h,
            None => {
                return self.completed(json_error_response(
                    SiteErrorCode::MissingHostHeader,
                    "Missing or invalid Host header",
                ));
            }
        };

        let proto = req
            .headers()
            .get(X_FORWARDED_PROTO)
            .and_then(|v| v.to_str().ok())
            .filter(|p| *p == "https" || *p == "http")
            .unwrap_or("http")
            .to_string();
        let request_id = set_proxy_headers(&mut req, client_addr, &proto);
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        debug!(hostname = %hostname, method = %req.method(), uri = %req.uri(), request_id = %request_id, "Incoming request");

        let route = match self.resolve_route(&hostname, &path_and_query, &proto).await {
            Ok(route) => route,
            Err(e) => {
                error!(hostname = %hostname, error = %e, "Failed to resolve site");
                return self.completed(json_error_response(
                    SiteErrorCode::InternalError,
                    "Internal error",
                ));
            }
        };

        let response = match route {
            Route::Control => self.serve(TenantRef::Record(self.control.clone()), &hostname, req).await,
            Route::Serve(record) => self.serve(TenantRef::Record(record), &hostname, req).await,
            Route::Orphan => (self.orphan)(&hostname, &req),
            Route::Redirect { status, location } => redirect_response(status, &location),
        };
        self.completed(response)
    }

    fn completed(&self, response: SiteResponse) -> SiteResponse {
        if let Some(rotation) = &self.rotation {
            rotation.record_completed();
        }
        response
    }

    async fn serve(&self, tenant: TenantRef, hostname: &str, req: SiteRequest) -> SiteResponse {
        let tenant_id = tenant.id().to_string();
        let start = Instant::now();

        let handle = match self.cache.acquire(tenant.clone()).await {
            Ok(handle) => handle,
            Err(e) => return self.failure(&e, &tenant_id, hostname, &req),
        };

        // A teardown can retire the handle between acquire and dispatch.
        // The request comes back unconsumed, so one fresh acquire is enough.
        let req = match handle.try_dispatch(req).await {
            Ok(result) => return self.finish(result, &tenant_id, hostname, start),
            Err(req) => req,
        };
        debug!(tenant_id = %tenant_id, hostname, "Instance retired before dispatch, retrying");

        match self.cache.acquire(tenant).await {
            Ok(handle) => self.finish(handle.dispatch(req).await, &tenant_id, hostname, start),
            Err(e) => self.failure(&e, &tenant_id, hostname, &req),
        }
    }

    fn finish(
        &self,
        result: crate::error::Result<SiteResponse>,
        tenant_id: &str,
        hostname: &str,
        start: Instant,
    ) -> SiteResponse {
        match result {
            Ok(response) => {
                debug!(
                    tenant_id,
                    hostname,
                    status = response.status().as_u16(),
                    elapsed_ms = start.elapsed().as_millis(),
                    "Request served"
                );
                response
            }
            Err(e) => {
                error!(tenant_id, hostname, error = %e, "Site failed to handle request");
                json_error_response(SiteErrorCode::from(&e), "Site error")
            }
        }
    }

    fn failure(&self, err: &Error, tenant_id: &str, hostname: &str, req: &SiteRequest) -> SiteResponse {
        if let Error::TenantNotFound(_) = err {
            return (self.orphan)(hostname, req);
        }
        error!(tenant_id, hostname, error = %err, "Failed to start site");
        json_error_response(SiteErrorCode::from(err), "Site unavailable")
    }
}

/// Reduce `GET http://host/path` to `GET /path`, keeping the authority as
/// the Host header when none was sent
pub fn strip_absolute_form(req: &mut SiteRequest) {
    if req.uri().scheme().is_none() {
        return;
    }
    if !req.headers().contains_key(hyper::header::HOST) {
        if let Some(authority) = req.uri().authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                req.headers_mut().insert(hyper::header::HOST, value);
            }
        }
    }
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    if let Ok(uri) = path_and_query.parse::<Uri>() {
        *req.uri_mut() = uri;
    }
}

/// Host header (or HTTP/2 authority), port stripped, validated, lower-cased
pub fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    // Strip port if present
    let hostname = host.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen and dot only
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}

/// Overwrite the forwarding headers and return the request id
fn set_proxy_headers(req: &mut SiteRequest, client_addr: SocketAddr, proto: &str) -> String {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    if let Ok(value) = HeaderValue::from_str(proto) {
        headers.insert(X_FORWARDED_PROTO, value);
    }
    request_id
}

fn redirect_response(status: StatusCode, location: &str) -> SiteResponse {
    match HeaderValue::from_str(location) {
        Ok(value) => Response::builder()
            .status(status)
            .header(hyper::header::LOCATION, value)
            .header(hyper::header::CONTENT_TYPE, "text/plain")
            .body(
                Full::new(Bytes::from(format!("Redirecting to {}", location)))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .unwrap_or_else(|_| json_error_response(SiteErrorCode::InternalError, "Invalid redirect")),
        Err(_) => json_error_response(SiteErrorCode::InternalError, "Invalid redirect"),
    }
}

/// Counts open client connections
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The public listener
pub struct SiteServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
    keep_alive: Option<Duration>,
    drain_timeout: Duration,
    connections: Arc<AtomicUsize>,
}

impl SiteServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            dispatcher,
            shutdown_rx,
            keep_alive: Some(Duration::from_secs(100)),
            drain_timeout: Duration::from_secs(30),
            connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Keep idle client connections open this long between requests.
    /// `None` closes each HTTP/1 connection after one response.
    pub fn with_keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// How long open connections may take to finish after shutdown
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until shutdown, then let open connections finish
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Site server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let shutdown = self.shutdown_rx.clone();
                            let guard = ConnectionGuard::new(&self.connections);
                            let keep_alive = self.keep_alive;

                            tokio::spawn(async move {
                                let _guard = guard;
                                if let Err(e) = handle_connection(stream, addr, dispatcher, shutdown, keep_alive).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Site server shutting down");
                        break;
                    }
                }
            }
        }

        let SiteServer {
            listener,
            connections,
            drain_timeout,
            ..
        } = self;
        drop(listener);
        drain_connections(&connections, drain_timeout).await;
        Ok(())
    }
}

async fn drain_connections(connections: &AtomicUsize, drain_timeout: Duration) {
    let start = Instant::now();
    while connections.load(Ordering::SeqCst) > 0 {
        if start.elapsed() > drain_timeout {
            warn!(
                remaining = connections.load(Ordering::SeqCst),
                "Drain timeout exceeded, closing remaining connections"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
    }
    debug!(drained_in_ms = start.elapsed().as_millis(), "All connections closed");
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
    keep_alive: Option<Duration>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            let req = req.map(|body| body.boxed());
            Ok::<_, hyper::Error>(dispatcher.handle(req, addr).await)
        }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    match keep_alive {
        // The header read timer also runs while a kept-alive connection
        // waits for its next request
        Some(idle_timeout) => {
            builder
                .http1()
                .keep_alive(true)
                .timer(TokioTimer::new())
                .header_read_timeout(idle_timeout);
        }
        None => {
            builder.http1().keep_alive(false);
        }
    }
    builder.http2().max_concurrent_streams(250);

    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    let mut draining = *shutdown_rx.borrow();
    if draining {
        conn.as_mut().graceful_shutdown();
    }

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                return result.map_err(|e| anyhow::anyhow!("Connection error: {}", e));
            }
            changed = shutdown_rx.changed(), if !draining => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    draining = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
        }
    }
}
