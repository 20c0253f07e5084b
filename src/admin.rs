use crate::cache::TenantCache;
use crate::pool::ConnectionPool;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the host
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = response(status, body.to_string());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// State shared by every admin connection
struct AdminState {
    cache: Arc<TenantCache>,
    pool: Option<Arc<ConnectionPool>>,
    auth_token: String,
}

/// Loopback admin API for inspecting and evicting cached instances
pub struct AdminServer {
    listener: TcpListener,
    state: AdminState,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    /// Bind on 127.0.0.1. Port 0 picks a free port.
    pub async fn bind(
        port: u16,
        cache: Arc<TenantCache>,
        auth_token: String,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).await?;
        Ok(Self {
            listener,
            state: AdminState {
                cache,
                pool: None,
                auth_token,
            },
            shutdown_rx,
        })
    }

    /// Include connection pool counters in `GET /instances`
    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.state.pool = Some(pool);
        self
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn auth_token(&self) -> &str {
        &self.state.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let shared = Arc::new(self.state);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&shared);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, state: Arc<AdminState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| !expected_token.is_empty() && token == expected_token)
        .unwrap_or(false)
}

async fn handle_admin_request<B>(
    req: Request<B>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let authorized = check_auth(&req, &state.auth_token);
    drop(req);

    debug!(%method, %path, "Admin API request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        (&Method::GET, "/instances") | (&Method::POST, _) if !authorized => {
            warn!(path = %path, "Unauthorized admin API request");
            response(StatusCode::UNAUTHORIZED, "unauthorized")
        }

        (&Method::GET, "/instances") => {
            let instances = state.cache.snapshot();
            let mut body = serde_json::json!({
                "count": instances.len(),
                "instances": instances,
            });
            if let Some(pool) = &state.pool {
                body["pool"] = serde_json::json!(pool.stats());
            }
            json_response(StatusCode::OK, body)
        }

        // POST /instances/{id}/evict
        (&Method::POST, path) if path.starts_with("/instances/") && path.ends_with("/evict") => {
            let tenant_id = path
                .trim_start_matches("/instances/")
                .trim_end_matches("/evict");
            if tenant_id.is_empty() || tenant_id.contains('/') {
                response(StatusCode::BAD_REQUEST, "invalid site id")
            } else if state.cache.evict(tenant_id, "admin").await {
                info!(tenant_id, "Instance evicted via admin API");
                json_response(StatusCode::OK, serde_json::json!({ "evicted": tenant_id }))
            } else {
                response(StatusCode::NOT_FOUND, "no ready instance")
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
