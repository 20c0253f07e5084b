//! Shared HTTP client for talking to site instance processes
//!
//! One pool per host process. Every process-backed instance forwards its
//! requests and health probes through it so connections are reused.

use crate::instance::{SiteRequest, SiteResponse};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Counters exposed through the admin API
#[derive(Debug, Default)]
pub struct PoolStats {
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    health_checks: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStatsSnapshot {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub health_checks: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            health_checks: self.health_checks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per instance
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, crate::instance::SiteBody>,
    /// Probes use an empty body type, so they get their own client
    health_client: Client<HttpConnector, Empty<Bytes>>,
    stats: PoolStats,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let health_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            health_client,
            stats: PoolStats::default(),
        }
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    /// Forward a request to the instance listening on `port`, keeping the
    /// original path, query and headers
    pub async fn forward(&self, req: SiteRequest, port: u16) -> Result<SiteResponse, PoolError> {
        let target = format!(
            "http://127.0.0.1:{}{}",
            port,
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );

        let uri: hyper::Uri = target
            .parse()
            .map_err(|e| PoolError::RequestBuild(format!("{}", e)))?;
        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        let upstream = Request::from_parts(parts, body);

        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        let response = match self.client.request(upstream).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(SiteResponse::from_parts(parts, body.boxed()))
    }

    /// True if the instance answers `path` with a 2xx
    pub async fn check_instance(&self, port: u16, path: &str) -> bool {
        let uri = format!("http://127.0.0.1:{}{}", port, path);

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        self.stats.health_checks.fetch_add(1, Ordering::Relaxed);

        match self.health_client.request(req).await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::testing::empty_request;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_check_instance_unreachable() {
        let pool = ConnectionPool::new(PoolConfig::default());
        // Port 1 is privileged and never has a site on it
        assert!(!pool.check_instance(1, "/").await);
        assert_eq!(pool.stats().health_checks, 1);
    }

    #[tokio::test]
    async fn test_forward_failure_counted() {
        let pool = ConnectionPool::new(PoolConfig::default());
        assert!(pool.forward(empty_request("/x?y=1"), 1).await.is_err());

        let stats = pool.stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.failed_requests, 1);
    }
}
