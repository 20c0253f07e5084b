//! Tenant application instances and the factory that builds them
//!
//! An instance is opaque to the host: it is expensive to build, expensive to
//! tear down, and exposes a single `dispatch` operation once ready.

use crate::error::{Error, Result};
use crate::tenant::TenantRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::{Request, Response};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Interval for polling drain status during teardown (in milliseconds)
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

pub type SiteBody = BoxBody<Bytes, hyper::Error>;
pub type SiteRequest = Request<SiteBody>;
pub type SiteResponse = Response<SiteBody>;

/// Extra settings merged over the factory's per-site configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverlay {
    /// Environment variables for the instance
    pub env: HashMap<String, String>,
    /// Arguments appended to the instance command
    pub args: Vec<String>,
}

impl ConfigOverlay {
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// A running application instance serving one tenant
#[async_trait]
pub trait TenantInstance: Send + Sync {
    /// Handle one request
    async fn dispatch(&self, req: SiteRequest) -> Result<SiteResponse>;

    /// Release every resource owned by the instance. Must be idempotent.
    async fn shutdown(&self) -> Result<()>;
}

/// Builds instances for tenants
#[async_trait]
pub trait InstanceFactory: Send + Sync {
    async fn build(
        &self,
        record: &TenantRecord,
        overlay: &ConfigOverlay,
    ) -> Result<Arc<dyn TenantInstance>>;
}

/// Lifecycle state of a tenant's slot in the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// A build is in progress, no instance yet
    Pending,
    /// Serving requests
    Ready,
    /// Teardown has begun, no new dispatches are accepted
    Destroying,
}

struct HandleInner {
    tenant_id: String,
    built_at_version: DateTime<Utc>,
    ready_since: Instant,
    instance: Arc<dyn TenantInstance>,
    state: Mutex<InstanceState>,
    in_flight: AtomicUsize,
}

/// Shared handle to a built instance.
///
/// Clones refer to the same instance. Once the handle leaves `Ready`,
/// `dispatch` refuses new requests with [`Error::InstanceRetired`].
#[derive(Clone)]
pub struct InstanceHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("tenant_id", &self.inner.tenant_id)
            .field("built_at_version", &self.inner.built_at_version)
            .field("state", &self.state())
            .finish()
    }
}

/// Decrements the in-flight counter when the dispatch ends, even if the
/// caller stops waiting.
struct InFlightGuard {
    inner: Arc<HandleInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InstanceHandle {
    pub(crate) fn new(
        tenant_id: &str,
        built_at_version: DateTime<Utc>,
        instance: Arc<dyn TenantInstance>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                tenant_id: tenant_id.to_string(),
                built_at_version,
                ready_since: Instant::now(),
                instance,
                state: Mutex::new(InstanceState::Ready),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.inner.tenant_id
    }

    /// `updated_at` of the record this instance was built from
    pub fn built_at_version(&self) -> DateTime<Utc> {
        self.inner.built_at_version
    }

    pub fn state(&self) -> InstanceState {
        *self.inner.state.lock()
    }

    pub fn uptime(&self) -> Duration {
        self.inner.ready_since.elapsed()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// True when both handles refer to the same built instance
    pub fn same_instance(&self, other: &InstanceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Forward a request to the instance
    pub async fn dispatch(&self, req: SiteRequest) -> Result<SiteResponse> {
        let _guard = self.begin_dispatch()?;
        self.inner.instance.dispatch(req).await
    }

    /// Like `dispatch`, but hands the request back untouched when the handle
    /// has already retired
    pub async fn try_dispatch(
        &self,
        req: SiteRequest,
    ) -> std::result::Result<Result<SiteResponse>, SiteRequest> {
        let Ok(_guard) = self.begin_dispatch() else {
            return Err(req);
        };
        Ok(self.inner.instance.dispatch(req).await)
    }

    fn begin_dispatch(&self) -> Result<InFlightGuard> {
        let state = self.inner.state.lock();
        if *state != InstanceState::Ready {
            return Err(Error::InstanceRetired(self.inner.tenant_id.clone()));
        }
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(InFlightGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Stop accepting dispatches. Returns false if teardown had already begun.
    pub(crate) fn retire(&self) -> bool {
        let mut state = self.inner.state.lock();
        if *state == InstanceState::Destroying {
            return false;
        }
        *state = InstanceState::Destroying;
        true
    }

    /// Retire, wait for in-flight dispatches (bounded by `drain_timeout`),
    /// then shut the instance down.
    pub(crate) async fn teardown(&self, drain_timeout: Duration) -> Result<()> {
        let tenant_id = self.tenant_id();
        self.retire();

        let drain_start = Instant::now();
        while self.in_flight() > 0 {
            if drain_start.elapsed() > drain_timeout {
                warn!(
                    tenant_id,
                    remaining = self.in_flight(),
                    "Drain timeout exceeded, proceeding with teardown"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }
        let drained_in = drain_start.elapsed();
        if drained_in > Duration::from_millis(100) {
            info!(tenant_id, drained_in_ms = drained_in.as_millis(), "Drained in-flight requests");
        }

        self.inner.instance.shutdown().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process instances and factories for exercising the cache

    use super::*;
    use http_body_util::{BodyExt, Full};
    use std::sync::atomic::AtomicBool;

    pub fn text_response(body: &str) -> SiteResponse {
        Response::new(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
    }

    pub fn empty_request(path: &str) -> SiteRequest {
        Request::builder()
            .uri(path)
            .body(
                Full::new(Bytes::new())
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .unwrap()
    }

    pub struct EchoInstance {
        pub label: String,
        pub shutdowns: AtomicUsize,
        pub fail_shutdown: AtomicBool,
        pub dispatch_delay: Duration,
    }

    impl EchoInstance {
        pub fn new(label: &str) -> Self {
            Self {
                label: label.to_string(),
                shutdowns: AtomicUsize::new(0),
                fail_shutdown: AtomicBool::new(false),
                dispatch_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl TenantInstance for EchoInstance {
        async fn dispatch(&self, req: SiteRequest) -> Result<SiteResponse> {
            if !self.dispatch_delay.is_zero() {
                tokio::time::sleep(self.dispatch_delay).await;
            }
            Ok(text_response(&format!("{} {}", self.label, req.uri().path())))
        }

        async fn shutdown(&self) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            if self.fail_shutdown.load(Ordering::SeqCst) {
                return Err(Error::TeardownFailure {
                    tenant_id: self.label.clone(),
                    message: "refused".to_string(),
                });
            }
            Ok(())
        }
    }
}
