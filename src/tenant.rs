//! Tenant records and the read-only registry interface
//!
//! Records are owned by the shared store and written by an administrative
//! surface outside this process. The host only reads them, except for the
//! throwaway sites it creates for one-off task runs.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Whole-site redirect configured on a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    /// Absolute target URL
    pub url: String,
    /// Append the request path and query to `url`
    #[serde(default)]
    pub preserve_path: bool,
    /// 301 or 302
    #[serde(default = "default_redirect_status")]
    pub status: u16,
}

impl Redirect {
    /// Build the Location value for a request target such as `/foo?bar=1`
    pub fn location(&self, path_and_query: &str) -> String {
        if !self.preserve_path {
            return self.url.clone();
        }
        let base = self.url.trim_end_matches('/');
        if path_and_query.starts_with('/') {
            format!("{}{}", base, path_and_query)
        } else {
            format!("{}/{}", base, path_and_query)
        }
    }
}

pub(crate) fn default_redirect_status() -> u16 {
    302
}

/// A tenant as stored in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: String,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default = "default_true")]
    pub published: bool,
    #[serde(default)]
    pub trashed: bool,
    /// Bumped on every configuration change
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub redirect: Option<Redirect>,
    #[serde(default)]
    pub canonical_hostname: Option<String>,
    #[serde(default)]
    pub canonicalize: bool,
    #[serde(default = "default_redirect_status")]
    pub canonicalize_status: u16,
    /// Base URL per environment name ("dev", "staging", "prod")
    #[serde(default)]
    pub base_urls: HashMap<String, String>,
    /// Theme the site application starts with
    #[serde(default)]
    pub theme: Option<String>,
}

fn default_true() -> bool {
    true
}

impl TenantRecord {
    /// Create a published record with a single hostname
    pub fn new(id: &str, hostname: &str) -> Self {
        Self {
            id: id.to_string(),
            short_name: None,
            hostnames: vec![hostname.to_lowercase()],
            published: true,
            trashed: false,
            updated_at: Utc::now(),
            redirect: None,
            canonical_hostname: None,
            canonicalize: false,
            canonicalize_status: default_redirect_status(),
            base_urls: HashMap::new(),
            theme: None,
        }
    }

    /// Unpublished record with a fresh id and no hostnames, used for
    /// one-off task runs
    pub fn temporary(theme: Option<String>) -> Self {
        let mut record = Self::new(&format!("tmp-{}", uuid::Uuid::new_v4().simple()), "");
        record.hostnames.clear();
        record.published = false;
        record.theme = theme;
        record
    }

    /// Only published records outside the trash are served
    pub fn is_servable(&self) -> bool {
        self.published && !self.trashed
    }

    /// Name used to prefix log lines for this tenant
    pub fn display_name(&self) -> &str {
        self.short_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.hostnames.first().map(String::as_str))
            .unwrap_or(&self.id)
    }

    /// Canonical hostname to redirect to, if canonicalization applies to `hostname`
    pub fn canonical_redirect_target(&self, hostname: &str) -> Option<&str> {
        if !self.canonicalize {
            return None;
        }
        let canonical = self.canonical_hostname.as_deref()?;
        if canonical.is_empty() || canonical.eq_ignore_ascii_case(hostname) {
            return None;
        }
        Some(canonical)
    }

    pub fn has_hostname(&self, hostname: &str) -> bool {
        self.hostnames.iter().any(|h| h == hostname)
    }

    pub fn base_url(&self, env: &str) -> Option<&str> {
        self.base_urls.get(env).map(String::as_str)
    }
}

/// Which tenants a listing should include
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantFilter {
    /// Published tenants only
    Live,
    /// Every tenant outside the trash, published or not
    All,
}

/// Read-only queries against the tenant registry.
///
/// Every query excludes trashed tenants.
#[async_trait]
pub trait TenantRegistry: Send + Sync {
    /// Live tenant owning `hostname` (exact, lower-case match)
    async fn find_by_hostname(&self, hostname: &str) -> Result<Option<TenantRecord>>;

    /// Live tenant with the given id
    async fn find_by_id(&self, id: &str) -> Result<Option<TenantRecord>>;

    /// Live tenant with the given short name
    async fn find_by_short_name(&self, short_name: &str) -> Result<Option<TenantRecord>>;

    /// Tenant matching an id or a hostname, published or not
    async fn find_any(&self, id_or_hostname: &str) -> Result<Option<TenantRecord>>;

    /// The subset of `ids` that are still live
    async fn live_ids(&self, ids: &[String]) -> Result<Vec<String>>;

    /// Records matching the filter, ordered by id
    async fn list(&self, filter: TenantFilter) -> Result<Vec<TenantRecord>>;
}

/// Creates and deletes sites the host itself owns
#[async_trait]
pub trait SiteStore: Send + Sync {
    /// Store a new site and return it as stored
    async fn create_site(&self, record: &TenantRecord) -> Result<TenantRecord>;

    /// Delete a site and its hostnames. Returns false if it did not exist.
    async fn remove_site(&self, tenant_id: &str) -> Result<bool>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_preserves_path() {
        let redirect = Redirect {
            url: "https://other.example".to_string(),
            preserve_path: true,
            status: 302,
        };
        assert_eq!(redirect.location("/foo"), "https://other.example/foo");
        assert_eq!(redirect.location("/foo?a=1"), "https://other.example/foo?a=1");
    }

    #[test]
    fn test_redirect_trailing_slash() {
        let redirect = Redirect {
            url: "https://other.example/".to_string(),
            preserve_path: true,
            status: 301,
        };
        assert_eq!(redirect.location("/foo"), "https://other.example/foo");
    }

    #[test]
    fn test_redirect_without_path() {
        let redirect = Redirect {
            url: "https://other.example/landing".to_string(),
            preserve_path: false,
            status: 302,
        };
        assert_eq!(redirect.location("/foo"), "https://other.example/landing");
    }

    #[test]
    fn test_servable() {
        let mut record = TenantRecord::new("a", "a.example");
        assert!(record.is_servable());
        record.trashed = true;
        assert!(!record.is_servable());
        record.trashed = false;
        record.published = false;
        assert!(!record.is_servable());
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut record = TenantRecord::new("abc", "A.Example");
        assert_eq!(record.display_name(), "a.example");
        record.short_name = Some("nifty".to_string());
        assert_eq!(record.display_name(), "nifty");
        record.short_name = None;
        record.hostnames.clear();
        assert_eq!(record.display_name(), "abc");
    }

    #[test]
    fn test_temporary_record() {
        let first = TenantRecord::temporary(Some("blog".to_string()));
        let second = TenantRecord::temporary(None);
        assert!(first.id.starts_with("tmp-"));
        assert_ne!(first.id, second.id);
        assert!(first.hostnames.is_empty());
        assert!(!first.published);
        assert!(!first.is_servable());
        assert_eq!(first.theme.as_deref(), Some("blog"));
        assert_eq!(first.display_name(), first.id);
    }

    #[test]
    fn test_has_hostname() {
        let mut record = TenantRecord::new("abc", "nifty.example");
        record.hostnames.push("www.nifty.example".to_string());
        assert!(record.has_hostname("www.nifty.example"));
        assert!(!record.has_hostname("nifty"));
        assert!(!record.has_hostname("other.example"));
    }

    #[test]
    fn test_canonical_redirect_target() {
        let mut record = TenantRecord::new("abc", "nifty.staging.example");
        record.hostnames.push("www.nifty.com".to_string());
        record.canonical_hostname = Some("www.nifty.com".to_string());

        // Not enabled
        assert_eq!(record.canonical_redirect_target("nifty.staging.example"), None);

        record.canonicalize = true;
        assert_eq!(
            record.canonical_redirect_target("nifty.staging.example"),
            Some("www.nifty.com")
        );
        assert_eq!(record.canonical_redirect_target("WWW.nifty.com"), None);
    }

    #[test]
    fn test_record_from_toml_defaults() {
        let record: TenantRecord = toml::from_str(
            r#"
id = "site-1"
hostnames = ["one.example"]
updated_at = "2024-01-01T00:00:00Z"
"#,
        )
        .unwrap();
        assert!(record.published);
        assert!(!record.trashed);
        assert_eq!(record.canonicalize_status, 302);
        assert!(record.redirect.is_none());
    }
}
