//! Named environments, global variables and auth profiles.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Hosts this profile may be sent to. Empty means any host.
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub kind: AuthKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthKind {
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        #[serde(default)]
        password: String,
    },
    ApiKey {
        key: String,
        value: String,
        #[serde(default)]
        location: ApiKeyLocation,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyLocation {
    #[default]
    Header,
    Query,
}

impl AuthProfile {
    /// Whether this profile may be attached to a request for `host` at `now`.
    /// Disabled, expired and domain-mismatched profiles are treated as absent.
    pub fn is_usable(&self, host: Option<&str>, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        if self.expires_at.is_some_and(|at| at <= now) {
            return false;
        }
        if self.domains.is_empty() {
            return true;
        }
        match host {
            Some(host) => self.domains.iter().any(|d| domain_matches(d, host)),
            None => false,
        }
    }
}

/// `example.com` matches only that host; `*.example.com` matches the apex
/// and any subdomain.
pub fn domain_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if pattern.is_empty() {
        return false;
    }
    match pattern.strip_prefix("*.") {
        Some(suffix) => host == suffix || host.ends_with(&format!(".{suffix}")),
        None => host == pattern,
    }
}

/// Read-only access to environments and credentials.
pub trait CredentialStore: Send + Sync {
    fn globals(&self) -> Vec<Variable>;
    fn environment(&self, id: &str) -> Option<Environment>;
    fn auth_profile(&self, id: &str) -> Option<AuthProfile>;
}

/// Merge enabled globals with the enabled variables of the selected
/// environment; environment values win on key collisions.
pub fn layered_variables(store: &dyn CredentialStore, environment_id: Option<&str>) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for var in store.globals().into_iter().filter(|v| v.enabled) {
        vars.insert(var.key, var.value);
    }

    let selected = environment_id.and_then(|id| {
        let env = store.environment(id);
        if env.is_none() {
            tracing::warn!(environment = %id, "environment not found, using globals only");
        }
        env
    });

    if let Some(env) = selected {
        for var in env.variables.into_iter().filter(|v| v.enabled) {
            vars.insert(var.key, var.value);
        }
    }
    vars
}
