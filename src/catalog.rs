//! Reusable request templates and the read-only catalog the runner looks
//! them up in.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    /// File the collection was imported from, used by qualified request ids.
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub requests: Vec<RequestTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTemplate {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<KeyValue>,
    #[serde(default)]
    pub params: Vec<KeyValue>,
    #[serde(default)]
    pub body: RequestBody,
    /// Auth profile attached to this request; falls back to the run default when absent.
    #[serde(default)]
    pub auth_id: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyMode {
    #[default]
    None,
    Json,
    Raw,
    Urlencoded,
    FormData,
}

impl BodyMode {
    /// Content-Type implied by the body mode when the request sets none.
    pub fn content_type(self) -> Option<&'static str> {
        match self {
            BodyMode::None => None,
            BodyMode::Json => Some("application/json"),
            BodyMode::Raw => Some("text/plain"),
            BodyMode::Urlencoded => Some("application/x-www-form-urlencoded"),
            BodyMode::FormData => Some("multipart/form-data"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestBody {
    #[serde(default)]
    pub mode: BodyMode,
    /// Text payload for `json` and `raw` modes.
    #[serde(default)]
    pub raw: String,
    /// Field rows for `urlencoded` and `form_data` modes.
    #[serde(default)]
    pub form: Vec<KeyValue>,
}

impl RequestBody {
    pub fn has_content(&self) -> bool {
        match self.mode {
            BodyMode::None => false,
            BodyMode::Json | BodyMode::Raw => !self.raw.trim().is_empty(),
            BodyMode::Urlencoded | BodyMode::FormData => self.form.iter().any(|f| f.enabled),
        }
    }
}

/// Read-only lookup of stored request definitions.
pub trait RequestCatalog: Send + Sync {
    /// Find a request by item id, optionally restricted to one collection
    /// (matched by collection file or id).
    fn find(&self, collection: Option<&str>, item_id: &str) -> Option<RequestTemplate>;

    /// Resolve a possibly collection-qualified id (`"<collectionFile>:<itemId>"`).
    fn lookup(&self, request_id: &str) -> Option<RequestTemplate> {
        let (collection, item_id) = split_request_id(request_id);
        self.find(collection, item_id)
    }
}

/// Split a request id on its last `:` into (collection, item).
pub fn split_request_id(request_id: &str) -> (Option<&str>, &str) {
    match request_id.rsplit_once(':') {
        Some((collection, item)) if !collection.is_empty() && !item.is_empty() => {
            (Some(collection), item)
        }
        _ => (None, request_id),
    }
}

/// Search a list of collections the way the workspace catalog does.
pub fn find_in_collections(
    collections: &[Collection],
    collection: Option<&str>,
    item_id: &str,
) -> Option<RequestTemplate> {
    collections
        .iter()
        .filter(|c| match collection {
            Some(key) => c.file == key || c.id == key,
            None => true,
        })
        .flat_map(|c| c.requests.iter())
        .find(|r| r.id == item_id)
        .cloned()
}

impl RequestCatalog for Vec<Collection> {
    fn find(&self, collection: Option<&str>, item_id: &str) -> Option<RequestTemplate> {
        find_in_collections(self, collection, item_id)
    }
}
