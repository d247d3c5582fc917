use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use super::FlowNode;
use super::context::FlowContext;
use super::error::NodeError;
use super::graph::FlowGraph;
use super::resolver::{self, Resolution};
use crate::catalog::{BodyMode, KeyValue, RequestCatalog, RequestTemplate};
use crate::environments::{self, ApiKeyLocation, AuthKind, AuthProfile, CredentialStore};
use crate::http::{RequestConfig, ResolvedBody};

/// Unreserved characters stay as-is; everything else is percent-encoded.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

pub fn encode_component(raw: &str) -> String {
    utf8_percent_encode(raw, COMPONENT).to_string()
}

pub fn encode_form(fields: &[(String, String)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Turns a node's request template into an executable request.
pub struct RequestMaterializer<'a> {
    catalog: &'a dyn RequestCatalog,
    credentials: &'a dyn CredentialStore,
}

impl<'a> RequestMaterializer<'a> {
    pub fn new(catalog: &'a dyn RequestCatalog, credentials: &'a dyn CredentialStore) -> Self {
        Self { catalog, credentials }
    }

    /// Resolve URL, params, headers, body and auth for `node`. Response
    /// references are only bound for aliases upstream of the node; every
    /// unresolved name across the request is reported together.
    pub fn build_node_request(
        &self,
        graph: &FlowGraph<'_>,
        node: &FlowNode,
        context: &FlowContext,
        environment_id: Option<&str>,
        default_auth_id: Option<&str>,
    ) -> Result<RequestConfig, NodeError> {
        let template = self
            .catalog
            .lookup(&node.request_id)
            .ok_or_else(|| NodeError::RequestNotFound(node.request_id.clone()))?;

        let env_vars = environments::layered_variables(self.credentials, environment_id);
        let auth = self.auth_profile(&template, default_auth_id);

        let references = template_references(&template, auth.as_ref());
        let upstream = graph.upstream_aliases(&node.id);
        let bindings = context.to_variable_source(&upstream, &references);

        let mut resolver = Resolver {
            env_vars: &env_vars,
            bindings: &bindings,
            unresolved: Vec::new(),
        };

        let mut params = resolver.rows(&template.params);
        let mut headers = resolver.rows(&template.headers);
        let base_url = resolver.text(template.url.trim());
        let body = resolver.body(&template);

        if let Some(profile) = auth {
            let host = reqwest::Url::parse(&base_url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string));
            if profile.is_usable(host.as_deref(), Utc::now()) {
                apply_auth(&mut resolver, &profile.kind, &mut headers, &mut params);
            } else {
                tracing::debug!(auth = %profile.id, node = %node.alias, "auth profile not usable, sending unauthenticated");
            }
        }

        if !resolver.unresolved.is_empty() {
            return Err(NodeError::Unresolved(resolver.unresolved));
        }

        if let Some(content_type) = template.body.mode.content_type() {
            let explicit = headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type"));
            if template.body.has_content() && !explicit {
                headers.push(("Content-Type".to_string(), content_type.to_string()));
            }
        }

        let method = template.method.trim().to_ascii_uppercase();
        if method.is_empty() {
            return Err(NodeError::InvalidRequest("request has no method".into()));
        }
        if base_url.is_empty() {
            return Err(NodeError::InvalidRequest("request has no URL".into()));
        }

        Ok(RequestConfig {
            method,
            url: append_query(&base_url, &params),
            headers,
            body,
        })
    }

    fn auth_profile(&self, template: &RequestTemplate, default_auth_id: Option<&str>) -> Option<AuthProfile> {
        let id = template
            .auth_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .or(default_auth_id.filter(|id| !id.is_empty()))?;
        let profile = self.credentials.auth_profile(id);
        if profile.is_none() {
            tracing::warn!(auth = %id, request = %template.id, "auth profile not found, sending unauthenticated");
        }
        profile
    }
}

struct Resolver<'r> {
    env_vars: &'r HashMap<String, String>,
    bindings: &'r HashMap<String, String>,
    unresolved: Vec<String>,
}

impl Resolver<'_> {
    fn text(&mut self, template: &str) -> String {
        let Resolution { resolved, unresolved } = resolver::resolve(template, self.env_vars, self.bindings);
        for name in unresolved {
            if !self.unresolved.contains(&name) {
                self.unresolved.push(name);
            }
        }
        resolved
    }

    fn rows(&mut self, rows: &[KeyValue]) -> Vec<(String, String)> {
        rows.iter()
            .filter(|row| row.enabled && !row.key.trim().is_empty())
            .map(|row| (self.text(row.key.trim()), self.text(&row.value)))
            .collect()
    }

    fn body(&mut self, template: &RequestTemplate) -> ResolvedBody {
        let body = &template.body;
        if !body.has_content() {
            return ResolvedBody::None;
        }
        match body.mode {
            BodyMode::None => ResolvedBody::None,
            BodyMode::Json => ResolvedBody::Json(self.text(&body.raw)),
            BodyMode::Raw => ResolvedBody::Raw(self.text(&body.raw)),
            BodyMode::Urlencoded => ResolvedBody::Urlencoded(self.rows(&body.form)),
            BodyMode::FormData => ResolvedBody::FormData(self.rows(&body.form)),
        }
    }
}

fn apply_auth(
    resolver: &mut Resolver<'_>,
    kind: &AuthKind,
    headers: &mut Vec<(String, String)>,
    params: &mut Vec<(String, String)>,
) {
    match kind {
        AuthKind::Bearer { token } => {
            if !has_header(headers, "authorization") {
                let token = resolver.text(token);
                headers.push(("Authorization".into(), format!("Bearer {token}")));
            }
        }
        AuthKind::Basic { username, password } => {
            if !has_header(headers, "authorization") {
                let credentials = format!("{}:{}", resolver.text(username), resolver.text(password));
                headers.push(("Authorization".into(), format!("Basic {}", STANDARD.encode(credentials))));
            }
        }
        AuthKind::ApiKey { key, value, location } => {
            let key = resolver.text(key);
            match location {
                ApiKeyLocation::Header if !has_header(headers, &key) => {
                    let value = resolver.text(value);
                    headers.push((key, value));
                }
                ApiKeyLocation::Query if !params.iter().any(|(k, _)| *k == key) => {
                    let value = resolver.text(value);
                    params.push((key, value));
                }
                _ => {}
            }
        }
    }
}

fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
}

fn template_references(template: &RequestTemplate, auth: Option<&AuthProfile>) -> Vec<String> {
    let mut texts: Vec<&str> = vec![&template.url, &template.body.raw];
    for row in template.headers.iter().chain(&template.params).chain(&template.body.form) {
        texts.push(&row.key);
        texts.push(&row.value);
    }
    if let Some(profile) = auth {
        match &profile.kind {
            AuthKind::Bearer { token } => texts.push(token),
            AuthKind::Basic { username, password } => {
                texts.push(username);
                texts.push(password);
            }
            AuthKind::ApiKey { key, value, .. } => {
                texts.push(key);
                texts.push(value);
            }
        }
    }

    let mut references: Vec<String> = Vec::new();
    for text in texts {
        for name in resolver::references(text) {
            if !references.contains(&name) {
                references.push(name);
            }
        }
    }
    references
}

/// Append encoded query params, keeping any existing query and fragment.
fn append_query(url: &str, params: &[(String, String)]) -> String {
    if params.is_empty() {
        return url.to_string();
    }
    let (base, fragment) = match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    };
    let separator = if !base.contains('?') {
        "?"
    } else if base.ends_with('?') || base.ends_with('&') {
        ""
    } else {
        "&"
    };
    let mut out = format!("{base}{separator}{}", encode_form(params));
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}
