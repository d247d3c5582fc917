//! File-backed workspace: flows, request collections, variables and auth
//! profiles in one JSON (or YAML) document.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::catalog::{Collection, RequestCatalog, RequestTemplate, find_in_collections};
use crate::environments::{AuthProfile, CredentialStore, Environment, Variable};
use crate::flows::Flow;
use crate::flows::history::FlowRunResult;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(default)]
    pub flows: Vec<Flow>,
    #[serde(default)]
    pub collections: Vec<Collection>,
    #[serde(default)]
    pub globals: Vec<Variable>,
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub auths: Vec<AuthProfile>,
}

impl Workspace {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read workspace file: {}", path.display()))?;
        let workspace: Workspace = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse workspace YAML: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse workspace JSON: {}", path.display()))?
        };
        tracing::debug!(
            path = %path.display(),
            flows = workspace.flows.len(),
            collections = workspace.collections.len(),
            "loaded workspace"
        );
        Ok(workspace)
    }

    pub fn flow(&self, id: &str) -> Result<&Flow> {
        match self.flows.iter().find(|f| f.id == id || f.name == id) {
            Some(flow) => Ok(flow),
            None => bail!("flow not found: {id}"),
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    )
}

impl RequestCatalog for Workspace {
    fn find(&self, collection: Option<&str>, item_id: &str) -> Option<RequestTemplate> {
        find_in_collections(&self.collections, collection, item_id)
    }
}

impl CredentialStore for Workspace {
    fn globals(&self) -> Vec<Variable> {
        self.globals.clone()
    }

    fn environment(&self, id: &str) -> Option<Environment> {
        self.environments.iter().find(|e| e.id == id).cloned()
    }

    fn auth_profile(&self, id: &str) -> Option<AuthProfile> {
        self.auths.iter().find(|a| a.id == id).cloned()
    }
}

/// Write a finished run as pretty JSON, creating parent directories.
pub fn save_run(path: &Path, run: &FlowRunResult) -> Result<PathBuf> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output dir: {}", dir.display()))?;
    }
    let content = serde_json::to_string_pretty(run).context("failed to serialize run")?;
    std::fs::write(path, content)
        .with_context(|| format!("failed to write run file: {}", path.display()))?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environments::AuthKind;
    use std::io::Write;

    const WORKSPACE_JSON: &str = r#"{
        "flows": [{
            "id": "login",
            "name": "Login then profile",
            "nodes": [
                {"id": "n1", "requestId": "auth.json:token", "alias": "auth"},
                {"id": "n2", "requestId": "me", "alias": "me"}
            ],
            "connectors": [
                {"id": "c1", "sourceNodeId": "n1", "targetNodeId": "n2",
                 "condition": {"type": "status_equals", "status": 200}}
            ],
            "defaultEnvId": "dev"
        }],
        "collections": [
            {"id": "c-auth", "file": "auth.json", "name": "Auth", "requests": [
                {"id": "token", "method": "POST", "url": "{{base}}/token",
                 "body": {"mode": "json", "raw": "{\"user\":\"{{user}}\"}"}}
            ]},
            {"id": "c-api", "file": "api.json", "requests": [
                {"id": "me", "url": "{{base}}/me", "authId": "bearer"}
            ]}
        ],
        "globals": [{"key": "base", "value": "https://api.example.com"}],
        "environments": [{"id": "dev", "name": "Dev", "variables": [{"key": "user", "value": "dev"}]}],
        "auths": [{"id": "bearer", "name": "Token", "type": "bearer", "token": "{{auth.body.token}}"}]
    }"#;

    fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_json_workspace() {
        let file = write_temp(".json", WORKSPACE_JSON);
        let ws = Workspace::load(file.path()).unwrap();

        let flow = ws.flow("login").unwrap();
        assert_eq!(flow.nodes.len(), 2);
        assert_eq!(flow.default_env_id.as_deref(), Some("dev"));
        assert!(ws.flow("Login then profile").is_ok());
        assert!(ws.flow("nope").is_err());

        let token = ws.lookup("auth.json:token").unwrap();
        assert_eq!(token.method, "POST");
        assert!(ws.lookup("api.json:token").is_none());
        assert_eq!(ws.lookup("me").unwrap().auth_id.as_deref(), Some("bearer"));

        assert_eq!(ws.environment("dev").unwrap().variables[0].value, "dev");
        assert!(matches!(ws.auth_profile("bearer").unwrap().kind, AuthKind::Bearer { .. }));
    }

    #[test]
    fn test_load_yaml_workspace() {
        let yaml = r#"
flows:
  - id: ping
    name: Ping
    nodes:
      - id: n1
        requestId: ping
        alias: ping
collections:
  - id: main
    requests:
      - id: ping
        url: https://example.com/ping
"#;
        let file = write_temp(".yaml", yaml);
        let ws = Workspace::load(file.path()).unwrap();
        assert_eq!(ws.flow("ping").unwrap().nodes[0].alias, "ping");
        assert_eq!(ws.lookup("ping").unwrap().method, "GET");
    }

    #[test]
    fn test_load_reports_path_on_error() {
        let file = write_temp(".json", "{ not json");
        let err = Workspace::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse workspace JSON"));

        let missing = Path::new("/definitely/not/here.json");
        let err = Workspace::load(missing).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }

    #[test]
    fn test_save_run_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_temp(".json", WORKSPACE_JSON);
        let ws = Workspace::load(file.path()).unwrap();
        let run = FlowRunResult::new(ws.flow("login").unwrap(), "r1".into());

        let path = dir.path().join("runs").join("r1.json");
        save_run(&path, &run).unwrap();
        let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["runId"], "r1");
        assert_eq!(saved["nodeResults"]["n1"]["status"], "idle");
    }
}
