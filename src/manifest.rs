//! Manifest schema types and validation.
//!
//! A manifest is a JSON (or YAML) document describing one `agent`, `tool`, or
//! `mcp_server`. Validation is pure: it inspects a parsed document, collects
//! every offending path, and either returns a typed [`Manifest`] view or a
//! [`ValidationError`] listing all problems at once.
//!
//! Required top-level fields: `schema_version`, `type`, `id`, `version`,
//! `name`. Per-type payloads:
//!
//! | Type | Payload |
//! |------|---------|
//! | `agent` | optional `artifacts[]`, `adapters[]`, `mcp_registration` |
//! | `tool` | `implementation{runtime, entrypoint}` or `artifacts[]` |
//! | `mcp_server` | `mcp_registration{tool?, resources[], prompts[], server{...}}` |
//!
//! Unknown keys are preserved in the stored payload (the raw document is kept
//! verbatim) but ignored for validation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use url::Url;

use crate::error::HubError;
use crate::models::{EntityType, Uid};

/// One problem found during validation, anchored to a JSON path.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

/// All problems found in a manifest. Never empty.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid manifest: ")?;
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", issue.path, issue.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for HubError {
    fn from(e: ValidationError) -> Self {
        HubError::InvalidRequest(e.to_string())
    }
}

/// An install artifact declared by a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    Pypi {
        package: String,
        version: String,
    },
    Docker {
        image: String,
        #[serde(default)]
        tag: Option<String>,
        #[serde(default)]
        digest: Option<String>,
        #[serde(default)]
        pull_policy: Option<PullPolicy>,
    },
    Git {
        repo: String,
        #[serde(rename = "ref", default = "default_git_ref")]
        git_ref: String,
        dest: String,
    },
    Zip {
        url: String,
        #[serde(default)]
        sha256: Option<String>,
        dest: String,
    },
}

fn default_git_ref() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    Always,
    IfNotPresent,
}

/// An adapter scaffold request: `{framework, template_key}` expands into file
/// emissions under the install target's `src/` tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adapter {
    pub framework: String,
    pub template_key: String,
}

/// Runtime entrypoint of a `tool` manifest without artifact refs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub runtime: String,
    pub entrypoint: String,
}

/// Declarative gateway registration block carried by `agent` and `mcp_server`
/// manifests. Passed through to the gateway client unchanged; the planner only
/// checks structural completeness (at least one of `tool`, `server`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRegistration {
    #[serde(default)]
    pub tool: Option<GatewayToolSpec>,
    #[serde(default)]
    pub resources: Vec<GatewayResourceSpec>,
    #[serde(default)]
    pub prompts: Vec<GatewayPromptSpec>,
    #[serde(default)]
    pub server: Option<GatewayServerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayToolSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResourceSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPromptSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayServerSpec {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A validated manifest: typed projections of the fields the hub acts on,
/// plus the raw document kept verbatim for storage.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub raw: Value,
    pub entity_type: EntityType,
    pub id: String,
    pub version: String,
    pub name: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub homepage: Option<String>,
    pub publisher: Option<String>,
    pub license: Option<String>,
    pub capabilities: Vec<String>,
    pub frameworks: Vec<String>,
    pub providers: Vec<String>,
    pub quality_score: Option<f64>,
    pub artifacts: Vec<Artifact>,
    pub adapters: Vec<Adapter>,
    pub implementation: Option<Implementation>,
    pub mcp_registration: Option<McpRegistration>,
}

impl Manifest {
    pub fn uid(&self) -> Uid {
        Uid::new(self.entity_type, self.id.clone(), self.version.clone())
    }
}

/// Parse manifest bytes as JSON, falling back to YAML.
pub fn parse_document(body: &str) -> Result<Value, HubError> {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        return Ok(v);
    }
    serde_yaml::from_str::<Value>(body)
        .map_err(|e| HubError::InvalidRequest(format!("manifest is neither JSON nor YAML: {}", e)))
}

/// Validate a parsed manifest document.
///
/// Collects every issue before failing, so a caller sees all offending paths
/// in one pass rather than one per round-trip.
pub fn validate_manifest(doc: &Value) -> Result<Manifest, ValidationError> {
    let mut issues: Vec<ValidationIssue> = Vec::new();
    let mut push = |path: &str, message: String| {
        issues.push(ValidationIssue {
            path: path.to_string(),
            message,
        });
    };

    let obj = match doc.as_object() {
        Some(o) => o,
        None => {
            push("$", "manifest must be a JSON object".to_string());
            return Err(ValidationError { issues });
        }
    };

    if !obj.contains_key("schema_version") {
        push("$.schema_version", "required field is missing".to_string());
    }

    let entity_type = match obj.get("type").and_then(Value::as_str) {
        Some(s) => match s.parse::<EntityType>() {
            Ok(t) => Some(t),
            Err(_) => {
                push(
                    "$.type",
                    format!("'{}' is not one of agent, tool, mcp_server", s),
                );
                None
            }
        },
        None => {
            push("$.type", "required string field is missing".to_string());
            None
        }
    };

    let id = match obj.get("id").and_then(Value::as_str) {
        Some(s) if is_valid_slug(s) => Some(s.to_string()),
        Some(s) => {
            push(
                "$.id",
                format!(
                    "'{}' is not a valid slug (lowercase alphanumerics, '.', '_', '-'; must start and end alphanumeric)",
                    s
                ),
            );
            None
        }
        None => {
            push("$.id", "required string field is missing".to_string());
            None
        }
    };

    let version = match obj.get("version").and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Some(s.to_string()),
        Some(_) => {
            push("$.version", "must be non-empty".to_string());
            None
        }
        None => {
            push("$.version", "required string field is missing".to_string());
            None
        }
    };

    let name = match obj.get("name").and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Some(s.to_string()),
        Some(_) => {
            push("$.name", "must be non-empty".to_string());
            None
        }
        None => {
            push("$.name", "required string field is missing".to_string());
            None
        }
    };

    let homepage = opt_string(obj, "homepage");
    if let Some(ref h) = homepage {
        if Url::parse(h).is_err() {
            push("$.homepage", format!("'{}' is not an absolute URL", h));
        }
    }

    let capabilities = string_set(obj, "capabilities");
    let frameworks = string_set(obj, "frameworks");
    let providers = string_set(obj, "providers");

    let quality_score = obj.get("quality_score").and_then(Value::as_f64);

    let artifacts: Vec<Artifact> = match obj.get("artifacts") {
        None => Vec::new(),
        Some(v) => match v.as_array() {
            None => {
                push("$.artifacts", "must be an array".to_string());
                Vec::new()
            }
            Some(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    match serde_json::from_value::<Artifact>(item.clone()) {
                        Ok(a) => {
                            if let Artifact::Zip { url, .. } = &a {
                                if !is_http_url(url) {
                                    push(
                                        &format!("$.artifacts[{}].url", i),
                                        format!("'{}' must be an absolute http(s) URL", url),
                                    );
                                }
                            }
                            out.push(a);
                        }
                        Err(e) => push(&format!("$.artifacts[{}]", i), e.to_string()),
                    }
                }
                out
            }
        },
    };

    let adapters: Vec<Adapter> = match obj.get("adapters") {
        None => Vec::new(),
        Some(v) => match serde_json::from_value::<Vec<Adapter>>(v.clone()) {
            Ok(a) => a,
            Err(e) => {
                push("$.adapters", e.to_string());
                Vec::new()
            }
        },
    };

    let implementation: Option<Implementation> = match obj.get("implementation") {
        None => None,
        Some(v) => match serde_json::from_value::<Implementation>(v.clone()) {
            Ok(i) => Some(i),
            Err(e) => {
                push("$.implementation", e.to_string());
                None
            }
        },
    };

    let mcp_registration: Option<McpRegistration> = match obj.get("mcp_registration") {
        None => None,
        Some(v) => match serde_json::from_value::<McpRegistration>(v.clone()) {
            Ok(r) => {
                if let Some(server) = &r.server {
                    if let Some(u) = &server.url {
                        if !is_http_url(u) {
                            push(
                                "$.mcp_registration.server.url",
                                format!("'{}' must be an absolute http(s) URL", u),
                            );
                        }
                    }
                }
                Some(r)
            }
            Err(e) => {
                push("$.mcp_registration", e.to_string());
                None
            }
        },
    };

    // Per-type structural requirements.
    match entity_type {
        Some(EntityType::Tool) => {
            if implementation.is_none() && artifacts.is_empty() {
                push(
                    "$",
                    "a tool manifest needs either implementation{runtime, entrypoint} or artifacts[]"
                        .to_string(),
                );
            }
        }
        Some(EntityType::McpServer) => match &mcp_registration {
            None => push(
                "$.mcp_registration",
                "required for mcp_server manifests".to_string(),
            ),
            Some(r) if r.tool.is_none() && r.server.is_none() => push(
                "$.mcp_registration",
                "must declare at least one of tool, server".to_string(),
            ),
            _ => {}
        },
        _ => {}
    }

    if !issues.is_empty() {
        return Err(ValidationError { issues });
    }

    Ok(Manifest {
        raw: doc.clone(),
        entity_type: entity_type.expect("checked above"),
        id: id.expect("checked above"),
        version: version.expect("checked above"),
        name: name.expect("checked above"),
        summary: opt_string(obj, "summary"),
        description: opt_string(obj, "description"),
        homepage,
        publisher: opt_string(obj, "publisher"),
        license: opt_string(obj, "license"),
        capabilities,
        frameworks,
        providers,
        quality_score,
        artifacts,
        adapters,
        implementation,
        mcp_registration,
    })
}

fn opt_string(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

/// Read a string array, dropping non-strings and deduplicating while
/// preserving first-seen order.
fn string_set(obj: &serde_json::Map<String, Value>, key: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if let Some(items) = obj.get(key).and_then(Value::as_array) {
        for item in items {
            if let Some(s) = item.as_str() {
                if !out.iter().any(|existing| existing == s) {
                    out.push(s.to_string());
                }
            }
        }
    }
    out
}

/// `[a-z0-9](?:[a-z0-9._-]*[a-z0-9])?` without a regex engine.
fn is_valid_slug(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.is_empty() {
        return false;
    }
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes
        .iter()
        .all(|&b| alnum(b) || b == b'.' || b == b'_' || b == b'-')
}

fn is_http_url(s: &str) -> bool {
    match Url::parse(s) {
        Ok(u) => u.scheme() == "http" || u.scheme() == "https",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_mcp_server() -> Value {
        json!({
            "schema_version": 1,
            "type": "mcp_server",
            "id": "hello",
            "version": "0.1.0",
            "name": "Hello SSE",
            "capabilities": ["hello"],
            "mcp_registration": {
                "server": { "name": "hello", "url": "http://h:6288" }
            }
        })
    }

    #[test]
    fn accepts_minimal_mcp_server() {
        let m = validate_manifest(&minimal_mcp_server()).unwrap();
        assert_eq!(m.uid().to_string(), "mcp_server:hello@0.1.0");
        assert_eq!(m.capabilities, vec!["hello"]);
        let server = m.mcp_registration.unwrap().server.unwrap();
        assert_eq!(server.url.as_deref(), Some("http://h:6288"));
    }

    #[test]
    fn rejects_missing_required_fields() {
        let err = validate_manifest(&json!({"type": "tool"})).unwrap_err();
        let paths: Vec<&str> = err.issues.iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"$.schema_version"));
        assert!(paths.contains(&"$.id"));
        assert!(paths.contains(&"$.version"));
        assert!(paths.contains(&"$.name"));
    }

    #[test]
    fn rejects_bad_slug() {
        let mut doc = minimal_mcp_server();
        doc["id"] = json!("Hello_World");
        let err = validate_manifest(&doc).unwrap_err();
        assert!(err.issues.iter().any(|i| i.path == "$.id"));

        doc["id"] = json!("-leading");
        assert!(validate_manifest(&doc).is_err());
        doc["id"] = json!("trailing.");
        assert!(validate_manifest(&doc).is_err());
        doc["id"] = json!("ok-1.2_x");
        assert!(validate_manifest(&doc).is_ok());
    }

    #[test]
    fn rejects_relative_server_url() {
        let mut doc = minimal_mcp_server();
        doc["mcp_registration"]["server"]["url"] = json!("/sse");
        let err = validate_manifest(&doc).unwrap_err();
        assert!(err
            .issues
            .iter()
            .any(|i| i.path == "$.mcp_registration.server.url"));
    }

    #[test]
    fn mcp_server_requires_tool_or_server() {
        let mut doc = minimal_mcp_server();
        doc["mcp_registration"] = json!({ "resources": [] });
        let err = validate_manifest(&doc).unwrap_err();
        assert!(err
            .issues
            .iter()
            .any(|i| i.path == "$.mcp_registration" && i.message.contains("at least one")));
    }

    #[test]
    fn tool_requires_implementation_or_artifacts() {
        let doc = json!({
            "schema_version": 1,
            "type": "tool",
            "id": "pdf",
            "version": "1.4.2",
            "name": "PDF Summarizer"
        });
        assert!(validate_manifest(&doc).is_err());

        let with_impl = json!({
            "schema_version": 1,
            "type": "tool",
            "id": "pdf",
            "version": "1.4.2",
            "name": "PDF Summarizer",
            "implementation": { "runtime": "python3.11", "entrypoint": "pdf.main:run" }
        });
        assert!(validate_manifest(&with_impl).is_ok());
    }

    #[test]
    fn artifacts_parse_all_kinds() {
        let doc = json!({
            "schema_version": 1,
            "type": "agent",
            "id": "multi",
            "version": "2.0.0",
            "name": "Multi",
            "artifacts": [
                { "kind": "pypi", "package": "pdf-tools", "version": "1.4.2" },
                { "kind": "docker", "image": "ghcr.io/acme/pdf", "tag": "1.4.2" },
                { "kind": "git", "repo": "https://github.com/acme/pdf.git", "ref": "v1.4.2", "dest": "vendor/pdf" },
                { "kind": "zip", "url": "https://ex/pdf.zip", "sha256": "ab", "dest": "vendor/zip" }
            ]
        });
        let m = validate_manifest(&doc).unwrap();
        assert_eq!(m.artifacts.len(), 4);
        match &m.artifacts[2] {
            Artifact::Git { git_ref, .. } => assert_eq!(git_ref, "v1.4.2"),
            other => panic!("expected git artifact, got {:?}", other),
        }
    }

    #[test]
    fn zip_artifact_requires_http_url() {
        let doc = json!({
            "schema_version": 1,
            "type": "agent",
            "id": "bad",
            "version": "1.0.0",
            "name": "Bad",
            "artifacts": [
                { "kind": "zip", "url": "file:///etc/passwd", "dest": "x" }
            ]
        });
        let err = validate_manifest(&doc).unwrap_err();
        assert!(err.issues.iter().any(|i| i.path == "$.artifacts[0].url"));
    }

    #[test]
    fn sets_are_deduplicated() {
        let doc = json!({
            "schema_version": 1,
            "type": "tool",
            "id": "pdf",
            "version": "1.4.2",
            "name": "PDF",
            "implementation": { "runtime": "python3.11", "entrypoint": "x:y" },
            "capabilities": ["pdf", "summarize", "pdf"]
        });
        let m = validate_manifest(&doc).unwrap();
        assert_eq!(m.capabilities, vec!["pdf", "summarize"]);
    }

    #[test]
    fn unknown_keys_preserved_in_raw() {
        let mut doc = minimal_mcp_server();
        doc["x_vendor_hint"] = json!({"nested": true});
        let m = validate_manifest(&doc).unwrap();
        assert_eq!(m.raw["x_vendor_hint"]["nested"], json!(true));
    }

    #[test]
    fn yaml_fallback_parses() {
        let v = parse_document("type: tool\nid: pdf\n").unwrap();
        assert_eq!(v["type"], json!("tool"));
    }
}
