//! MCP Gateway admin-API client.
//!
//! Registers the runtime artifacts a manifest declares — tool, resources,
//! prompts, then a federated gateway (or virtual server) — against the
//! external gateway's admin API. All upserts are idempotent from the caller's
//! perspective: a `409 Conflict` means "already exists" and triggers ID
//! resolution against the matching list endpoint.
//!
//! # Registration Order
//!
//! 1. tool (when present)
//! 2. resources and prompts, with bounded parallelism (≤ 4)
//! 3. the federated gateway (`server.url` present) or virtual server
//!    (otherwise), strictly after every dependent upsert succeeded
//!
//! The gateway assigns numeric IDs; manifest IDs are opaque slugs. Resolved
//! numeric IDs are substituted into the final gateway/server payload as
//! `associated_tools` / `associated_resources` / `associated_prompts`.
//!
//! # Retry Policy
//!
//! Transient 5xx and network errors retry up to 3 times with jittered
//! exponential backoff (0.25s, 0.75s, 1.5s). `401`/`403` fail fast. Any 2xx
//! or 409 is terminal success. The total per-call budget, retries included,
//! is capped (default 30s).

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::GatewayConfig;
use crate::error::{HubError, HubResult};
use crate::manifest::McpRegistration;

const BACKOFF_MS: [u64; 3] = [250, 750, 1500];
const UPSERT_PARALLELISM: usize = 4;
const JWT_TTL_SECS: i64 = 300;

/// A gateway-assigned record ID. Numeric in practice, but the client
/// tolerates string IDs from older gateway builds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GatewayId {
    Num(i64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationKind {
    Tool,
    Resource,
    Prompt,
    Gateway,
    Server,
}

impl RegistrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationKind::Tool => "tool",
            RegistrationKind::Resource => "resource",
            RegistrationKind::Prompt => "prompt",
            RegistrationKind::Gateway => "gateway",
            RegistrationKind::Server => "server",
        }
    }
}

/// Outcome of one upsert within a registration sequence.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationRecord {
    pub kind: RegistrationKind,
    pub name: String,
    pub id: Option<GatewayId>,
    pub ok: bool,
    pub error: Option<String>,
    pub elapsed_secs: f64,
}

/// Full outcome of registering one manifest.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationReport {
    pub records: Vec<RegistrationRecord>,
    pub ok: bool,
}

impl RegistrationReport {
    pub fn error_summary(&self) -> Option<String> {
        let errors: Vec<String> = self
            .records
            .iter()
            .filter_map(|r| {
                r.error
                    .as_ref()
                    .map(|e| format!("{} {}: {}", r.kind.as_str(), r.name, e))
            })
            .collect();
        if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        }
    }
}

#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> HubResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| HubError::Integrity(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            config,
        })
    }

    /// Register everything a manifest declares, in dependency order.
    pub async fn register(&self, reg: &McpRegistration) -> RegistrationReport {
        let mut records: Vec<RegistrationRecord> = Vec::new();

        let tool_id = match &reg.tool {
            Some(tool) => {
                let name = tool.name.clone().unwrap_or_else(|| tool.id.clone());
                let mut payload = json!({ "name": name });
                merge_extra(&mut payload, &tool.extra);
                if let Some(d) = &tool.description {
                    payload["description"] = json!(d);
                }
                let record = self
                    .upsert(RegistrationKind::Tool, "/tools", &name, &tool.id, None, payload)
                    .await;
                let id = record.id.clone();
                records.push(record);
                id
            }
            None => None,
        };

        // Resources and prompts upsert with bounded parallelism; results are
        // re-ordered by declaration index before the final gateway call.
        let mut group: Vec<(usize, RegistrationRecord)> = Vec::new();
        let semaphore = Arc::new(Semaphore::new(UPSERT_PARALLELISM));
        let mut join_set: JoinSet<(usize, RegistrationRecord)> = JoinSet::new();

        for (i, resource) in reg.resources.iter().enumerate() {
            let client = self.clone();
            let resource = resource.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire().await;
                let name = resource.name.clone().unwrap_or_else(|| resource.id.clone());
                let mut payload = json!({ "name": name });
                merge_extra(&mut payload, &resource.extra);
                if let Some(u) = &resource.uri {
                    payload["uri"] = json!(u);
                }
                if let Some(d) = &resource.description {
                    payload["description"] = json!(d);
                }
                let record = client
                    .upsert(
                        RegistrationKind::Resource,
                        "/resources",
                        &name,
                        &resource.id,
                        resource.uri.as_deref(),
                        payload,
                    )
                    .await;
                (i, record)
            });
        }

        let prompt_offset = reg.resources.len();
        for (i, prompt) in reg.prompts.iter().enumerate() {
            let client = self.clone();
            let prompt = prompt.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire().await;
                let name = prompt.name.clone().unwrap_or_else(|| prompt.id.clone());
                let mut payload = json!({ "name": name });
                merge_extra(&mut payload, &prompt.extra);
                if let Some(t) = &prompt.template {
                    payload["template"] = json!(t);
                }
                if let Some(d) = &prompt.description {
                    payload["description"] = json!(d);
                }
                let record = client
                    .upsert(
                        RegistrationKind::Prompt,
                        "/prompts",
                        &name,
                        &prompt.id,
                        None,
                        payload,
                    )
                    .await;
                (prompt_offset + i, record)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(entry) => group.push(entry),
                Err(e) => tracing::error!(error = %e, "gateway upsert task panicked"),
            }
        }
        group.sort_by_key(|(i, _)| *i);

        let resource_ids: Vec<GatewayId> = group
            .iter()
            .filter(|(_, r)| r.kind == RegistrationKind::Resource)
            .filter_map(|(_, r)| r.id.clone())
            .collect();
        let prompt_ids: Vec<GatewayId> = group
            .iter()
            .filter(|(_, r)| r.kind == RegistrationKind::Prompt)
            .filter_map(|(_, r)| r.id.clone())
            .collect();

        let dependents_ok = records.iter().all(|r| r.ok) && group.iter().all(|(_, r)| r.ok);
        records.extend(group.into_iter().map(|(_, r)| r));

        // Final upsert runs strictly after every dependent succeeded.
        if let Some(server) = &reg.server {
            if !dependents_ok {
                records.push(RegistrationRecord {
                    kind: if server.url.is_some() {
                        RegistrationKind::Gateway
                    } else {
                        RegistrationKind::Server
                    },
                    name: server.name.clone(),
                    id: None,
                    ok: false,
                    error: Some("skipped: a dependent upsert failed".to_string()),
                    elapsed_secs: 0.0,
                });
            } else {
                let mut payload = json!({ "name": server.name });
                merge_extra(&mut payload, &server.extra);
                if let Some(d) = &server.description {
                    payload["description"] = json!(d);
                }
                if let Some(id) = &tool_id {
                    payload["associated_tools"] = json!([id]);
                }
                if !resource_ids.is_empty() {
                    payload["associated_resources"] = json!(resource_ids);
                }
                if !prompt_ids.is_empty() {
                    payload["associated_prompts"] = json!(prompt_ids);
                }

                let (kind, path) = match &server.url {
                    Some(raw_url) => {
                        let (normalized, dropped) =
                            normalize_sse_url(raw_url, server.transport.as_deref());
                        payload["url"] = json!(normalized);
                        if !dropped {
                            if let Some(t) = &server.transport {
                                payload["transport"] = json!(t);
                            }
                        }
                        (RegistrationKind::Gateway, "/gateways")
                    }
                    None => (RegistrationKind::Server, "/servers"),
                };

                let record = self
                    .upsert(kind, path, &server.name, &server.name, None, payload)
                    .await;
                records.push(record);
            }
        }

        let ok = records.iter().all(|r| r.ok);
        RegistrationReport { records, ok }
    }

    /// POST a create payload; on 409, resolve the existing record's ID from
    /// the list endpoint. Retries transient failures within the call budget.
    async fn upsert(
        &self,
        kind: RegistrationKind,
        path: &str,
        name: &str,
        slug: &str,
        uri: Option<&str>,
        payload: Value,
    ) -> RegistrationRecord {
        let started = Instant::now();
        let budget = Duration::from_secs(self.config.timeout_secs);
        let outcome = tokio::time::timeout(
            budget,
            self.create_or_resolve(path, name, slug, uri, &payload),
        )
        .await;

        let elapsed_secs = started.elapsed().as_secs_f64();
        match outcome {
            Ok(Ok(id)) => RegistrationRecord {
                kind,
                name: name.to_string(),
                id: Some(id),
                ok: true,
                error: None,
                elapsed_secs,
            },
            Ok(Err(e)) => RegistrationRecord {
                kind,
                name: name.to_string(),
                id: None,
                ok: false,
                error: Some(e.to_string()),
                elapsed_secs,
            },
            Err(_) => RegistrationRecord {
                kind,
                name: name.to_string(),
                id: None,
                ok: false,
                error: Some(format!("call budget of {}s exhausted", budget.as_secs())),
                elapsed_secs,
            },
        }
    }

    async fn create_or_resolve(
        &self,
        path: &str,
        name: &str,
        slug: &str,
        uri: Option<&str>,
        payload: &Value,
    ) -> HubResult<GatewayId> {
        let url = format!("{}{}", self.base_url, path);
        let auth = self.authorization_value()?;
        let mut last_err: Option<HubError> = None;

        for attempt in 0..=BACKOFF_MS.len() {
            if attempt > 0 {
                tokio::time::sleep(jittered(BACKOFF_MS[attempt - 1])).await;
            }

            let response = self
                .http
                .post(&url)
                .header(reqwest::header::AUTHORIZATION, &auth)
                .json(payload)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body: Value = resp.json().await.unwrap_or(Value::Null);
                        return extract_id(&body).ok_or_else(|| {
                            HubError::RemoteFailure(format!(
                                "gateway created {} but returned no id",
                                name
                            ))
                        });
                    }
                    match status.as_u16() {
                        409 => return self.resolve_conflict(path, slug, name, uri, &auth).await,
                        401 => {
                            return Err(HubError::Unauthorized(
                                "gateway rejected credentials".to_string(),
                            ))
                        }
                        403 => {
                            return Err(HubError::Forbidden(
                                "gateway denied access".to_string(),
                            ))
                        }
                        s if (500..600).contains(&s) => {
                            last_err = Some(HubError::Transient(format!(
                                "gateway returned {} for {}",
                                s, path
                            )));
                            continue;
                        }
                        s => {
                            let body = resp.text().await.unwrap_or_default();
                            return Err(HubError::RemoteFailure(format!(
                                "gateway returned {} for {}: {}",
                                s,
                                path,
                                excerpt(&body)
                            )));
                        }
                    }
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| HubError::Transient("gateway upsert exhausted retries".to_string())))
    }

    /// A 409 means the record exists; find it on the list endpoint.
    async fn resolve_conflict(
        &self,
        path: &str,
        slug: &str,
        name: &str,
        uri: Option<&str>,
        auth: &str,
    ) -> HubResult<GatewayId> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, auth)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(HubError::RemoteFailure(format!(
                "gateway list {} returned {} during 409 resolution",
                path,
                resp.status()
            )));
        }

        let body: Value = resp.json().await.map_err(HubError::from)?;
        let records = list_records(&body);
        resolve_existing(&records, slug, name, uri).ok_or_else(|| {
            HubError::Conflict(format!(
                "gateway reported a conflict for '{}' but no matching record was found on {}",
                name, path
            ))
        })
    }

    fn authorization_value(&self) -> HubResult<String> {
        if let Some(token) = &self.config.token {
            if token.starts_with("Bearer ") || token.starts_with("Basic ") {
                return Ok(token.clone());
            }
            return Ok(format!("Bearer {}", token));
        }
        match (&self.config.jwt_secret, &self.config.admin_username) {
            (Some(secret), Some(username)) => {
                Ok(format!("Bearer {}", mint_jwt(secret, username)?))
            }
            _ => Err(HubError::Unauthorized(
                "gateway credentials are not configured".to_string(),
            )),
        }
    }
}

#[derive(Serialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Mint a short-lived HS256 admin token.
pub fn mint_jwt(secret: &str, username: &str) -> HubResult<String> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: username.to_string(),
        iat: now,
        exp: now + JWT_TTL_SECS,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| HubError::Integrity(format!("cannot mint gateway JWT: {}", e)))
}

/// If the transport is SSE (or unspecified) and the URL lacks a `/sse`
/// suffix, append it and report that the explicit transport field should be
/// dropped. Applied transiently at call time; storage keeps the original URL.
pub fn normalize_sse_url(url: &str, transport: Option<&str>) -> (String, bool) {
    let is_sse = transport
        .map(|t| t.eq_ignore_ascii_case("sse"))
        .unwrap_or(true);
    if is_sse && !url.trim_end_matches('/').ends_with("/sse") {
        (format!("{}/sse", url.trim_end_matches('/')), true)
    } else {
        (url.to_string(), false)
    }
}

/// Match an existing gateway record by, in order: exact numeric id,
/// case-insensitive name, exact uri.
pub fn resolve_existing(
    records: &[Value],
    slug: &str,
    name: &str,
    uri: Option<&str>,
) -> Option<GatewayId> {
    if let Ok(wanted) = slug.parse::<i64>() {
        for rec in records {
            if rec.get("id").and_then(Value::as_i64) == Some(wanted) {
                return extract_id(rec);
            }
        }
    }

    for rec in records {
        if let Some(rec_name) = rec.get("name").and_then(Value::as_str) {
            if rec_name.eq_ignore_ascii_case(name) {
                return extract_id(rec);
            }
        }
    }

    if let Some(wanted_uri) = uri {
        for rec in records {
            if rec.get("uri").and_then(Value::as_str) == Some(wanted_uri) {
                return extract_id(rec);
            }
        }
    }

    None
}

fn extract_id(body: &Value) -> Option<GatewayId> {
    let candidate = body.get("id").or_else(|| body.pointer("/data/id"))?;
    if let Some(n) = candidate.as_i64() {
        return Some(GatewayId::Num(n));
    }
    candidate.as_str().map(|s| GatewayId::Str(s.to_string()))
}

/// List endpoints return either a bare array or `{items: []}` / `{data: []}`.
fn list_records(body: &Value) -> Vec<Value> {
    if let Some(arr) = body.as_array() {
        return arr.clone();
    }
    for key in ["items", "data"] {
        if let Some(arr) = body.get(key).and_then(Value::as_array) {
            return arr.clone();
        }
    }
    Vec::new()
}

fn merge_extra(payload: &mut Value, extra: &serde_json::Map<String, Value>) {
    if let Some(obj) = payload.as_object_mut() {
        for (k, v) in extra {
            obj.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

fn jittered(base_ms: u64) -> Duration {
    // ±25% spread around the base delay.
    let factor = 0.75 + fastrand::f64() * 0.5;
    Duration::from_millis((base_ms as f64 * factor) as u64)
}

fn excerpt(s: &str) -> String {
    let trimmed = s.trim();
    if trimmed.len() <= 200 {
        return trimmed.to_string();
    }
    let mut end = 200;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &trimmed[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
    use serde::Deserialize;

    #[test]
    fn sse_suffix_appended_when_missing() {
        let (url, dropped) = normalize_sse_url("http://h:6288", None);
        assert_eq!(url, "http://h:6288/sse");
        assert!(dropped);

        let (url, dropped) = normalize_sse_url("http://h:6288/", Some("sse"));
        assert_eq!(url, "http://h:6288/sse");
        assert!(dropped);
    }

    #[test]
    fn sse_suffix_preserved_when_present() {
        let (url, dropped) = normalize_sse_url("http://h:6288/sse", None);
        assert_eq!(url, "http://h:6288/sse");
        assert!(!dropped);
    }

    #[test]
    fn non_sse_transport_left_alone() {
        let (url, dropped) = normalize_sse_url("http://h:6288", Some("streamable_http"));
        assert_eq!(url, "http://h:6288");
        assert!(!dropped);
    }

    #[test]
    fn resolve_prefers_numeric_id() {
        let records = vec![
            serde_json::json!({"id": 7, "name": "other"}),
            serde_json::json!({"id": 9, "name": "7"}),
        ];
        let id = resolve_existing(&records, "7", "missing", None).unwrap();
        assert_eq!(id, GatewayId::Num(7));
    }

    #[test]
    fn resolve_falls_back_to_name_case_insensitive() {
        let records = vec![
            serde_json::json!({"id": 3, "name": "Watsonx-Agent-Code"}),
            serde_json::json!({"id": 4, "name": "unrelated"}),
        ];
        let id = resolve_existing(&records, "watsonx-agent-code", "watsonx-agent-code", None)
            .unwrap();
        assert_eq!(id, GatewayId::Num(3));
    }

    #[test]
    fn resolve_falls_back_to_uri() {
        let records = vec![serde_json::json!({"id": 11, "name": "x", "uri": "res://code"})];
        let id = resolve_existing(&records, "slug", "nomatch", Some("res://code")).unwrap();
        assert_eq!(id, GatewayId::Num(11));
    }

    #[test]
    fn resolve_returns_none_without_match() {
        let records = vec![serde_json::json!({"id": 1, "name": "a"})];
        assert!(resolve_existing(&records, "b", "b", None).is_none());
    }

    #[test]
    fn list_records_accepts_wrapped_shapes() {
        assert_eq!(list_records(&serde_json::json!([{"id": 1}])).len(), 1);
        assert_eq!(
            list_records(&serde_json::json!({"items": [{"id": 1}, {"id": 2}]})).len(),
            2
        );
        assert_eq!(list_records(&serde_json::json!({"data": [{"id": 1}]})).len(), 1);
        assert!(list_records(&serde_json::json!({"other": true})).is_empty());
    }

    #[test]
    fn minted_jwt_roundtrips() {
        #[derive(Deserialize)]
        struct Decoded {
            sub: String,
            exp: i64,
            iat: i64,
        }

        let token = mint_jwt("secret", "admin").unwrap();
        let decoded = decode::<Decoded>(
            &token,
            &DecodingKey::from_secret(b"secret"),
            &Validation::new(Algorithm::HS256),
        )
        .unwrap();
        assert_eq!(decoded.claims.sub, "admin");
        assert_eq!(decoded.claims.exp - decoded.claims.iat, JWT_TTL_SECS);
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..100 {
            let d = jittered(1000);
            assert!(d >= Duration::from_millis(750));
            assert!(d <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn raw_token_gets_bearer_prefix() {
        let config = GatewayConfig {
            url: "http://gw:4444".to_string(),
            token: Some("abc123".to_string()),
            jwt_secret: None,
            admin_username: None,
            timeout_secs: 30,
        };
        let client = GatewayClient::new(config).unwrap();
        assert_eq!(client.authorization_value().unwrap(), "Bearer abc123");
    }

    #[test]
    fn prefixed_tokens_pass_through() {
        for prefix in ["Bearer tok", "Basic dXNlcjpwYXNz"] {
            let config = GatewayConfig {
                url: "http://gw:4444".to_string(),
                token: Some(prefix.to_string()),
                jwt_secret: None,
                admin_username: None,
                timeout_secs: 30,
            };
            let client = GatewayClient::new(config).unwrap();
            assert_eq!(client.authorization_value().unwrap(), prefix);
        }
    }
}
