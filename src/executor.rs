//! Install plan execution.
//!
//! Consumes the declarative [`InstallPlan`] the planner derived and runs its
//! steps in declared order against a target directory, producing one
//! [`StepResult`] per step and a `matrix.lock.json` lockfile capturing what
//! was applied.
//!
//! # Safety
//!
//! - Every created path is confined under the target; escapes are refused
//!   with `Forbidden` before anything touches the disk.
//! - External commands are spawned from argument vectors only; no manifest
//!   string ever reaches a shell.
//! - Archive entries with `..` or absolute components are rejected (the zip
//!   crate's `enclosed_name` check).
//! - Downloads are restricted to http(s) URLs and bounded by the configured
//!   step timeout.
//!
//! # Idempotency
//!
//! Re-running an identical install produces no filesystem mutations: file
//! emissions are content-hash compared before writing, and artifact steps
//! whose lock ref already matches the previous run are skipped with
//! `ok=true, extra.skipped=true`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use crate::error::{HubError, HubResult};
use crate::gateway::{GatewayClient, RegistrationRecord};
use crate::manifest::PullPolicy;
use crate::planner::{FileEmission, InstallPlan, PlanStep, StepKind};
use crate::store::CatalogStore;

pub const LOCKFILE_NAME: &str = "matrix.lock.json";

/// Decompressed-size ceiling per archive entry.
const MAX_ZIP_ENTRY_BYTES: u64 = 256 * 1024 * 1024;
const OUTPUT_EXCERPT_BYTES: usize = 2000;

// ============ Results & lockfile ============

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,
    pub elapsed_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_excerpt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_excerpt: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

impl StepResult {
    fn new(step: &PlanStep) -> Self {
        Self {
            step: step.label.clone(),
            ok: false,
            returncode: None,
            elapsed_secs: 0.0,
            stdout_excerpt: None,
            stderr_excerpt: None,
            extra: serde_json::Map::new(),
        }
    }

    fn skipped(mut self, reason: &str) -> Self {
        self.ok = true;
        self.extra.insert("skipped".to_string(), json!(true));
        self.extra.insert("reason".to_string(), json!(reason));
        self
    }

    fn failed(mut self, message: String) -> Self {
        self.ok = false;
        self.stderr_excerpt = Some(message);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockArtifact {
    pub kind: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRegistration {
    pub kind: String,
    pub name: String,
    pub id: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEntry {
    pub id: String,
    pub artifacts_applied: Vec<LockArtifact>,
    pub adapters_written: Vec<String>,
    pub gateway_registrations: Vec<LockRegistration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lockfile {
    pub version: u32,
    pub entities: Vec<LockEntry>,
}

impl Lockfile {
    fn empty() -> Self {
        Self {
            version: 1,
            entities: Vec::new(),
        }
    }

    fn entry(&self, uid: &str) -> Option<&LockEntry> {
        self.entities.iter().find(|e| e.id == uid)
    }

    fn upsert_entry(&mut self, entry: LockEntry) {
        match self.entities.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.entities.push(entry),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallResult {
    pub plan: InstallPlan,
    pub results: Vec<StepResult>,
    pub files_written: Vec<String>,
    pub lockfile: Lockfile,
}

// ============ Executor ============

#[derive(Clone)]
pub struct InstallExecutor {
    http: reqwest::Client,
    gateway: Option<Arc<GatewayClient>>,
    store: Option<CatalogStore>,
    step_timeout: Duration,
}

impl InstallExecutor {
    pub fn new(
        http: reqwest::Client,
        gateway: Option<Arc<GatewayClient>>,
        store: Option<CatalogStore>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            http,
            gateway,
            store,
            step_timeout,
        }
    }

    /// Run the plan's steps in order against the target directory.
    pub async fn execute(&self, plan: &InstallPlan) -> HubResult<InstallResult> {
        let target = prepare_target(&plan.target)?;
        let previous = read_lockfile(&target).unwrap_or_else(Lockfile::empty);
        let previous_entry = previous.entry(&plan.uid).cloned();

        let mut results: Vec<StepResult> = Vec::new();
        let mut files_written: Vec<String> = Vec::new();
        let mut entry = LockEntry {
            id: plan.uid.clone(),
            artifacts_applied: Vec::new(),
            adapters_written: Vec::new(),
            gateway_registrations: Vec::new(),
        };
        let mut fatal_failure = false;

        for step in &plan.steps {
            if fatal_failure {
                results.push(
                    StepResult::new(step).skipped("not run: an earlier fatal step failed"),
                );
                continue;
            }

            let started = Instant::now();
            let mut result = self
                .run_step(step, &target, previous_entry.as_ref(), &mut files_written, &mut entry)
                .await;
            result.elapsed_secs = started.elapsed().as_secs_f64();

            if !result.ok && step.fatal {
                fatal_failure = true;
            }
            results.push(result);
        }

        // The lockfile reflects partial progress too; it is rewritten only
        // when its content actually changed, so idempotent re-runs leave the
        // disk untouched.
        let mut lockfile = previous;
        lockfile.upsert_entry(entry);
        let lock_path = target.join(LOCKFILE_NAME);
        let rendered = serde_json::to_string_pretty(&lockfile)
            .map_err(|e| HubError::Integrity(format!("cannot serialize lockfile: {}", e)))?;
        if write_if_changed(&lock_path, rendered.as_bytes())? {
            files_written.push(lock_path.display().to_string());
        }

        Ok(InstallResult {
            plan: plan.clone(),
            results,
            files_written,
            lockfile,
        })
    }

    async fn run_step(
        &self,
        step: &PlanStep,
        target: &Path,
        previous: Option<&LockEntry>,
        files_written: &mut Vec<String>,
        entry: &mut LockEntry,
    ) -> StepResult {
        match &step.kind {
            StepKind::Pypi { argv, .. } => {
                let (kind, reference) = step.artifact_ref().expect("pypi is an artifact");
                if lock_has_artifact(previous, kind, &reference) {
                    entry.artifacts_applied.push(LockArtifact {
                        kind: kind.to_string(),
                        reference,
                    });
                    return StepResult::new(step).skipped("already satisfied by a previous run");
                }
                let result = self.run_command(step, argv, target).await;
                if result.ok {
                    entry.artifacts_applied.push(LockArtifact {
                        kind: kind.to_string(),
                        reference,
                    });
                }
                result
            }

            StepKind::Docker {
                image_ref,
                pull_policy,
            } => {
                let (kind, reference) = step.artifact_ref().expect("docker is an artifact");
                if lock_has_artifact(previous, kind, &reference) {
                    entry.artifacts_applied.push(LockArtifact {
                        kind: kind.to_string(),
                        reference,
                    });
                    return StepResult::new(step).skipped("already satisfied by a previous run");
                }
                if *pull_policy == PullPolicy::IfNotPresent {
                    let probe = vec![
                        "docker".to_string(),
                        "image".to_string(),
                        "inspect".to_string(),
                        image_ref.clone(),
                    ];
                    let probe_result = self.run_command(step, &probe, target).await;
                    if probe_result.ok {
                        entry.artifacts_applied.push(LockArtifact {
                            kind: kind.to_string(),
                            reference,
                        });
                        return StepResult::new(step).skipped("image already present");
                    }
                }
                let argv = vec![
                    "docker".to_string(),
                    "pull".to_string(),
                    image_ref.clone(),
                ];
                let result = self.run_command(step, &argv, target).await;
                if result.ok {
                    entry.artifacts_applied.push(LockArtifact {
                        kind: kind.to_string(),
                        reference,
                    });
                }
                result
            }

            StepKind::Git {
                repo,
                git_ref,
                dest,
            } => {
                let (kind, reference) = step.artifact_ref().expect("git is an artifact");
                let dest_path = match resolve_under(target, dest) {
                    Ok(p) => p,
                    Err(e) => return StepResult::new(step).failed(e.to_string()),
                };
                if dest_path.join(".git").exists() && lock_has_artifact(previous, kind, &reference)
                {
                    entry.artifacts_applied.push(LockArtifact {
                        kind: kind.to_string(),
                        reference,
                    });
                    return StepResult::new(step).skipped("checkout already present");
                }
                if let Some(parent) = dest_path.parent() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        return StepResult::new(step)
                            .failed(format!("cannot create {}: {}", parent.display(), e));
                    }
                }
                // --branch covers tags and branches; a raw SHA ref fails here
                // and surfaces as a recorded non-fatal step failure.
                let argv = vec![
                    "git".to_string(),
                    "clone".to_string(),
                    "--depth".to_string(),
                    "1".to_string(),
                    "--branch".to_string(),
                    git_ref.clone(),
                    repo.clone(),
                    dest_path.display().to_string(),
                ];
                let result = self.run_command(step, &argv, target).await;
                if result.ok {
                    files_written.push(dest_path.display().to_string());
                    entry.artifacts_applied.push(LockArtifact {
                        kind: kind.to_string(),
                        reference,
                    });
                }
                result
            }

            StepKind::Zip { url, sha256, dest } => {
                let (kind, reference) = step.artifact_ref().expect("zip is an artifact");
                let dest_path = match resolve_under(target, dest) {
                    Ok(p) => p,
                    Err(e) => return StepResult::new(step).failed(e.to_string()),
                };
                if dest_path.exists() && lock_has_artifact(previous, kind, &reference) {
                    entry.artifacts_applied.push(LockArtifact {
                        kind: kind.to_string(),
                        reference,
                    });
                    return StepResult::new(step).skipped("archive already extracted");
                }
                match self
                    .fetch_and_extract(url, sha256.as_deref(), &dest_path)
                    .await
                {
                    Ok(written) => {
                        let mut result = StepResult::new(step);
                        result.ok = true;
                        if written.is_empty() {
                            result = result.skipped("archive contents unchanged");
                        } else {
                            result
                                .extra
                                .insert("files".to_string(), json!(written.len()));
                            files_written.extend(written);
                        }
                        entry.artifacts_applied.push(LockArtifact {
                            kind: kind.to_string(),
                            reference,
                        });
                        result
                    }
                    Err(e) => StepResult::new(step).failed(e.to_string()),
                }
            }

            StepKind::Adapter { files, .. } => {
                let mut written = 0usize;
                for emission in files {
                    match self.write_emission(target, emission) {
                        Ok(Some(path)) => {
                            written += 1;
                            files_written.push(path.display().to_string());
                            entry.adapters_written.push(emission.path.clone());
                        }
                        Ok(None) => {
                            entry.adapters_written.push(emission.path.clone());
                        }
                        Err(e) => return StepResult::new(step).failed(e.to_string()),
                    }
                }
                let mut result = StepResult::new(step);
                result.ok = true;
                if written == 0 {
                    result = result.skipped("adapter files unchanged");
                }
                result
            }

            StepKind::Gateway { registration } => {
                let Some(gateway) = &self.gateway else {
                    return StepResult::new(step).skipped("gateway not configured");
                };
                let report = gateway.register(registration).await;
                for record in &report.records {
                    if record.ok {
                        if let Some(id) = &record.id {
                            entry.gateway_registrations.push(LockRegistration {
                                kind: record.kind.as_str().to_string(),
                                name: record.name.clone(),
                                id: serde_json::to_value(id).unwrap_or(Value::Null),
                            });
                        }
                    }
                }
                if let Some(store) = &self.store {
                    let err = report.error_summary();
                    if let Err(e) = store
                        .mark_gateway_registered(&entry.id, report.ok, err.as_deref())
                        .await
                    {
                        warn!(uid = %entry.id, error = %e, "failed to record gateway outcome");
                    }
                }
                let mut result = StepResult::new(step);
                result.ok = report.ok;
                result.extra.insert(
                    "registrations".to_string(),
                    registration_summary(&report.records),
                );
                if let Some(err) = report.error_summary() {
                    result.stderr_excerpt = Some(err);
                }
                result
            }
        }
    }

    async fn run_command(&self, step: &PlanStep, argv: &[String], cwd: &Path) -> StepResult {
        let mut result = StepResult::new(step);
        if argv.is_empty() {
            return result.failed("empty argument vector".to_string());
        }

        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(cwd)
            .stdin(std::process::Stdio::null());

        match tokio::time::timeout(self.step_timeout, command.output()).await {
            Ok(Ok(output)) => {
                result.ok = output.status.success();
                result.returncode = output.status.code();
                result.stdout_excerpt = excerpt_bytes(&output.stdout);
                result.stderr_excerpt = excerpt_bytes(&output.stderr);
                result
            }
            Ok(Err(e)) => result.failed(format!("cannot spawn {}: {}", argv[0], e)),
            Err(_) => result.failed(format!(
                "{} timed out after {}s",
                argv[0],
                self.step_timeout.as_secs()
            )),
        }
    }

    async fn fetch_and_extract(
        &self,
        url: &str,
        sha256: Option<&str>,
        dest: &Path,
    ) -> HubResult<Vec<String>> {
        match url::Url::parse(url) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
            _ => {
                return Err(HubError::Forbidden(format!(
                    "refusing to fetch non-http(s) URL '{}'",
                    url
                )))
            }
        }

        let response = self
            .http
            .get(url)
            .timeout(self.step_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(HubError::RemoteFailure(format!(
                "archive download returned HTTP {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await?.to_vec();

        if let Some(expected) = sha256 {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            let actual = format!("{:x}", hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(HubError::InvalidRequest(format!(
                    "archive checksum mismatch: expected {}, got {}",
                    expected, actual
                )));
            }
        }

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_zip_bytes(&bytes, &dest))
            .await
            .map_err(|e| HubError::Integrity(format!("extraction task failed: {}", e)))?
    }

    /// Write one adapter emission if its content differs. Returns the path
    /// when a write happened.
    fn write_emission(
        &self,
        target: &Path,
        emission: &FileEmission,
    ) -> HubResult<Option<PathBuf>> {
        let path = resolve_under(target, &emission.path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                HubError::Integrity(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        if write_if_changed(&path, emission.contents.as_bytes())? {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }
}

// ============ Filesystem helpers ============

fn prepare_target(target: &str) -> HubResult<PathBuf> {
    if target.trim().is_empty() {
        return Err(HubError::InvalidRequest("target must not be empty".to_string()));
    }
    let path = PathBuf::from(target);
    std::fs::create_dir_all(&path)
        .map_err(|e| HubError::Integrity(format!("cannot create target {}: {}", target, e)))?;
    path.canonicalize()
        .map_err(|e| HubError::Integrity(format!("cannot resolve target {}: {}", target, e)))
}

/// Join a manifest-supplied relative path onto the target, refusing absolute
/// paths and parent traversal.
pub fn resolve_under(target: &Path, relative: &str) -> HubResult<PathBuf> {
    let rel = Path::new(relative);
    if rel.as_os_str().is_empty() {
        return Err(HubError::Forbidden("empty destination path".to_string()));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(HubError::Forbidden(format!(
                    "path '{}' escapes the install target",
                    relative
                )))
            }
        }
    }
    Ok(target.join(rel))
}

fn write_if_changed(path: &Path, contents: &[u8]) -> HubResult<bool> {
    if let Ok(existing) = std::fs::read(path) {
        if file_digest(&existing) == file_digest(contents) {
            return Ok(false);
        }
    }
    std::fs::write(path, contents)
        .map_err(|e| HubError::Integrity(format!("cannot write {}: {}", path.display(), e)))?;
    Ok(true)
}

fn file_digest(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Extract an in-memory zip under `dest`, returning the paths actually
/// written. Entries escaping the destination are refused.
fn extract_zip_bytes(bytes: &[u8], dest: &Path) -> HubResult<Vec<String>> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| HubError::InvalidRequest(format!("not a zip archive: {}", e)))?;

    let mut written: Vec<String> = Vec::new();

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| HubError::InvalidRequest(format!("corrupt zip entry {}: {}", i, e)))?;

        let Some(enclosed) = file.enclosed_name() else {
            return Err(HubError::Forbidden(format!(
                "archive entry '{}' escapes the destination",
                file.name()
            )));
        };
        let out_path = dest.join(enclosed);

        if file.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|e| {
                HubError::Integrity(format!("cannot create {}: {}", out_path.display(), e))
            })?;
            continue;
        }

        if file.size() > MAX_ZIP_ENTRY_BYTES {
            return Err(HubError::InvalidRequest(format!(
                "archive entry '{}' exceeds the {} byte limit",
                file.name(),
                MAX_ZIP_ENTRY_BYTES
            )));
        }

        let mut contents = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut contents)
            .map_err(|e| HubError::InvalidRequest(format!("cannot read zip entry: {}", e)))?;

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                HubError::Integrity(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        if write_if_changed(&out_path, &contents)? {
            written.push(out_path.display().to_string());
        }
    }

    Ok(written)
}

fn lock_has_artifact(previous: Option<&LockEntry>, kind: &str, reference: &str) -> bool {
    previous.is_some_and(|entry| {
        entry
            .artifacts_applied
            .iter()
            .any(|a| a.kind == kind && a.reference == reference)
    })
}

fn read_lockfile(target: &Path) -> Option<Lockfile> {
    let raw = std::fs::read_to_string(target.join(LOCKFILE_NAME)).ok()?;
    serde_json::from_str(&raw).ok()
}

fn registration_summary(records: &[RegistrationRecord]) -> Value {
    json!(records
        .iter()
        .map(|r| json!({
            "kind": r.kind.as_str(),
            "name": r.name,
            "ok": r.ok,
        }))
        .collect::<Vec<_>>())
}

fn excerpt_bytes(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut end = trimmed.len().min(OUTPUT_EXCERPT_BYTES);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    Some(trimmed[..end].to_string())
}

// ============ Coalescing ============

/// Guarantees at-most-one in-flight execution per `(uid, target)` pair.
/// Concurrent callers for the same pair await the winner's outcome and
/// receive the same [`InstallResult`].
#[derive(Default)]
pub struct InstallCoordinator {
    inflight: Mutex<HashMap<String, broadcast::Sender<Result<Arc<InstallResult>, HubError>>>>,
}

impl InstallCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(uid: &str, target: &str) -> String {
        format!("{}\u{0}{}", uid, target)
    }

    pub async fn run<F>(&self, key: String, work: F) -> HubResult<Arc<InstallResult>>
    where
        F: std::future::Future<Output = HubResult<InstallResult>>,
    {
        let mut inflight = self.inflight.lock().await;
        if let Some(tx) = inflight.get(&key) {
            let mut rx = tx.subscribe();
            drop(inflight);
            return match rx.recv().await {
                Ok(outcome) => outcome,
                Err(_) => Err(HubError::Transient(
                    "coalesced install was dropped before completing".to_string(),
                )),
            };
        }

        let (tx, _keepalive) = broadcast::channel(1);
        inflight.insert(key.clone(), tx.clone());
        drop(inflight);

        let outcome = work.await.map(Arc::new);

        self.inflight.lock().await.remove(&key);
        let _ = tx.send(outcome.clone());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::McpRegistration;
    use std::io::Write;
    use tempfile::TempDir;

    fn executor() -> InstallExecutor {
        InstallExecutor::new(
            reqwest::Client::new(),
            None,
            None,
            Duration::from_secs(5),
        )
    }

    fn adapter_step(path: &str, contents: &str) -> PlanStep {
        PlanStep {
            label: format!("adapter:test/{}", path),
            fatal: false,
            kind: StepKind::Adapter {
                framework: "test".to_string(),
                template_key: "t".to_string(),
                files: vec![FileEmission {
                    path: path.to_string(),
                    contents: contents.to_string(),
                }],
            },
        }
    }

    fn plan_with(target: &Path, steps: Vec<PlanStep>) -> InstallPlan {
        InstallPlan {
            uid: "tool:hello@0.1.0".to_string(),
            target: target.display().to_string(),
            steps,
        }
    }

    #[test]
    fn resolve_under_refuses_escapes() {
        let target = Path::new("/srv/app");
        assert!(resolve_under(target, "src/ok.py").is_ok());
        assert!(resolve_under(target, "./src/ok.py").is_ok());
        assert!(matches!(
            resolve_under(target, "../evil.py"),
            Err(HubError::Forbidden(_))
        ));
        assert!(matches!(
            resolve_under(target, "/etc/passwd"),
            Err(HubError::Forbidden(_))
        ));
        assert!(matches!(
            resolve_under(target, "a/../../b"),
            Err(HubError::Forbidden(_))
        ));
        assert!(resolve_under(target, "").is_err());
    }

    #[tokio::test]
    async fn adapter_install_writes_then_skips() {
        let tmp = TempDir::new().unwrap();
        let plan = plan_with(tmp.path(), vec![adapter_step("src/flows/x.py", "print(1)\n")]);

        let first = executor().execute(&plan).await.unwrap();
        assert!(first.results[0].ok);
        assert!(first.results[0].extra.get("skipped").is_none());
        // Adapter file + lockfile.
        assert_eq!(first.files_written.len(), 2);
        assert!(tmp.path().join("src/flows/x.py").exists());
        assert!(tmp.path().join(LOCKFILE_NAME).exists());

        let second = executor().execute(&plan).await.unwrap();
        assert!(second.results[0].ok);
        assert_eq!(second.results[0].extra.get("skipped"), Some(&json!(true)));
        assert!(
            second.files_written.is_empty(),
            "identical re-run must not touch the disk: {:?}",
            second.files_written
        );
    }

    #[tokio::test]
    async fn files_written_stay_under_target() {
        let tmp = TempDir::new().unwrap();
        let plan = plan_with(
            tmp.path(),
            vec![
                adapter_step("src/a.py", "a"),
                adapter_step("src/deep/b.py", "b"),
            ],
        );
        let result = executor().execute(&plan).await.unwrap();
        let base = tmp.path().canonicalize().unwrap();
        for path in &result.files_written {
            assert!(
                Path::new(path).starts_with(&base),
                "{} is outside {}",
                path,
                base.display()
            );
        }
    }

    #[tokio::test]
    async fn escaping_adapter_path_is_refused() {
        let tmp = TempDir::new().unwrap();
        let plan = plan_with(tmp.path(), vec![adapter_step("../outside.py", "nope")]);
        let result = executor().execute(&plan).await.unwrap();
        assert!(!result.results[0].ok);
        assert!(result.results[0]
            .stderr_excerpt
            .as_deref()
            .unwrap()
            .contains("escapes"));
        assert!(!tmp.path().parent().unwrap().join("outside.py").exists());
    }

    #[tokio::test]
    async fn fatal_failure_aborts_later_steps() {
        let tmp = TempDir::new().unwrap();
        let broken = PlanStep {
            label: "pypi:ghost==1".to_string(),
            fatal: true,
            kind: StepKind::Pypi {
                package: "ghost".to_string(),
                version: "1".to_string(),
                argv: vec!["mhub-no-such-binary-7f3a".to_string()],
            },
        };
        let plan = plan_with(tmp.path(), vec![broken, adapter_step("src/late.py", "x")]);

        let result = executor().execute(&plan).await.unwrap();
        assert!(!result.results[0].ok);
        assert_eq!(result.results[1].extra.get("skipped"), Some(&json!(true)));
        assert!(!tmp.path().join("src/late.py").exists());
        // The lockfile still lands, reflecting partial progress.
        assert!(tmp.path().join(LOCKFILE_NAME).exists());
    }

    #[tokio::test]
    async fn nonfatal_failure_continues() {
        let tmp = TempDir::new().unwrap();
        let broken = PlanStep {
            label: "git:ghost".to_string(),
            fatal: false,
            kind: StepKind::Git {
                repo: "https://0.0.0.0/none.git".to_string(),
                git_ref: "main".to_string(),
                dest: "vendor/none".to_string(),
            },
        };
        let plan = plan_with(tmp.path(), vec![broken, adapter_step("src/late.py", "x")]);

        let result = executor().execute(&plan).await.unwrap();
        assert!(!result.results[0].ok);
        assert!(result.results[1].ok);
        assert!(tmp.path().join("src/late.py").exists());
    }

    #[tokio::test]
    async fn gateway_step_skips_without_client() {
        let tmp = TempDir::new().unwrap();
        let step = PlanStep {
            label: "gateway:hello".to_string(),
            fatal: false,
            kind: StepKind::Gateway {
                registration: serde_json::from_value::<McpRegistration>(json!({
                    "tool": { "id": "hello" }
                }))
                .unwrap(),
            },
        };
        let plan = plan_with(tmp.path(), vec![step]);
        let result = executor().execute(&plan).await.unwrap();
        assert!(result.results[0].ok);
        assert_eq!(result.results[0].extra.get("skipped"), Some(&json!(true)));
    }

    #[test]
    fn zip_extraction_confines_and_dedups() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("vendor");

        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("inner/a.txt", options).unwrap();
            writer.write_all(b"alpha").unwrap();
            writer.start_file("b.txt", options).unwrap();
            writer.write_all(b"beta").unwrap();
            writer.finish().unwrap();
        }

        let written = extract_zip_bytes(&buf, &dest).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(
            std::fs::read_to_string(dest.join("inner/a.txt")).unwrap(),
            "alpha"
        );

        // Second extraction of identical bytes writes nothing.
        let again = extract_zip_bytes(&buf, &dest).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn zip_traversal_entry_is_refused() {
        let tmp = TempDir::new().unwrap();
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("../evil.txt", options).unwrap();
            writer.write_all(b"boom").unwrap();
            writer.finish().unwrap();
        }
        let err = extract_zip_bytes(&buf, &tmp.path().join("vendor")).unwrap_err();
        assert!(matches!(err, HubError::Forbidden(_)));
    }

    #[tokio::test]
    async fn lockfile_merges_entries_across_uids() {
        let tmp = TempDir::new().unwrap();
        let plan_a = plan_with(tmp.path(), vec![adapter_step("src/a.py", "a")]);
        let mut plan_b = plan_with(tmp.path(), vec![adapter_step("src/b.py", "b")]);
        plan_b.uid = "tool:other@2.0.0".to_string();

        executor().execute(&plan_a).await.unwrap();
        let result = executor().execute(&plan_b).await.unwrap();

        assert_eq!(result.lockfile.entities.len(), 2);
        let ids: Vec<&str> = result
            .lockfile
            .entities
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        assert!(ids.contains(&"tool:hello@0.1.0"));
        assert!(ids.contains(&"tool:other@2.0.0"));
    }

    #[tokio::test]
    async fn coordinator_coalesces_identical_pairs() {
        let coordinator = Arc::new(InstallCoordinator::new());
        let tmp = TempDir::new().unwrap();
        let plan = Arc::new(plan_with(tmp.path(), vec![adapter_step("src/x.py", "x")]));

        let key = InstallCoordinator::key(&plan.uid, &plan.target);
        let first = {
            let coordinator = Arc::clone(&coordinator);
            let plan = Arc::clone(&plan);
            let key = key.clone();
            tokio::spawn(async move {
                coordinator
                    .run(key, async move { executor().execute(&plan).await })
                    .await
            })
        };
        let second = {
            let coordinator = Arc::clone(&coordinator);
            let plan = Arc::clone(&plan);
            tokio::spawn(async move {
                coordinator
                    .run(key, async move { executor().execute(&plan).await })
                    .await
            })
        };

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        // Either both saw the same execution, or the second ran after the
        // first finished and was a clean skip; in both cases the file exists
        // exactly once.
        assert!(tmp.path().join("src/x.py").exists());
        assert!(a.results[0].ok && b.results[0].ok);
    }

    #[test]
    fn lockfile_shape_roundtrips() {
        let lockfile = Lockfile {
            version: 1,
            entities: vec![LockEntry {
                id: "tool:hello@0.1.0".to_string(),
                artifacts_applied: vec![LockArtifact {
                    kind: "pypi".to_string(),
                    reference: "a==1".to_string(),
                }],
                adapters_written: vec!["src/flows/x.py".to_string()],
                gateway_registrations: vec![LockRegistration {
                    kind: "resource".to_string(),
                    name: "watsonx-agent-code".to_string(),
                    id: json!(7),
                }],
            }],
        };
        let rendered = serde_json::to_value(&lockfile).unwrap();
        assert_eq!(rendered["version"], json!(1));
        assert_eq!(rendered["entities"][0]["artifacts_applied"][0]["ref"], json!("a==1"));
        let parsed: Lockfile = serde_json::from_value(rendered).unwrap();
        assert_eq!(parsed.entities[0].gateway_registrations[0].id, json!(7));
    }
}
