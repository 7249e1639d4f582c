//! End-to-end install flow: manifest → plan → execution → lockfile, driven
//! against temporary target directories. No network or database required.

use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

use matrix_hub::executor::{InstallExecutor, LOCKFILE_NAME};
use matrix_hub::manifest::validate_manifest;
use matrix_hub::planner::derive_plan;

fn executor() -> InstallExecutor {
    InstallExecutor::new(reqwest::Client::new(), None, None, Duration::from_secs(5))
}

fn agent_manifest() -> matrix_hub::manifest::Manifest {
    validate_manifest(&json!({
        "schema_version": 1,
        "type": "agent",
        "id": "hello",
        "version": "0.1.0",
        "name": "Hello Agent",
        "summary": "Says hello",
        "adapters": [
            { "framework": "langgraph", "template_key": "flow" },
            { "framework": "crewai", "template_key": "agent" }
        ],
        "mcp_registration": {
            "tool": { "id": "hello" }
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn install_then_reinstall_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let target = tmp.path().join("apps/x");
    let manifest = agent_manifest();
    let plan = derive_plan(&manifest, target.to_str().unwrap()).unwrap();

    let first = executor().execute(&plan).await.unwrap();

    // Two adapter files plus the lockfile.
    assert_eq!(first.files_written.len(), 3);
    assert!(target.join("src/flows/hello_flow.py").exists());
    assert!(target.join("src/agents/hello_agent.py").exists());
    assert!(target.join(LOCKFILE_NAME).exists());
    assert!(first.results.iter().all(|r| r.ok));

    let second = executor().execute(&plan).await.unwrap();
    assert!(
        second.files_written.is_empty(),
        "re-running an unchanged install must not write: {:?}",
        second.files_written
    );
    assert!(second.results.iter().all(|r| r.ok));
    for result in &second.results {
        if result.step.starts_with("adapter:") {
            assert_eq!(result.extra.get("skipped"), Some(&json!(true)));
        }
    }
}

#[tokio::test]
async fn lockfile_matches_declared_shape() {
    let tmp = TempDir::new().unwrap();
    let manifest = agent_manifest();
    let plan = derive_plan(&manifest, tmp.path().to_str().unwrap()).unwrap();

    executor().execute(&plan).await.unwrap();

    let raw = std::fs::read_to_string(tmp.path().join(LOCKFILE_NAME)).unwrap();
    let lock: serde_json::Value = serde_json::from_str(&raw).unwrap();

    assert_eq!(lock["version"], json!(1));
    let entities = lock["entities"].as_array().unwrap();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0]["id"], json!("agent:hello@0.1.0"));

    let adapters = entities[0]["adapters_written"].as_array().unwrap();
    assert_eq!(adapters.len(), 2);
    assert!(adapters
        .iter()
        .all(|p| p.as_str().unwrap().starts_with("src/")));

    // No gateway configured: nothing registered, but the key is present.
    assert!(entities[0]["gateway_registrations"].as_array().unwrap().is_empty());
    assert!(entities[0]["artifacts_applied"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn all_written_paths_stay_confined() {
    let tmp = TempDir::new().unwrap();
    let manifest = agent_manifest();
    let plan = derive_plan(&manifest, tmp.path().to_str().unwrap()).unwrap();

    let result = executor().execute(&plan).await.unwrap();
    let base = tmp.path().canonicalize().unwrap();
    for written in &result.files_written {
        assert!(
            Path::new(written).starts_with(&base),
            "{} escapes {}",
            written,
            base.display()
        );
    }
}

#[tokio::test]
async fn escaping_artifact_dest_is_refused_without_aborting() {
    let tmp = TempDir::new().unwrap();
    let manifest = validate_manifest(&json!({
        "schema_version": 1,
        "type": "agent",
        "id": "sneaky",
        "version": "1.0.0",
        "name": "Sneaky",
        "artifacts": [
            { "kind": "git", "repo": "https://ex/r.git", "ref": "main", "dest": "../outside" }
        ],
        "adapters": [ { "framework": "langgraph", "template_key": "flow" } ]
    }))
    .unwrap();
    let plan = derive_plan(&manifest, tmp.path().to_str().unwrap()).unwrap();

    let result = executor().execute(&plan).await.unwrap();

    assert!(!result.results[0].ok);
    assert!(result.results[0]
        .stderr_excerpt
        .as_deref()
        .unwrap()
        .contains("escapes"));
    assert!(!tmp.path().parent().unwrap().join("outside").exists());

    // The git step is non-fatal; the adapter still lands.
    assert!(result.results[1].ok);
    assert!(tmp.path().join("src/flows/sneaky_flow.py").exists());
}

#[tokio::test]
async fn modified_manifest_rewrites_adapters() {
    let tmp = TempDir::new().unwrap();
    let manifest = agent_manifest();
    let plan = derive_plan(&manifest, tmp.path().to_str().unwrap()).unwrap();
    executor().execute(&plan).await.unwrap();

    // A renamed entity changes the rendered adapter content.
    let renamed = validate_manifest(&json!({
        "schema_version": 1,
        "type": "agent",
        "id": "hello",
        "version": "0.1.0",
        "name": "Hello Agent v2",
        "adapters": [ { "framework": "langgraph", "template_key": "flow" } ]
    }))
    .unwrap();
    let plan2 = derive_plan(&renamed, tmp.path().to_str().unwrap()).unwrap();
    let result = executor().execute(&plan2).await.unwrap();

    assert!(result
        .files_written
        .iter()
        .any(|p| p.ends_with("hello_flow.py")));
    let contents = std::fs::read_to_string(tmp.path().join("src/flows/hello_flow.py")).unwrap();
    assert!(contents.contains("Hello Agent v2"));
}
