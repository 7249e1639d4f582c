//! Install plan derivation.
//!
//! A plan is a pure function of the manifest and the target directory: the
//! same inputs always derive the same steps in the same order. The executor
//! (see `executor`) consumes the plan; the planner never touches the
//! filesystem or the network.
//!
//! Step order follows declaration order: artifacts first, then adapters, then
//! the gateway registration. Fatality defaults follow the artifact kind:
//! `pypi` and `docker` failures abort the remaining steps, `git` and `zip`
//! failures are recorded and skipped past, adapters and gateway registration
//! never abort.

use serde::Serialize;

use crate::error::{HubError, HubResult};
use crate::manifest::{Adapter, Artifact, Manifest, McpRegistration, PullPolicy};

/// One file an adapter step will write, relative to the target.
#[derive(Debug, Clone, Serialize)]
pub struct FileEmission {
    pub path: String,
    pub contents: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Pypi {
        package: String,
        version: String,
        /// Argument vector, never shell-interpolated.
        argv: Vec<String>,
    },
    Docker {
        image_ref: String,
        pull_policy: PullPolicy,
    },
    Git {
        repo: String,
        git_ref: String,
        dest: String,
    },
    Zip {
        url: String,
        sha256: Option<String>,
        dest: String,
    },
    Adapter {
        framework: String,
        template_key: String,
        files: Vec<FileEmission>,
    },
    Gateway {
        registration: McpRegistration,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    pub label: String,
    pub fatal: bool,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl PlanStep {
    /// Stable reference string recorded in the lockfile for artifact steps.
    pub fn artifact_ref(&self) -> Option<(&'static str, String)> {
        match &self.kind {
            StepKind::Pypi {
                package, version, ..
            } => Some(("pypi", format!("{}=={}", package, version))),
            StepKind::Docker { image_ref, .. } => Some(("docker", image_ref.clone())),
            StepKind::Git { repo, git_ref, .. } => {
                Some(("git", format!("{}#{}", repo, git_ref)))
            }
            StepKind::Zip { url, sha256, .. } => Some((
                "zip",
                match sha256 {
                    Some(h) => format!("{}#sha256={}", url, h),
                    None => url.clone(),
                },
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallPlan {
    pub uid: String,
    pub target: String,
    pub steps: Vec<PlanStep>,
}

/// Derive the install plan for a manifest against a target directory.
pub fn derive_plan(manifest: &Manifest, target: &str) -> HubResult<InstallPlan> {
    let mut steps: Vec<PlanStep> = Vec::new();

    for artifact in &manifest.artifacts {
        steps.push(artifact_step(artifact));
    }

    for adapter in &manifest.adapters {
        steps.push(adapter_step(manifest, adapter));
    }

    if let Some(reg) = &manifest.mcp_registration {
        if reg.tool.is_none() && reg.server.is_none() {
            return Err(HubError::InvalidRequest(
                "mcp_registration must declare at least one of tool, server".to_string(),
            ));
        }
        steps.push(PlanStep {
            label: format!("gateway:{}", manifest.id),
            fatal: false,
            kind: StepKind::Gateway {
                registration: reg.clone(),
            },
        });
    }

    Ok(InstallPlan {
        uid: manifest.uid().to_string(),
        target: target.to_string(),
        steps,
    })
}

fn artifact_step(artifact: &Artifact) -> PlanStep {
    match artifact {
        Artifact::Pypi { package, version } => PlanStep {
            label: format!("pypi:{}=={}", package, version),
            fatal: true,
            kind: StepKind::Pypi {
                package: package.clone(),
                version: version.clone(),
                argv: vec![
                    "pip".to_string(),
                    "install".to_string(),
                    "--disable-pip-version-check".to_string(),
                    "--no-input".to_string(),
                    format!("{}=={}", package, version),
                ],
            },
        },
        Artifact::Docker {
            image,
            tag,
            digest,
            pull_policy,
        } => {
            let image_ref = match (digest, tag) {
                (Some(d), _) => format!("{}@{}", image, d),
                (None, Some(t)) => format!("{}:{}", image, t),
                (None, None) => format!("{}:latest", image),
            };
            PlanStep {
                label: format!("docker:{}", image_ref),
                fatal: true,
                kind: StepKind::Docker {
                    image_ref,
                    pull_policy: pull_policy.unwrap_or(PullPolicy::Always),
                },
            }
        }
        Artifact::Git {
            repo,
            git_ref,
            dest,
        } => PlanStep {
            label: format!("git:{}#{}", repo, git_ref),
            fatal: false,
            kind: StepKind::Git {
                repo: repo.clone(),
                git_ref: git_ref.clone(),
                dest: dest.clone(),
            },
        },
        Artifact::Zip { url, sha256, dest } => PlanStep {
            label: format!("zip:{}", url),
            fatal: false,
            kind: StepKind::Zip {
                url: url.clone(),
                sha256: sha256.clone(),
                dest: dest.clone(),
            },
        },
    }
}

fn adapter_step(manifest: &Manifest, adapter: &Adapter) -> PlanStep {
    PlanStep {
        label: format!("adapter:{}/{}", adapter.framework, adapter.template_key),
        fatal: false,
        kind: StepKind::Adapter {
            framework: adapter.framework.clone(),
            template_key: adapter.template_key.clone(),
            files: render_adapter(manifest, adapter),
        },
    }
}

/// Expand an adapter request into file emissions. Unknown frameworks fall
/// back to a generic scaffold rather than failing the plan.
fn render_adapter(manifest: &Manifest, adapter: &Adapter) -> Vec<FileEmission> {
    let id = snake_case(&manifest.id);
    match adapter.framework.as_str() {
        "langgraph" => vec![FileEmission {
            path: format!("src/flows/{}_flow.py", id),
            contents: langgraph_flow(manifest),
        }],
        "crewai" => vec![FileEmission {
            path: format!("src/agents/{}_agent.py", id),
            contents: crewai_agent(manifest),
        }],
        _ => vec![FileEmission {
            path: format!("src/adapters/{}_{}.py", id, snake_case(&adapter.framework)),
            contents: generic_adapter(manifest, adapter),
        }],
    }
}

fn snake_case(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn langgraph_flow(manifest: &Manifest) -> String {
    format!(
        r#""""LangGraph flow wiring for {name}."""

from langgraph.graph import StateGraph


def build_graph(state_cls):
    """Return a StateGraph with {id} registered as a node."""
    graph = StateGraph(state_cls)
    graph.add_node("{id}", run_{snake})
    graph.set_entry_point("{id}")
    return graph


def run_{snake}(state):
    """Invoke {name} ({uid})."""
    raise NotImplementedError("wire {id} into your state here")
"#,
        name = manifest.name,
        id = manifest.id,
        snake = snake_case(&manifest.id),
        uid = manifest.uid(),
    )
}

fn crewai_agent(manifest: &Manifest) -> String {
    format!(
        r#""""CrewAI agent scaffold for {name}."""

from crewai import Agent


def make_agent() -> Agent:
    return Agent(
        role="{name}",
        goal="{summary}",
        backstory="Installed from {uid}",
    )
"#,
        name = manifest.name,
        summary = manifest.summary.as_deref().unwrap_or("Assist the crew"),
        uid = manifest.uid(),
    )
}

fn generic_adapter(manifest: &Manifest, adapter: &Adapter) -> String {
    format!(
        r#""""Adapter scaffold for {name} targeting {framework} ({template_key})."""


def register():
    """Hook {uid} into the host application."""
    raise NotImplementedError
"#,
        name = manifest.name,
        framework = adapter.framework,
        template_key = adapter.template_key,
        uid = manifest.uid(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::validate_manifest;
    use serde_json::json;

    fn manifest_with(extra: serde_json::Value) -> Manifest {
        let mut doc = json!({
            "schema_version": 1,
            "type": "agent",
            "id": "pdf-summarizer",
            "version": "1.4.2",
            "name": "PDF Summarizer",
            "summary": "Summarize PDFs"
        });
        if let (Some(base), Some(add)) = (doc.as_object_mut(), extra.as_object()) {
            for (k, v) in add {
                base.insert(k.clone(), v.clone());
            }
        }
        validate_manifest(&doc).unwrap()
    }

    #[test]
    fn plan_preserves_declared_order() {
        let manifest = manifest_with(json!({
            "artifacts": [
                { "kind": "zip", "url": "https://ex/a.zip", "dest": "vendor/a" },
                { "kind": "pypi", "package": "pdf-tools", "version": "1.4.2" },
                { "kind": "docker", "image": "ghcr.io/acme/pdf", "tag": "1.4" }
            ],
            "adapters": [ { "framework": "langgraph", "template_key": "flow" } ]
        }));
        let plan = derive_plan(&manifest, "./apps/x").unwrap();
        let labels: Vec<&str> = plan.steps.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "zip:https://ex/a.zip",
                "pypi:pdf-tools==1.4.2",
                "docker:ghcr.io/acme/pdf:1.4",
                "adapter:langgraph/flow",
            ]
        );
    }

    #[test]
    fn fatality_defaults_by_kind() {
        let manifest = manifest_with(json!({
            "artifacts": [
                { "kind": "pypi", "package": "a", "version": "1" },
                { "kind": "docker", "image": "img" },
                { "kind": "git", "repo": "https://ex/r.git", "ref": "main", "dest": "vendor/r" },
                { "kind": "zip", "url": "https://ex/a.zip", "dest": "vendor/a" }
            ],
            "adapters": [ { "framework": "crewai", "template_key": "agent" } ],
            "mcp_registration": { "tool": { "id": "pdf" } }
        }));
        let plan = derive_plan(&manifest, "t").unwrap();
        let fatal: Vec<bool> = plan.steps.iter().map(|s| s.fatal).collect();
        assert_eq!(fatal, vec![true, true, false, false, false, false]);
    }

    #[test]
    fn pypi_command_is_pinned_argv() {
        let manifest = manifest_with(json!({
            "artifacts": [ { "kind": "pypi", "package": "pdf-tools", "version": "1.4.2" } ]
        }));
        let plan = derive_plan(&manifest, "t").unwrap();
        match &plan.steps[0].kind {
            StepKind::Pypi { argv, .. } => {
                assert_eq!(argv.last().unwrap(), "pdf-tools==1.4.2");
                assert!(argv.iter().all(|a| !a.contains(' ')), "no shell strings");
            }
            other => panic!("expected pypi step, got {:?}", other),
        }
    }

    #[test]
    fn docker_ref_prefers_digest() {
        let manifest = manifest_with(json!({
            "artifacts": [
                { "kind": "docker", "image": "img", "tag": "1.0", "digest": "sha256:abc" }
            ]
        }));
        let plan = derive_plan(&manifest, "t").unwrap();
        match &plan.steps[0].kind {
            StepKind::Docker { image_ref, .. } => assert_eq!(image_ref, "img@sha256:abc"),
            other => panic!("expected docker step, got {:?}", other),
        }
    }

    #[test]
    fn adapter_files_land_under_src() {
        let manifest = manifest_with(json!({
            "adapters": [
                { "framework": "langgraph", "template_key": "flow" },
                { "framework": "haystack", "template_key": "pipeline" }
            ]
        }));
        let plan = derive_plan(&manifest, "t").unwrap();
        for step in &plan.steps {
            if let StepKind::Adapter { files, .. } = &step.kind {
                for file in files {
                    assert!(file.path.starts_with("src/"), "got {}", file.path);
                    assert!(file.contents.contains("PDF Summarizer"));
                }
            }
        }
    }

    #[test]
    fn empty_registration_is_rejected() {
        let manifest = manifest_with(json!({
            "mcp_registration": { "resources": [{ "id": "r" }] }
        }));
        assert!(derive_plan(&manifest, "t").is_err());
    }

    #[test]
    fn plan_is_deterministic() {
        let manifest = manifest_with(json!({
            "artifacts": [ { "kind": "pypi", "package": "a", "version": "1" } ],
            "adapters": [ { "framework": "langgraph", "template_key": "flow" } ]
        }));
        let a = serde_json::to_string(&derive_plan(&manifest, "t").unwrap()).unwrap();
        let b = serde_json::to_string(&derive_plan(&manifest, "t").unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn artifact_refs_are_stable() {
        let manifest = manifest_with(json!({
            "artifacts": [
                { "kind": "pypi", "package": "a", "version": "1" },
                { "kind": "zip", "url": "https://ex/a.zip", "sha256": "ff", "dest": "d" }
            ]
        }));
        let plan = derive_plan(&manifest, "t").unwrap();
        assert_eq!(
            plan.steps[0].artifact_ref(),
            Some(("pypi", "a==1".to_string()))
        );
        assert_eq!(
            plan.steps[1].artifact_ref(),
            Some(("zip", "https://ex/a.zip#sha256=ff".to_string()))
        );
    }
}
