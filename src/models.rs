//! Core data models for the catalog.
//!
//! These types represent the entities, remotes, and embedding chunks that flow
//! through the ingestion, search, and install pipelines. The [`Uid`] is the
//! canonical identifier everywhere: `"{type}:{id}@{version}"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::HubError;

/// The three entity kinds the catalog understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Agent,
    Tool,
    McpServer,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Agent => "agent",
            EntityType::Tool => "tool",
            EntityType::McpServer => "mcp_server",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(EntityType::Agent),
            "tool" => Ok(EntityType::Tool),
            "mcp_server" => Ok(EntityType::McpServer),
            other => Err(HubError::InvalidRequest(format!(
                "unknown entity type '{}': expected agent, tool, or mcp_server",
                other
            ))),
        }
    }
}

/// Canonical entity identifier: `"{type}:{id}@{version}"`.
///
/// `(type, id, version)` is the unique key of the catalog; the rendered UID is
/// unique as well. Parsing splits on the first `:` and the last `@`, so slugs
/// containing dots or dashes round-trip cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uid {
    pub entity_type: EntityType,
    pub id: String,
    pub version: String,
}

impl Uid {
    pub fn new(entity_type: EntityType, id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.entity_type, self.id, self.version)
    }
}

impl FromStr for Uid {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || {
            HubError::InvalidRequest(format!(
                "malformed uid '{}': expected \"type:id@version\"",
                s
            ))
        };
        let (type_part, rest) = s.split_once(':').ok_or_else(bad)?;
        let (id, version) = rest.rsplit_once('@').ok_or_else(bad)?;
        if id.is_empty() || version.is_empty() {
            return Err(bad());
        }
        Ok(Uid {
            entity_type: type_part.parse()?,
            id: id.to_string(),
            version: version.to_string(),
        })
    }
}

/// A catalog entity: one agent, tool, or MCP server at a specific version.
///
/// The original manifest is kept verbatim in `manifest` so installs can be
/// re-planned later without refetching. `pending` entities are hidden from
/// search unless the caller opts in.
#[derive(Debug, Clone, Serialize)]
pub struct Entity {
    pub uid: String,
    #[serde(rename = "type")]
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
    pub manifest: serde_json::Value,
    pub quality_score: f64,
    pub pending: bool,
    pub source_url: String,
    pub source_commit: Option<String>,
    pub gateway_registered_at: Option<DateTime<Utc>>,
    pub gateway_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of an entity upsert.
///
/// `Unchanged` means the stored content hash matched the incoming manifest and
/// no row was touched, which keeps `updated_at` (and the store watermark)
/// stable across idempotent re-ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// A registered index URL polled by the ingestion scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct Remote {
    pub url: String,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_etag: Option<String>,
    pub last_status: Option<String>,
    pub last_error: Option<String>,
}

/// Where a chunk's text came from within the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSource {
    Name,
    Summary,
    Description,
    Readme,
    Example,
}

impl ChunkSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkSource::Name => "name",
            ChunkSource::Summary => "summary",
            ChunkSource::Description => "description",
            ChunkSource::Readme => "readme",
            ChunkSource::Example => "example",
        }
    }
}

impl FromStr for ChunkSource {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" => Ok(ChunkSource::Name),
            "summary" => Ok(ChunkSource::Summary),
            "description" => Ok(ChunkSource::Description),
            "readme" => Ok(ChunkSource::Readme),
            "example" => Ok(ChunkSource::Example),
            other => Err(HubError::Integrity(format!(
                "unknown chunk source '{}' in store",
                other
            ))),
        }
    }
}

/// One embedding chunk owned by an entity. Deleted and regenerated whenever
/// the owning manifest changes materially.
#[derive(Debug, Clone)]
pub struct EmbeddingChunk {
    pub entity_uid: String,
    pub chunk_ordinal: i32,
    pub source: ChunkSource,
    pub text: String,
    pub vector: Option<Vec<f32>>,
}

/// Filter predicates accepted by both search backends.
///
/// Set filters are superset matches: an entity qualifies when its stored set
/// contains every requested value. `include_pending` defaults to `false`.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub entity_type: Option<EntityType>,
    pub capabilities: Vec<String>,
    pub frameworks: Vec<String>,
    pub providers: Vec<String>,
    pub include_pending: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_roundtrip() {
        let uid: Uid = "mcp_server:hello@0.1.0".parse().unwrap();
        assert_eq!(uid.entity_type, EntityType::McpServer);
        assert_eq!(uid.id, "hello");
        assert_eq!(uid.version, "0.1.0");
        assert_eq!(uid.to_string(), "mcp_server:hello@0.1.0");
    }

    #[test]
    fn uid_with_build_metadata_version() {
        let uid: Uid = "tool:pdf@1.4.2+build.7".parse().unwrap();
        assert_eq!(uid.id, "pdf");
        assert_eq!(uid.version, "1.4.2+build.7");
    }

    #[test]
    fn uid_rejects_malformed() {
        assert!("tool:pdf".parse::<Uid>().is_err());
        assert!("pdf@1.0".parse::<Uid>().is_err());
        assert!("widget:pdf@1.0".parse::<Uid>().is_err());
        assert!("tool:@1.0".parse::<Uid>().is_err());
        assert!("tool:pdf@".parse::<Uid>().is_err());
    }

    #[test]
    fn entity_type_parse() {
        assert_eq!("agent".parse::<EntityType>().unwrap(), EntityType::Agent);
        assert_eq!(
            "mcp_server".parse::<EntityType>().unwrap(),
            EntityType::McpServer
        );
        assert!("server".parse::<EntityType>().is_err());
    }
}
