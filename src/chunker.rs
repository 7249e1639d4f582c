//! Entity text chunker for the semantic backend.
//!
//! Splits an entity's descriptive fields into [`EmbeddingChunk`]s. Short
//! fields (`name`, `summary`) become single chunks; long fields
//! (`description`, and `readme` / `examples` keys carried in the manifest)
//! are split on paragraph boundaries (`\n\n`) so each chunk stays under a
//! character budget while keeping semantic coherence.
//!
//! Ordinals are contiguous starting at 0 across all sources, which is the
//! chunk table's primary-key requirement.

use serde_json::Value;

use crate::manifest::Manifest;
use crate::models::{ChunkSource, EmbeddingChunk};

const MAX_CHUNK_CHARS: usize = 1200;

/// Produce the chunk set for an entity. Vectors are filled in by the caller
/// after embedding.
pub fn chunk_entity(uid: &str, manifest: &Manifest) -> Vec<EmbeddingChunk> {
    let mut chunks: Vec<EmbeddingChunk> = Vec::new();
    let mut ordinal: i32 = 0;

    let mut push = |source: ChunkSource, text: &str, chunks: &mut Vec<EmbeddingChunk>| {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        for piece in split_paragraphs(trimmed, MAX_CHUNK_CHARS) {
            chunks.push(EmbeddingChunk {
                entity_uid: uid.to_string(),
                chunk_ordinal: ordinal,
                source,
                text: piece,
                vector: None,
            });
            ordinal += 1;
        }
    };

    push(ChunkSource::Name, &manifest.name, &mut chunks);
    if let Some(summary) = &manifest.summary {
        push(ChunkSource::Summary, summary, &mut chunks);
    }
    if let Some(description) = &manifest.description {
        push(ChunkSource::Description, description, &mut chunks);
    }
    if let Some(readme) = manifest.raw.get("readme").and_then(Value::as_str) {
        push(ChunkSource::Readme, readme, &mut chunks);
    }
    if let Some(examples) = manifest.raw.get("examples").and_then(Value::as_array) {
        for example in examples {
            if let Some(text) = example.as_str() {
                push(ChunkSource::Example, text, &mut chunks);
            }
        }
    }

    chunks
}

/// Split text on paragraph boundaries, packing paragraphs greedily up to
/// `max_chars`. A single oversized paragraph is hard-split at the nearest
/// space or newline before the limit.
fn split_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current.is_empty() {
            trimmed.len()
        } else {
            current.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }

        if trimmed.len() > max_chars {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let limit = floor_char_boundary(remaining, max_chars.min(remaining.len()));
                let split_at = if limit < remaining.len() {
                    remaining[..limit]
                        .rfind('\n')
                        .or_else(|| remaining[..limit].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(limit)
                } else {
                    limit
                };
                pieces.push(remaining[..split_at].trim().to_string());
                remaining = &remaining[split_at..];
            }
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }

    pieces.retain(|p| !p.is_empty());
    pieces
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::validate_manifest;
    use serde_json::json;

    fn sample_manifest(description: &str) -> Manifest {
        validate_manifest(&json!({
            "schema_version": 1,
            "type": "tool",
            "id": "pdf",
            "version": "1.4.2",
            "name": "PDF Summarizer",
            "summary": "Summarize PDF files",
            "description": description,
            "implementation": {"runtime": "python3.11", "entrypoint": "x:y"}
        }))
        .unwrap()
    }

    #[test]
    fn ordinals_are_contiguous() {
        let long = (0..40)
            .map(|i| format!("Paragraph number {} with some extra words in it.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let manifest = sample_manifest(&long);
        let chunks = chunk_entity("tool:pdf@1.4.2", &manifest);
        assert!(chunks.len() > 2);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_ordinal, i as i32);
        }
    }

    #[test]
    fn name_and_summary_become_chunks() {
        let manifest = sample_manifest("Short description.");
        let chunks = chunk_entity("tool:pdf@1.4.2", &manifest);
        assert_eq!(chunks[0].source, ChunkSource::Name);
        assert_eq!(chunks[0].text, "PDF Summarizer");
        assert_eq!(chunks[1].source, ChunkSource::Summary);
        assert_eq!(chunks[2].source, ChunkSource::Description);
    }

    #[test]
    fn readme_key_is_picked_up() {
        let mut doc = json!({
            "schema_version": 1,
            "type": "tool",
            "id": "pdf",
            "version": "1.4.2",
            "name": "PDF",
            "implementation": {"runtime": "python3.11", "entrypoint": "x:y"}
        });
        doc["readme"] = json!("# Usage\n\nRun the thing.");
        let manifest = validate_manifest(&doc).unwrap();
        let chunks = chunk_entity("tool:pdf@1.4.2", &manifest);
        assert!(chunks.iter().any(|c| c.source == ChunkSource::Readme));
    }

    #[test]
    fn oversized_paragraph_is_hard_split() {
        let big = "word ".repeat(600);
        let pieces = split_paragraphs(&big, 1200);
        assert!(pieces.len() > 1);
        for p in &pieces {
            assert!(p.len() <= 1200);
        }
    }

    #[test]
    fn deterministic() {
        let manifest = sample_manifest("Alpha\n\nBeta\n\nGamma");
        let a = chunk_entity("tool:pdf@1.4.2", &manifest);
        let b = chunk_entity("tool:pdf@1.4.2", &manifest);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.chunk_ordinal, y.chunk_ordinal);
        }
    }
}
