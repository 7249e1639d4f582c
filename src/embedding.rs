//! Embedding provider abstraction.
//!
//! The semantic backend needs query and chunk embeddings; this module hides
//! where they come from. Two remote providers are supported plus an explicit
//! off switch:
//!
//! | Provider | Endpoint |
//! |----------|----------|
//! | `openai` | `POST https://api.openai.com/v1/embeddings` (needs `OPENAI_API_KEY`) |
//! | `ollama` | `POST {url}/api/embed` (default `http://localhost:11434`) |
//! | `disabled` | always errors |
//!
//! # Retry Strategy
//!
//! Both remote providers retry transient failures with exponential backoff
//! (1s, 2s, 4s, ... capped at 32s): HTTP 429 and 5xx retry, other 4xx fail
//! immediately, network errors retry, up to `embedding.max_retries` attempts.

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use std::time::Duration;

use crate::config::EmbeddingConfig;

#[derive(Debug, Clone)]
pub enum EmbeddingProvider {
    Disabled,
    OpenAi { model: String },
    Ollama { model: String, url: String },
}

impl EmbeddingProvider {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        match config.provider.as_str() {
            "disabled" => Ok(EmbeddingProvider::Disabled),
            "openai" => {
                let model = config
                    .model
                    .clone()
                    .ok_or_else(|| anyhow!("embedding.model required for openai provider"))?;
                if std::env::var("OPENAI_API_KEY").is_err() {
                    bail!("OPENAI_API_KEY environment variable not set");
                }
                Ok(EmbeddingProvider::OpenAi { model })
            }
            "ollama" => {
                let model = config
                    .model
                    .clone()
                    .ok_or_else(|| anyhow!("embedding.model required for ollama provider"))?;
                let url = config
                    .url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string());
                Ok(EmbeddingProvider::Ollama { model, url })
            }
            other => bail!("Unknown embedding provider: {}", other),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, EmbeddingProvider::Disabled)
    }

    /// Embed a batch of texts, returning one vector per input in order.
    pub async fn embed_texts(
        &self,
        config: &EmbeddingConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            EmbeddingProvider::Disabled => bail!("Embedding provider is disabled"),
            EmbeddingProvider::OpenAi { model } => {
                let api_key = std::env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow!("OPENAI_API_KEY not set"))?;
                let body = serde_json::json!({ "model": model, "input": texts });
                let json = post_with_backoff(
                    config,
                    "https://api.openai.com/v1/embeddings",
                    Some(&api_key),
                    &body,
                )
                .await?;
                parse_openai_embeddings(&json)
            }
            EmbeddingProvider::Ollama { model, url } => {
                let body = serde_json::json!({ "model": model, "input": texts });
                let endpoint = format!("{}/api/embed", url.trim_end_matches('/'));
                let json = post_with_backoff(config, &endpoint, None, &body).await?;
                parse_ollama_embeddings(&json)
            }
        }
    }

    /// Embed a single query string.
    pub async fn embed_query(&self, config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_texts(config, &[text.to_string()]).await?;
        if vectors.is_empty() {
            bail!("Empty embedding response");
        }
        Ok(vectors.remove(0))
    }
}

/// POST JSON with the shared retry policy: 429/5xx and network errors retry
/// with exponential backoff, other 4xx fail fast.
async fn post_with_backoff(
    config: &EmbeddingConfig,
    endpoint: &str,
    bearer: Option<&str>,
    body: &Value,
) -> Result<Value> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(endpoint).json(body);
        if let Some(key) = bearer {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json().await?);
                }
                let text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow!("embedding API error {}: {}", status, text));
                    continue;
                }
                bail!("embedding API error {}: {}", status, text);
            }
            Err(e) => {
                last_err = Some(anyhow!("embedding request to {} failed: {}", endpoint, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("embedding failed after retries")))
}

fn parse_openai_embeddings(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("invalid embeddings response: missing data array"))?;

    data.iter()
        .map(|item| {
            let embedding = item
                .get("embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| anyhow!("invalid embeddings response: missing embedding"))?;
            Ok(embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect())
        })
        .collect()
}

fn parse_ollama_embeddings(json: &Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("invalid embed response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            Ok(embedding
                .as_array()
                .ok_or_else(|| anyhow!("invalid embed response: embedding is not an array"))?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn disabled_provider_errors_on_embed() {
        let provider = EmbeddingProvider::Disabled;
        let config = EmbeddingConfig::default();
        let result = provider.embed_query(&config, "query").await;
        assert!(result.is_err());
    }

    #[test]
    fn parses_openai_shape() {
        let json = json!({
            "data": [
                { "embedding": [0.1, 0.2] },
                { "embedding": [0.3, 0.4] }
            ]
        });
        let vectors = parse_openai_embeddings(&json).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 2);
        assert!((vectors[1][0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn parses_ollama_shape() {
        let json = json!({ "embeddings": [[1.0, 0.0], [0.0, 1.0]] });
        let vectors = parse_ollama_embeddings(&json).unwrap();
        assert_eq!(vectors.len(), 2);
    }

    #[test]
    fn rejects_malformed_responses() {
        assert!(parse_openai_embeddings(&json!({"data": "nope"})).is_err());
        assert!(parse_ollama_embeddings(&json!({})).is_err());
    }

    #[test]
    fn unknown_provider_rejected() {
        let config = EmbeddingConfig {
            provider: "sentencepiece".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(EmbeddingProvider::from_config(&config).is_err());
    }
}
