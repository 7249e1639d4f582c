//! Hybrid search engine.
//!
//! Combines up to four per-item score components into one ranking:
//!
//! | Component | Source |
//! |-----------|--------|
//! | `score_lexical` | trigram similarity from the store (min-max normalized) |
//! | `score_semantic` | cosine similarity from the vector backend (min-max normalized) |
//! | `score_recency` | `exp(-age_days / τ)` over `updated_at` |
//! | `score_quality` | the entity's stored quality prior |
//!
//! `score_final` is the weighted sum normalized by the weight total, so
//! configured weights need not sum to 1. Ties break by `created_at` descending
//! then UID ascending, which keeps rankings deterministic across runs.
//!
//! # Candidate Union
//!
//! Each enabled backend contributes its top `4 × limit` candidates (capped at
//! 200); the union is ranked and truncated to `limit`. A backend configured as
//! `none` simply contributes nothing.
//!
//! # ETag Contract
//!
//! Every response carries an ETag derived from the query parameters and the
//! store watermark. Any catalog write advances the watermark, so stale ETags
//! stop matching without explicit invalidation. A small LRU keyed by ETag
//! serves repeated identical queries without touching the backends.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::config::{Config, HybridWeights, LexicalBackend, VectorBackend};
use crate::embedding::EmbeddingProvider;
use crate::error::{HubError, HubResult};
use crate::models::{Entity, EntityType, SearchFilters};
use crate::store::{Candidate, CatalogStore};

const CANDIDATE_CAP: i64 = 200;
const RERANK_CAP: usize = 20;
const FIT_REASON_MAX_CHARS: usize = 280;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Keyword,
    Semantic,
    Hybrid,
}

impl SearchMode {
    pub fn parse(s: &str) -> HubResult<Self> {
        match s {
            "keyword" => Ok(SearchMode::Keyword),
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(HubError::InvalidRequest(format!(
                "unknown search mode '{}': use keyword, semantic, or hybrid",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerankMode {
    None,
    Llm,
}

impl RerankMode {
    pub fn parse(s: &str) -> HubResult<Self> {
        match s {
            "none" => Ok(RerankMode::None),
            "llm" => Ok(RerankMode::Llm),
            other => Err(HubError::InvalidRequest(format!(
                "unknown rerank mode '{}': use none or llm",
                other
            ))),
        }
    }
}

/// A fully validated search request.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    pub filters: SearchFilters,
    pub mode: SearchMode,
    pub limit: i64,
    pub with_rag: bool,
    pub rerank: RerankMode,
}

/// One ranked result on the stable output surface.
#[derive(Debug, Clone, Serialize)]
pub struct SearchItem {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub name: String,
    pub version: String,
    pub summary: Option<String>,
    pub capabilities: Vec<String>,
    pub frameworks: Vec<String>,
    pub providers: Vec<String>,
    pub score_lexical: f64,
    pub score_semantic: f64,
    pub score_quality: f64,
    pub score_recency: f64,
    pub score_final: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fit_reason: Option<String>,
    pub manifest_url: String,
    pub install_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

#[derive(Clone)]
pub struct SearchEngine {
    store: CatalogStore,
    config: Arc<Config>,
    embedder: Arc<EmbeddingProvider>,
    http: reqwest::Client,
}

impl SearchEngine {
    pub fn new(
        store: CatalogStore,
        config: Arc<Config>,
        embedder: Arc<EmbeddingProvider>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            store,
            config,
            embedder,
            http,
        }
    }

    /// Run one search end to end: candidates → fusion → rerank → enrichment.
    pub async fn run(&self, params: &SearchParams) -> HubResult<Vec<SearchItem>> {
        if params.query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let candidate_k = (params.limit * 4).min(CANDIDATE_CAP);

        let lexical_candidates = if params.mode != SearchMode::Semantic
            && self.config.search.lexical_backend == LexicalBackend::Pgtrgm
        {
            self.store
                .search_lexical(&params.query, &params.filters, candidate_k)
                .await?
        } else {
            Vec::new()
        };

        let mut query_vec: Option<Vec<f32>> = None;
        let semantic_candidates = if params.mode != SearchMode::Keyword
            && self.config.search.vector_backend == VectorBackend::Pgvector
            && self.embedder.is_enabled()
        {
            match self
                .embedder
                .embed_query(&self.config.embedding, &params.query)
                .await
            {
                Ok(vec) => {
                    let candidates = self
                        .store
                        .search_semantic(&vec, &params.filters, candidate_k)
                        .await?;
                    query_vec = Some(vec);
                    candidates
                }
                Err(e) if params.mode == SearchMode::Semantic => {
                    return Err(HubError::RemoteFailure(format!(
                        "query embedding failed: {}",
                        e
                    )));
                }
                Err(e) => {
                    warn!(error = %e, "query embedding failed; falling back to lexical only");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        if lexical_candidates.is_empty() && semantic_candidates.is_empty() {
            return Ok(Vec::new());
        }

        let lex_scores = normalize_candidates(&lexical_candidates);
        let sem_scores = normalize_candidates(&semantic_candidates);

        // Union by UID, then hydrate entities in one round-trip.
        let mut uids: Vec<String> = Vec::new();
        for c in lexical_candidates.iter().chain(semantic_candidates.iter()) {
            if !uids.contains(&c.uid) {
                uids.push(c.uid.clone());
            }
        }
        let entities = self.store.get_many(&uids).await?;

        let weights = effective_weights(&self.config.search.hybrid_weights, params.mode);
        let now = chrono::Utc::now();
        let tau = self.config.search.recency_tau_days;

        let mut ranked: Vec<(SearchItem, chrono::DateTime<chrono::Utc>)> = entities
            .into_iter()
            .map(|entity| {
                let components = ScoreComponents {
                    lexical: lex_scores.get(&entity.uid).copied().unwrap_or(0.0),
                    semantic: sem_scores.get(&entity.uid).copied().unwrap_or(0.0),
                    recency: recency_score(
                        (now - entity.updated_at).num_seconds() as f64 / 86_400.0,
                        tau,
                    ),
                    quality: entity.quality_score.clamp(0.0, 1.0),
                };
                let created_at = entity.created_at;
                let item = self.to_item(entity, &components, fuse(&components, &weights));
                (item, created_at)
            })
            .collect();

        ranked.sort_by(|(a, a_created), (b, b_created)| {
            b.score_final
                .partial_cmp(&a.score_final)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b_created.cmp(a_created))
                .then(a.id.cmp(&b.id))
        });

        let mut items: Vec<SearchItem> = ranked.into_iter().map(|(item, _)| item).collect();

        if params.rerank == RerankMode::Llm {
            items = self.rerank_llm(&params.query, items, params.limit).await;
        }

        items.truncate(params.limit as usize);

        if params.with_rag && self.config.search.rag_enabled {
            self.attach_fit_reasons(&mut items, query_vec.as_deref())
                .await;
        }

        Ok(items)
    }

    fn to_item(&self, entity: Entity, components: &ScoreComponents, score_final: f64) -> SearchItem {
        let base = self.config.public_base();
        let snippet = entity
            .description
            .as_deref()
            .map(|d| truncate_chars(d, 240));
        SearchItem {
            install_url: format!("{}/catalog/install?id={}", base, entity.uid),
            manifest_url: entity.source_url,
            id: entity.uid,
            entity_type: entity.entity_type,
            name: entity.name,
            version: entity.version,
            summary: entity.summary,
            capabilities: entity.capabilities,
            frameworks: entity.frameworks,
            providers: entity.providers,
            score_lexical: components.lexical,
            score_semantic: components.semantic,
            score_quality: components.quality,
            score_recency: components.recency,
            score_final,
            fit_reason: None,
            snippet,
        }
    }

    /// Post-order the head of the ranking through an external scoring call.
    /// Any failure keeps the pre-rerank order.
    async fn rerank_llm(
        &self,
        query: &str,
        items: Vec<SearchItem>,
        limit: i64,
    ) -> Vec<SearchItem> {
        let Some(rerank_url) = &self.config.search.rerank_url else {
            return items;
        };
        let head = ((limit as usize) * 2).min(RERANK_CAP).min(items.len());
        if head < 2 {
            return items;
        }

        let body = serde_json::json!({
            "query": query,
            "items": items[..head]
                .iter()
                .map(|item| serde_json::json!({
                    "id": item.id,
                    "text": format!(
                        "{} — {}",
                        item.name,
                        item.summary.as_deref().unwrap_or("")
                    ),
                }))
                .collect::<Vec<_>>(),
        });

        let scores: Option<Vec<f64>> = match self.http.post(rerank_url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<serde_json::Value>().await {
                Ok(json) => json.get("scores").and_then(|s| {
                    s.as_array().map(|arr| {
                        arr.iter().map(|v| v.as_f64().unwrap_or(0.0)).collect()
                    })
                }),
                Err(e) => {
                    warn!(error = %e, "reranker returned a malformed body");
                    None
                }
            },
            Ok(resp) => {
                warn!(status = %resp.status(), "reranker returned an error status");
                None
            }
            Err(e) => {
                warn!(error = %e, "reranker call failed");
                None
            }
        };

        match scores {
            Some(scores) if scores.len() == head => {
                let mut indexed: Vec<(usize, f64)> =
                    scores.into_iter().enumerate().collect();
                indexed.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
                });
                let mut head_items: Vec<Option<SearchItem>> =
                    items[..head].iter().cloned().map(Some).collect();
                let mut reordered: Vec<SearchItem> = indexed
                    .into_iter()
                    .filter_map(|(i, _)| head_items[i].take())
                    .collect();
                reordered.extend(items.into_iter().skip(head));
                reordered
            }
            _ => items,
        }
    }

    /// Attach a concise `fit_reason` to each item, best effort. With a query
    /// vector available the reason comes from the best-matching chunks;
    /// otherwise from the summary.
    async fn attach_fit_reasons(&self, items: &mut [SearchItem], query_vec: Option<&[f32]>) {
        for item in items.iter_mut() {
            let reason = match query_vec {
                Some(vec) => match self.store.top_chunks(&item.id, vec, 3).await {
                    Ok(chunks) if !chunks.is_empty() => {
                        let joined = chunks
                            .iter()
                            .map(|c| c.replace('\n', " "))
                            .collect::<Vec<_>>()
                            .join(" … ");
                        Some(truncate_chars(&joined, FIT_REASON_MAX_CHARS))
                    }
                    Ok(_) => item.summary.clone(),
                    Err(e) => {
                        warn!(uid = %item.id, error = %e, "fit reason lookup failed");
                        item.summary.clone()
                    }
                },
                None => item.summary.clone(),
            };
            item.fit_reason = reason;
        }
    }
}

// ============ Scoring ============

/// Per-item score components, each in [0, 1].
#[derive(Debug, Clone, Copy)]
pub struct ScoreComponents {
    pub lexical: f64,
    pub semantic: f64,
    pub recency: f64,
    pub quality: f64,
}

/// Weighted fusion, normalized by the weight total after summation. A zero
/// weight total yields zero.
pub fn fuse(components: &ScoreComponents, weights: &HybridWeights) -> f64 {
    let total = weights.lex + weights.sem + weights.rec + weights.qual;
    if total <= 0.0 {
        return 0.0;
    }
    (weights.lex * components.lexical
        + weights.sem * components.semantic
        + weights.rec * components.recency
        + weights.qual * components.quality)
        / total
}

/// Zero out the component a mode excludes: `keyword` drops the semantic
/// weight, `semantic` drops the lexical one.
pub fn effective_weights(weights: &HybridWeights, mode: SearchMode) -> HybridWeights {
    let mut w = *weights;
    match mode {
        SearchMode::Keyword => w.sem = 0.0,
        SearchMode::Semantic => w.lex = 0.0,
        SearchMode::Hybrid => {}
    }
    w
}

/// `exp(-age_days / τ)`, clamped so future timestamps cannot exceed 1.
pub fn recency_score(age_days: f64, tau_days: f64) -> f64 {
    (-age_days.max(0.0) / tau_days).exp().clamp(0.0, 1.0)
}

/// Min-max normalize a candidate set to [0, 1]. A single candidate (or an
/// all-equal set) normalizes to 1.0.
pub fn normalize_candidates(candidates: &[Candidate]) -> HashMap<String, f64> {
    if candidates.is_empty() {
        return HashMap::new();
    }

    let min = candidates
        .iter()
        .map(|c| c.score)
        .fold(f64::INFINITY, f64::min);
    let max = candidates
        .iter()
        .map(|c| c.score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.score - min) / (max - min)
            };
            (c.uid.clone(), norm)
        })
        .collect()
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max).collect();
    format!("{}…", truncated.trim_end())
}

// ============ ETag & cache ============

/// Derive the response ETag from the request shape and the store watermark.
/// Identical requests against an unchanged store produce identical tags.
pub fn compute_etag(params: &SearchParams, watermark: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(params.query.as_bytes());
    hasher.update([0u8]);
    if let Some(t) = params.filters.entity_type {
        hasher.update(t.as_str().as_bytes());
    }
    for set in [
        &params.filters.capabilities,
        &params.filters.frameworks,
        &params.filters.providers,
    ] {
        hasher.update([0u8]);
        for value in set {
            hasher.update(value.as_bytes());
            hasher.update([1u8]);
        }
    }
    hasher.update([
        params.filters.include_pending as u8,
        params.with_rag as u8,
        (params.rerank == RerankMode::Llm) as u8,
        match params.mode {
            SearchMode::Keyword => 0,
            SearchMode::Semantic => 1,
            SearchMode::Hybrid => 2,
        },
    ]);
    hasher.update(params.limit.to_le_bytes());
    hasher.update(watermark.to_le_bytes());

    let digest = hasher.finalize();
    let hex: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();
    format!("\"{}\"", hex)
}

/// Bounded LRU over search responses, keyed by ETag. Watermark advancement
/// changes the key itself, so stale entries simply stop being referenced and
/// age out.
pub struct SearchCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    map: HashMap<String, Arc<Vec<SearchItem>>>,
    order: VecDeque<String>,
}

impl SearchCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, etag: &str) -> Option<Arc<Vec<SearchItem>>> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let hit = inner.map.get(etag).cloned();
        if hit.is_some() {
            inner.order.retain(|k| k != etag);
            inner.order.push_back(etag.to_string());
        }
        hit
    }

    pub fn put(&self, etag: String, items: Arc<Vec<SearchItem>>) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if inner.map.insert(etag.clone(), items).is_none() {
            inner.order.push_back(etag);
        }
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.map.remove(&evicted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(uid: &str, score: f64) -> Candidate {
        Candidate {
            uid: uid.to_string(),
            score,
        }
    }

    fn item(id: &str, score: f64) -> SearchItem {
        SearchItem {
            id: id.to_string(),
            entity_type: EntityType::Tool,
            name: id.to_string(),
            version: "1.0.0".to_string(),
            summary: None,
            capabilities: Vec::new(),
            frameworks: Vec::new(),
            providers: Vec::new(),
            score_lexical: 0.0,
            score_semantic: 0.0,
            score_quality: 0.0,
            score_recency: 0.0,
            score_final: score,
            fit_reason: None,
            manifest_url: String::new(),
            install_url: String::new(),
            snippet: None,
        }
    }

    fn params(query: &str) -> SearchParams {
        SearchParams {
            query: query.to_string(),
            filters: SearchFilters::default(),
            mode: SearchMode::Hybrid,
            limit: 5,
            with_rag: false,
            rerank: RerankMode::None,
        }
    }

    #[test]
    fn normalize_empty_and_single() {
        assert!(normalize_candidates(&[]).is_empty());
        let scores = normalize_candidates(&[candidate("a", 0.3)]);
        assert!((scores["a"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn normalize_spreads_to_unit_interval() {
        let scores = normalize_candidates(&[
            candidate("a", 10.0),
            candidate("b", 5.0),
            candidate("c", 0.0),
        ]);
        assert!((scores["a"] - 1.0).abs() < 1e-9);
        assert!((scores["b"] - 0.5).abs() < 1e-9);
        assert!((scores["c"] - 0.0).abs() < 1e-9);
    }

    #[test]
    fn fuse_normalizes_by_weight_total() {
        let components = ScoreComponents {
            lexical: 1.0,
            semantic: 1.0,
            recency: 1.0,
            quality: 1.0,
        };
        // Weights summing to 2.0 must still yield a score in [0, 1].
        let weights = HybridWeights {
            sem: 0.8,
            lex: 0.8,
            rec: 0.2,
            qual: 0.2,
        };
        assert!((fuse(&components, &weights) - 1.0).abs() < 1e-9);

        let zero = HybridWeights {
            sem: 0.0,
            lex: 0.0,
            rec: 0.0,
            qual: 0.0,
        };
        assert_eq!(fuse(&components, &zero), 0.0);
    }

    #[test]
    fn keyword_mode_ignores_semantic_component() {
        let weights = HybridWeights::default();
        let w = effective_weights(&weights, SearchMode::Keyword);
        assert_eq!(w.sem, 0.0);
        assert!(w.lex > 0.0);

        let only_semantic = ScoreComponents {
            lexical: 0.0,
            semantic: 1.0,
            recency: 0.0,
            quality: 0.0,
        };
        assert_eq!(fuse(&only_semantic, &w), 0.0);
    }

    #[test]
    fn semantic_mode_ignores_lexical_component() {
        let w = effective_weights(&HybridWeights::default(), SearchMode::Semantic);
        assert_eq!(w.lex, 0.0);
        assert!(w.sem > 0.0);
    }

    #[test]
    fn recency_decays_and_clamps() {
        assert!((recency_score(0.0, 30.0) - 1.0).abs() < 1e-9);
        let month = recency_score(30.0, 30.0);
        assert!((month - (-1.0f64).exp()).abs() < 1e-9);
        assert!(recency_score(-5.0, 30.0) <= 1.0, "future timestamps clamp");
        assert!(recency_score(10_000.0, 30.0) >= 0.0);
    }

    #[test]
    fn etag_stable_for_identical_requests() {
        let a = compute_etag(&params("pdf"), 42);
        let b = compute_etag(&params("pdf"), 42);
        assert_eq!(a, b);
        assert!(a.starts_with('"') && a.ends_with('"'));
    }

    #[test]
    fn etag_changes_with_watermark_and_params() {
        let base = compute_etag(&params("pdf"), 42);
        assert_ne!(base, compute_etag(&params("pdf"), 43));
        assert_ne!(base, compute_etag(&params("pdfs"), 42));

        let mut filtered = params("pdf");
        filtered.filters.capabilities.push("pdf".to_string());
        assert_ne!(base, compute_etag(&filtered, 42));

        let mut pending = params("pdf");
        pending.filters.include_pending = true;
        assert_ne!(base, compute_etag(&pending, 42));
    }

    #[test]
    fn etag_distinguishes_set_boundaries() {
        // ["ab"] vs ["a", "b"] must not collide.
        let mut one = params("q");
        one.filters.capabilities = vec!["ab".to_string()];
        let mut two = params("q");
        two.filters.capabilities = vec!["a".to_string(), "b".to_string()];
        assert_ne!(compute_etag(&one, 1), compute_etag(&two, 1));
    }

    #[test]
    fn cache_lru_evicts_oldest() {
        let cache = SearchCache::new(2);
        cache.put("a".to_string(), Arc::new(vec![item("x", 1.0)]));
        cache.put("b".to_string(), Arc::new(vec![]));
        // Touch "a" so "b" becomes the eviction victim.
        assert!(cache.get("a").is_some());
        cache.put("c".to_string(), Arc::new(vec![]));
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld".repeat(50);
        let t = truncate_chars(&s, 40);
        assert!(t.chars().count() <= 41);
    }
}
