//! Index document parsing.
//!
//! A remote points at an *index document*: a JSON body listing manifest URLs.
//! Three shapes are accepted:
//!
//! 1. `{"manifests": [url, ...]}`
//! 2. `{"items": [{"manifest_url": url}, ...]}`
//! 3. `{"entries": [{"base_url": u, "path": p}, ...]}` — resolved by
//!    concatenation
//!
//! Relative URLs in shapes 1 and 2 are resolved against the index URL itself,
//! so an index can refer to sibling files with bare paths.

use serde_json::Value;
use url::Url;

use crate::error::{HubError, HubResult};

/// Extract every manifest URL from an index document.
///
/// Returns `InvalidRequest` when the document matches none of the accepted
/// shapes, or when an entry cannot be resolved to an absolute http(s) URL.
pub fn collect_manifest_urls(doc: &Value, index_url: &Url) -> HubResult<Vec<Url>> {
    if let Some(urls) = doc.get("manifests").and_then(Value::as_array) {
        return urls
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let s = v.as_str().ok_or_else(|| {
                    HubError::InvalidRequest(format!("manifests[{}] is not a string", i))
                })?;
                resolve(index_url, s)
            })
            .collect();
    }

    if let Some(items) = doc.get("items").and_then(Value::as_array) {
        return items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let s = item.get("manifest_url").and_then(Value::as_str).ok_or_else(|| {
                    HubError::InvalidRequest(format!("items[{}].manifest_url is missing", i))
                })?;
                resolve(index_url, s)
            })
            .collect();
    }

    if let Some(entries) = doc.get("entries").and_then(Value::as_array) {
        return entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let base = entry.get("base_url").and_then(Value::as_str).ok_or_else(|| {
                    HubError::InvalidRequest(format!("entries[{}].base_url is missing", i))
                })?;
                let path = entry.get("path").and_then(Value::as_str).ok_or_else(|| {
                    HubError::InvalidRequest(format!("entries[{}].path is missing", i))
                })?;
                let joined = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
                parse_http(&joined)
            })
            .collect();
    }

    Err(HubError::InvalidRequest(
        "unrecognized index document shape: expected manifests[], items[], or entries[]"
            .to_string(),
    ))
}

fn resolve(index_url: &Url, raw: &str) -> HubResult<Url> {
    // Absolute URLs pass through; anything else is joined onto the index URL.
    match Url::parse(raw) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => Ok(u),
        Ok(u) => Err(HubError::InvalidRequest(format!(
            "manifest URL '{}' has unsupported scheme '{}'",
            raw,
            u.scheme()
        ))),
        Err(url::ParseError::RelativeUrlWithoutBase) => index_url.join(raw).map_err(|e| {
            HubError::InvalidRequest(format!("cannot resolve manifest URL '{}': {}", raw, e))
        }),
        Err(e) => Err(HubError::InvalidRequest(format!(
            "malformed manifest URL '{}': {}",
            raw, e
        ))),
    }
}

fn parse_http(raw: &str) -> HubResult<Url> {
    match Url::parse(raw) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => Ok(u),
        _ => Err(HubError::InvalidRequest(format!(
            "'{}' is not an absolute http(s) URL",
            raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn index_url() -> Url {
        Url::parse("https://ex/catalog/index.json").unwrap()
    }

    #[test]
    fn shape_manifests() {
        let doc = json!({"manifests": ["https://ex/a.json", "https://ex/b.json"]});
        let urls = collect_manifest_urls(&doc, &index_url()).unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0].as_str(), "https://ex/a.json");
    }

    #[test]
    fn shape_manifests_resolves_relative() {
        let doc = json!({"manifests": ["a.json", "../top.json"]});
        let urls = collect_manifest_urls(&doc, &index_url()).unwrap();
        assert_eq!(urls[0].as_str(), "https://ex/catalog/a.json");
        assert_eq!(urls[1].as_str(), "https://ex/top.json");
    }

    #[test]
    fn shape_items() {
        let doc = json!({"items": [{"manifest_url": "https://ex/a.json"}, {"manifest_url": "b.json"}]});
        let urls = collect_manifest_urls(&doc, &index_url()).unwrap();
        assert_eq!(urls[1].as_str(), "https://ex/catalog/b.json");
    }

    #[test]
    fn shape_entries_concatenates() {
        let doc = json!({"entries": [
            {"base_url": "https://ex/manifests/", "path": "/hello.json"},
            {"base_url": "https://ex/manifests", "path": "world.json"}
        ]});
        let urls = collect_manifest_urls(&doc, &index_url()).unwrap();
        assert_eq!(urls[0].as_str(), "https://ex/manifests/hello.json");
        assert_eq!(urls[1].as_str(), "https://ex/manifests/world.json");
    }

    #[test]
    fn unknown_shape_rejected() {
        let doc = json!({"servers": []});
        let err = collect_manifest_urls(&doc, &index_url()).unwrap_err();
        assert!(err.to_string().contains("unrecognized index document shape"));
    }

    #[test]
    fn non_http_scheme_rejected() {
        let doc = json!({"manifests": ["ftp://ex/a.json"]});
        assert!(collect_manifest_urls(&doc, &index_url()).is_err());
    }

    #[test]
    fn malformed_item_reports_position() {
        let doc = json!({"items": [{"manifest_url": "https://ex/a.json"}, {"url": "x"}]});
        let err = collect_manifest_urls(&doc, &index_url()).unwrap_err();
        assert!(err.to_string().contains("items[1]"));
    }
}
