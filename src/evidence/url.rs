//! URL normalization and hashing for cross-branch deduplication.

use sha2::{Digest, Sha256};
use url::Url;

/// Query parameters that only track, never identify content.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "msclkid", "ref", "ref_src"];

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key)
}

/// Normalize a URL for dedup purposes.
///
/// Lowercases scheme and host (the `url` crate does this on parse), strips
/// the fragment, drops tracking parameters, sorts the remaining query pairs,
/// and trims a trailing slash from non-root paths. Only http(s) URLs
/// normalize; anything else returns `None`.
///
/// Idempotent: `normalize_url(&normalize_url(u)?) == normalize_url(u)`.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs).finish();
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    Some(url.to_string())
}

/// Hex SHA-256 of a normalized URL, used as the cross-reference key in the
/// run index.
pub fn url_hash(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}
