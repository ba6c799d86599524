//! Header normalization and Vary matching.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// A header value as supplied by the HTTP layer: either a single string or
/// an array of strings (e.g. repeated headers, or already-split values).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multi(Vec<String>),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Single(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Single(value)
    }
}

/// Headers as handed in by the HTTP layer: unordered, mixed-case keys,
/// possibly array-valued.
pub type RawHeaders = HashMap<String, HeaderValue>;

/// Headers after normalization: lowercase keys, sorted, single joined
/// string values, no empty entries. `BTreeMap` gives us the sort order for
/// free and, combined with `serde_json`, serializes keys in that same
/// order — which is exactly what the identifier's `vary` field needs.
pub type NormalizedHeaders = BTreeMap<String, String>;

/// Lowercase keys, sort them, join array values with `", "`, and drop
/// entries whose normalized value is empty.
pub fn normalize_headers(raw: &RawHeaders) -> NormalizedHeaders {
    let mut out = NormalizedHeaders::new();
    for (key, value) in raw {
        let lower = key.to_lowercase();
        let joined = match value {
            HeaderValue::Single(s) => s.clone(),
            HeaderValue::Multi(parts) => parts.join(", "),
        };
        if joined.is_empty() {
            continue;
        }
        out.insert(lower, joined);
    }
    out
}

/// An identifier matches a request when specificity is zero (no Vary
/// constraints) or every entry in its Vary map is present with an equal
/// value in the caller's normalized request headers.
pub fn vary_matches(vary: &NormalizedHeaders, request_headers: &NormalizedHeaders) -> bool {
    vary.iter()
        .all(|(key, value)| request_headers.get(key).map(|rv| rv == value).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, HeaderValue)]) -> RawHeaders {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn lowercases_and_sorts_keys() {
        let headers = raw(&[
            ("Accept-Language", "en".into()),
            ("X-Custom", "1".into()),
        ]);
        let normalized = normalize_headers(&headers);
        let keys: Vec<&String> = normalized.keys().collect();
        assert_eq!(keys, vec!["accept-language", "x-custom"]);
    }

    #[test]
    fn joins_multi_values() {
        let headers = raw(&[("Accept", HeaderValue::Multi(vec!["text/html".into(), "*/*".into()]))]);
        let normalized = normalize_headers(&headers);
        assert_eq!(normalized.get("accept").unwrap(), "text/html, */*");
    }

    #[test]
    fn drops_empty_values() {
        let headers = raw(&[("X-Empty", "".into()), ("X-Present", "1".into())]);
        let normalized = normalize_headers(&headers);
        assert!(!normalized.contains_key("x-empty"));
        assert!(normalized.contains_key("x-present"));
    }

    #[test]
    fn empty_vary_always_matches() {
        let vary = NormalizedHeaders::new();
        let request = normalize_headers(&raw(&[("Accept-Language", "en".into())]));
        assert!(vary_matches(&vary, &request));
    }

    #[test]
    fn vary_mismatch_on_missing_or_different_value() {
        let vary: NormalizedHeaders = [("accept-language".to_string(), "en".to_string())].into();
        let en = normalize_headers(&raw(&[("Accept-Language", "en".into())]));
        let fr = normalize_headers(&raw(&[("Accept-Language", "fr".into())]));
        let none = NormalizedHeaders::new();
        assert!(vary_matches(&vary, &en));
        assert!(!vary_matches(&vary, &fr));
        assert!(!vary_matches(&vary, &none));
    }
}
