//! Ordered query parameters.
//!
//! The signed query hash covers the exact unencoded `k=v&k=v` string the
//! exchange rebuilds from the request, so parameter order is kept as inserted
//! and array parameters repeat their `key[]`.

use std::fmt::Display;

/// Insertion-ordered list of query/body parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `key=value`.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Display) -> Self {
        self.push(key, value);
        self
    }

    /// Append `key=value` when `value` is present.
    #[must_use]
    pub fn with_opt<V: Display>(mut self, key: &str, value: Option<V>) -> Self {
        if let Some(value) = value {
            self.push(key, value);
        }
        self
    }

    /// Append `key[]=v` for every value.
    #[must_use]
    pub fn with_array<V: Display>(mut self, key: &str, values: impl IntoIterator<Item = V>) -> Self {
        let key = format!("{key}[]");
        for value in values {
            self.push(&key, value);
        }
        self
    }

    pub fn push(&mut self, key: &str, value: impl Display) {
        self.pairs.push((key.to_string(), value.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Unencoded query string used for the signature hash.
    pub fn to_query_string(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// JSON object body for POST requests. Array keys keep their `[]` suffix
    /// and collect into a JSON array.
    pub fn to_json_body(&self) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        for (key, value) in &self.pairs {
            if key.ends_with("[]") {
                let entry = body
                    .entry(key.clone())
                    .or_insert_with(|| serde_json::Value::Array(Vec::new()));
                if let serde_json::Value::Array(items) = entry {
                    items.push(serde_json::Value::String(value.clone()));
                }
            } else {
                body.insert(key.clone(), serde_json::Value::String(value.clone()));
            }
        }
        serde_json::Value::Object(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_string_keeps_insertion_order() {
        let params = QueryParams::new()
            .with("market", "KRW-BTC")
            .with("side", "bid")
            .with_opt::<&str>("volume", None)
            .with_opt("price", Some("5000"));
        assert_eq!(
            params.to_query_string(),
            "market=KRW-BTC&side=bid&price=5000"
        );
    }

    #[test]
    fn test_array_parameters_repeat_key() {
        let params = QueryParams::new()
            .with_array("states", ["wait", "watch"])
            .with("page", 2);
        assert_eq!(
            params.to_query_string(),
            "states[]=wait&states[]=watch&page=2"
        );
    }

    #[test]
    fn test_json_body_collects_arrays() {
        let body = QueryParams::new()
            .with("market", "KRW-ETH")
            .with_array("uuids", ["a", "b"])
            .to_json_body();
        assert_eq!(body["market"], "KRW-ETH");
        assert_eq!(body["uuids[]"], serde_json::json!(["a", "b"]));
        assert!(QueryParams::new().is_empty());
    }
}
