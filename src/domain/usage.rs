//! Usage counters reported by providers.
//!
//! Providers disagree on usage key names (`input_tokens` vs `prompt_tokens`,
//! nested detail objects, ...), so counters are kept as an opaque
//! key → number map. Nested objects are flattened with dotted keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Accumulated numeric usage counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsageCounters(BTreeMap<String, f64>);

impl UsageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build counters from a provider's raw usage object.
    ///
    /// Non-numeric leaves (strings, booleans, nulls) are ignored.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut counters = Self::new();
        counters.collect("", value);
        counters
    }

    fn collect(&mut self, prefix: &str, value: &serde_json::Value) {
        match value {
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_f64() {
                    *self.0.entry(prefix.to_string()).or_insert(0.0) += v;
                }
            }
            serde_json::Value::Object(map) => {
                for (key, nested) in map {
                    let key = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    };
                    self.collect(&key, nested);
                }
            }
            _ => {}
        }
    }

    /// Set a counter, replacing any previous value
    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    /// First present key wins; zero when none of them exist
    pub fn first_of(&self, keys: &[&str]) -> f64 {
        keys.iter().find_map(|k| self.get(k)).unwrap_or(0.0)
    }

    /// Sum `other` into `self` key by key. Keys missing on either side count as zero.
    pub fn merge(&mut self, other: &UsageCounters) {
        for (key, value) in &other.0 {
            *self.0.entry(key.clone()).or_insert(0.0) += value;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromIterator<(String, f64)> for UsageCounters {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_sums_by_key() {
        let mut total = UsageCounters::new();
        total.insert("input_tokens", 10.0);

        let mut next = UsageCounters::new();
        next.insert("input_tokens", 5.0);
        next.insert("output_tokens", 7.0);

        total.merge(&next);
        total.merge(&next);

        assert_eq!(total.get("input_tokens"), Some(20.0));
        assert_eq!(total.get("output_tokens"), Some(14.0));
    }

    #[test]
    fn test_from_json_flattens_and_ignores_non_numbers() {
        let usage = UsageCounters::from_json(&json!({
            "prompt_tokens": 12,
            "completion_tokens": 30,
            "model": "gpt-4o",
            "prompt_tokens_details": { "cached_tokens": 4, "audio": null }
        }));

        assert_eq!(usage.len(), 3);
        assert_eq!(usage.get("prompt_tokens"), Some(12.0));
        assert_eq!(usage.get("prompt_tokens_details.cached_tokens"), Some(4.0));
        assert_eq!(usage.get("model"), None);
    }

    #[test]
    fn test_first_of() {
        let usage = UsageCounters::from_json(&json!({ "prompt_tokens": 3 }));
        assert_eq!(usage.first_of(&["input_tokens", "prompt_tokens"]), 3.0);
        assert_eq!(usage.first_of(&["output_tokens"]), 0.0);
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let usage = UsageCounters::from_json(&json!({ "output_tokens": 2 }));
        let value = serde_json::to_value(&usage).unwrap();
        assert_eq!(value, json!({ "output_tokens": 2.0 }));
    }
}
