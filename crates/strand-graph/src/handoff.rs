use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Key holding the raw text of the most recent prompt node's response.
pub const LAST_OUTPUT_KEY: &str = "output";

/// JSON key/value data passed between the prompt nodes of a declarative
/// graph. It is both the input and the output type of every prompt node,
/// and the data edge expressions are evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffContext {
    data: HashMap<String, serde_json::Value>,
}

impl HandoffContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    /// Build from `key=value` pairs. Values that parse as JSON are stored as
    /// JSON, anything else as a string.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let data = pairs
            .into_iter()
            .map(|(k, v)| {
                let value = serde_json::from_str(v)
                    .unwrap_or_else(|_| serde_json::Value::String(v.to_string()));
                (k.to_string(), value)
            })
            .collect();
        Self { data }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Add one to an integer counter, starting from zero. Returns the new value.
    pub fn increment(&mut self, key: &str) -> u64 {
        let next = self.data.get(key).and_then(|v| v.as_u64()).unwrap_or(0) + 1;
        self.data.insert(key.to_string(), serde_json::Value::from(next));
        next
    }

    /// Overwrite with every entry of `other`.
    pub fn merge(&mut self, other: &HandoffContext) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Keep the raw response text under [`LAST_OUTPUT_KEY`]. A fanned-out
    /// node stores an array of texts instead.
    pub fn record_output(&mut self, raw: serde_json::Value) {
        self.data.insert(LAST_OUTPUT_KEY.to_string(), raw);
    }

    /// Copy the fields named in `output_keys` out of a parsed response.
    /// Fields the response lacks leave earlier values untouched.
    pub fn ingest_fields(
        &mut self,
        output_keys: &[String],
        fields: &serde_json::Map<String, serde_json::Value>,
    ) {
        for key in output_keys {
            if let Some(val) = fields.get(key) {
                self.data.insert(key.clone(), val.clone());
            }
        }
    }

    /// Prompt text: a context block for `input_keys` followed by `task`.
    pub fn render_prompt(&self, input_keys: &[String], task: &str) -> String {
        let mut prompt = String::new();
        let present: Vec<_> = input_keys
            .iter()
            .filter_map(|k| self.data.get(k).map(|v| (k, v)))
            .collect();

        if !present.is_empty() {
            prompt.push_str("## Context Data\n\n");
            for (key, value) in present {
                let display = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                prompt.push_str(&format!("**{}**: {}\n", key, display));
            }
            prompt.push_str("\n---\n\n");
        }

        prompt.push_str(task);
        prompt
    }

    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
