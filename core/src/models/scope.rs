//! Scope settings model and legacy-shape normalisation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MATCH_ALL: &str = "*";

/// Process-wide scope configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSettings {
    /// Never empty once normalised; `["*"]` means match-all
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Suppress out-of-scope traffic at the agent instead of flagging it
    #[serde(default)]
    pub drop: bool,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            include: vec![MATCH_ALL.to_string()],
            exclude: Vec::new(),
            drop: false,
        }
    }
}

impl ScopeSettings {
    pub fn new(include: Vec<String>, exclude: Vec<String>, drop: bool) -> Self {
        Self {
            include,
            exclude,
            drop,
        }
        .normalized()
    }

    /// Trim, drop blanks and duplicates, and fall back to match-all includes.
    pub fn normalized(self) -> Self {
        let mut include = clean_patterns(self.include);
        if include.is_empty() {
            include.push(MATCH_ALL.to_string());
        }
        Self {
            include,
            exclude: clean_patterns(self.exclude),
            drop: self.drop,
        }
    }

    /// Decode a persisted record, tolerating the legacy `patterns` shape and
    /// anything malformed.
    pub fn from_stored(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => Self::from_value(&value),
            Err(err) => {
                tracing::warn!("Stored scope settings are not valid JSON, using defaults: {err}");
                Self::default()
            }
        }
    }

    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };

        let include = obj
            .get("include")
            .or_else(|| obj.get("patterns"))
            .map(string_list)
            .unwrap_or_default();
        let exclude = obj.get("exclude").map(string_list).unwrap_or_default();
        let drop = obj.get("drop").and_then(Value::as_bool).unwrap_or(false);

        Self {
            include,
            exclude,
            drop,
        }
        .normalized()
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn clean_patterns(patterns: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let trimmed = pattern.trim();
        if trimmed.is_empty() || out.iter().any(|p| p == trimmed) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

/// Verdict handed to the capturing agent for a single URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDecision {
    pub in_scope: bool,
    /// Out of scope and suppression is enabled
    pub drop: bool,
}
