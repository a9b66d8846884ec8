//! Class labels and the single vocabulary token that stands in for each.

use crate::core::{ConfigErrorType, UnifiedError, UnifiedResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use tokenizers::Tokenizer;

/// The three ways a caller can describe the class tokens.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassTokens {
    /// Explicit `label -> token id`, used as given.
    Mapping(Vec<(String, u32)>),
    /// Labels; each resolves to the first non-special token of its encoding.
    Labels(Vec<String>),
    /// Raw token ids; each id's decoded string becomes its label.
    Ids(Vec<u32>),
}

impl ClassTokens {
    pub fn len(&self) -> usize {
        match self {
            Self::Mapping(entries) => entries.len(),
            Self::Labels(labels) => labels.len(),
            Self::Ids(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse a JSON object (`{"yes": 9820}`), an array of strings or an array
    /// of non-negative integers. Any other shape is rejected.
    pub fn from_json(value: &Value) -> UnifiedResult<Self> {
        match value {
            Value::Object(map) => map
                .iter()
                .map(|(label, id)| {
                    json_token_id(id)
                        .map(|id| (label.clone(), id))
                        .ok_or_else(|| {
                            UnifiedError::validation("class_tokens", "a non-negative integer token id", id.to_string())
                                .with_context(format!("label {label:?}"))
                        })
                })
                .collect::<UnifiedResult<Vec<_>>>()
                .map(Self::Mapping),
            Value::Array(items) if items.iter().all(Value::is_string) => Ok(Self::Labels(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            )),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    json_token_id(item).ok_or_else(|| {
                        UnifiedError::validation(
                            "class_tokens",
                            "a list of strings or a list of non-negative integers",
                            format!("element {item}"),
                        )
                    })
                })
                .collect::<UnifiedResult<Vec<_>>>()
                .map(Self::Ids),
            other => Err(UnifiedError::validation(
                "class_tokens",
                "an object, a list of strings or a list of integers",
                json_kind(other),
            )),
        }
    }

    pub fn from_json_str(content: &str) -> UnifiedResult<Self> {
        let value: Value = serde_json::from_str(content).map_err(|e| {
            UnifiedError::validation("class_tokens", "valid JSON", e.to_string())
        })?;
        Self::from_json(&value)
    }

    pub fn from_file(path: &Path) -> UnifiedResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            UnifiedError::configuration(
                "load class tokens",
                ConfigErrorType::FileNotFound(format!("{:?}", path)),
                Some(e.to_string()),
            )
        })?;
        Self::from_json_str(&content)
    }
}

fn json_token_id(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|id| u32::try_from(id).ok())
}

fn json_kind(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
    .to_string()
}

impl From<Vec<String>> for ClassTokens {
    fn from(labels: Vec<String>) -> Self {
        Self::Labels(labels)
    }
}

impl From<Vec<&str>> for ClassTokens {
    fn from(labels: Vec<&str>) -> Self {
        Self::Labels(labels.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<u32>> for ClassTokens {
    fn from(ids: Vec<u32>) -> Self {
        Self::Ids(ids)
    }
}

impl From<Vec<(&str, u32)>> for ClassTokens {
    fn from(entries: Vec<(&str, u32)>) -> Self {
        Self::Mapping(
            entries
                .into_iter()
                .map(|(label, id)| (label.to_string(), id))
                .collect(),
        )
    }
}

/// Resolved, ordered `label -> token id` map. Order is output column order.
///
/// There is no mutation API; resolving different class tokens produces a new
/// map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassTokenMap {
    entries: Vec<(String, u32)>,
}

impl ClassTokenMap {
    /// Resolve `tokens` against `tokenizer`. Ids must be below `vocab_size`
    /// and labels must be unique.
    pub fn resolve(
        tokens: &ClassTokens,
        tokenizer: &Tokenizer,
        vocab_size: usize,
    ) -> UnifiedResult<Self> {
        if tokens.is_empty() {
            return Err(UnifiedError::validation(
                "class_tokens",
                "at least one class token",
                "an empty collection",
            ));
        }

        let entries = match tokens {
            ClassTokens::Mapping(entries) => entries.clone(),
            ClassTokens::Labels(labels) => labels
                .iter()
                .map(|label| label_token(tokenizer, label).map(|id| (label.clone(), id)))
                .collect::<UnifiedResult<Vec<_>>>()?,
            ClassTokens::Ids(ids) => ids
                .iter()
                .map(|&id| {
                    check_in_vocab(id, vocab_size)?;
                    let label = tokenizer.decode(&[id], false).map_err(|e| {
                        UnifiedError::validation("class_tokens", "a decodable token id", id.to_string())
                            .with_context(e.to_string())
                    })?;
                    Ok((label, id))
                })
                .collect::<UnifiedResult<Vec<_>>>()?,
        };

        let mut seen = HashSet::with_capacity(entries.len());
        for (label, id) in &entries {
            check_in_vocab(*id, vocab_size)?;
            if !seen.insert(label.as_str()) {
                return Err(UnifiedError::validation(
                    "class_tokens",
                    "unique labels",
                    format!("duplicate label {label:?}"),
                ));
            }
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> Vec<String> {
        self.entries.iter().map(|(label, _)| label.clone()).collect()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.entries.iter().map(|(_, id)| *id).collect()
    }

    pub fn get(&self, label: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, id)| *id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.entries.iter().map(|(label, id)| (label.as_str(), *id))
    }
}

impl std::fmt::Display for ClassTokenMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|(label, id)| format!("{label:?}: {id}"))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

fn check_in_vocab(id: u32, vocab_size: usize) -> UnifiedResult<()> {
    if (id as usize) < vocab_size {
        Ok(())
    } else {
        Err(UnifiedError::validation(
            "class_tokens",
            format!("a token id below the vocabulary size {vocab_size}"),
            id.to_string(),
        ))
    }
}

/// Token id for a label: encode with special tokens and take the first
/// token that is not special. For BOS-prepending tokenizers that is index 1.
fn label_token(tokenizer: &Tokenizer, label: &str) -> UnifiedResult<u32> {
    let encoding = tokenizer.encode(label, true).map_err(|e| {
        UnifiedError::validation("class_tokens", "a label the tokenizer can encode", label)
            .with_context(e.to_string())
    })?;
    encoding
        .get_ids()
        .iter()
        .zip(encoding.get_special_tokens_mask())
        .find(|(_, special)| **special == 0)
        .map(|(&id, _)| id)
        .ok_or_else(|| {
            UnifiedError::validation(
                "class_tokens",
                "a label that encodes to at least one non-special token",
                format!("{label:?}"),
            )
        })
}
