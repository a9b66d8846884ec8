//! Prompt collections and their tokenized, right-padded batches.

use crate::core::{ConfigErrorType, UnifiedError, UnifiedResult};
use candle_core::{Device, Tensor};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tokenizers::Tokenizer;

/// Column read when a table is given without naming one.
pub const DEFAULT_TEXT_COLUMN: &str = "prompt";

/// Rows of JSON records with a fixed set of column names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptTable {
    columns: Vec<String>,
    rows: Vec<Map<String, Value>>,
}

impl PromptTable {
    /// Build a table from an array of JSON objects. Columns are the union of
    /// all keys in first-seen order.
    pub fn from_json_records(value: &Value) -> UnifiedResult<Self> {
        let records = value.as_array().ok_or_else(|| {
            UnifiedError::validation("prompt table", "an array of JSON objects", "a non-array value")
        })?;
        let mut table = Self::default();
        for (idx, record) in records.iter().enumerate() {
            let object = record.as_object().ok_or_else(|| {
                UnifiedError::validation("prompt table", "a JSON object per record", record.to_string())
                    .with_context(format!("record {idx}"))
            })?;
            for key in object.keys() {
                if !table.columns.contains(key) {
                    table.columns.push(key.clone());
                }
            }
            table.rows.push(object.clone());
        }
        Ok(table)
    }

    pub fn from_json_str(content: &str) -> UnifiedResult<Self> {
        let value: Value = serde_json::from_str(content)?;
        Self::from_json_records(&value)
    }

    pub fn from_json_file(path: &Path) -> UnifiedResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            UnifiedError::configuration(
                "load prompt table",
                ConfigErrorType::FileNotFound(format!("{:?}", path)),
                Some(e.to_string()),
            )
        })?;
        Self::from_json_str(&content)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Text values of one column; every cell must be a string.
    pub fn text_column(&self, name: &str) -> UnifiedResult<Vec<String>> {
        if !self.has_column(name) {
            return Err(UnifiedError::validation(
                "prompt table",
                format!("a '{name}' column"),
                format!("columns {:?}", self.columns),
            ));
        }
        self.rows
            .iter()
            .enumerate()
            .map(|(idx, row)| match row.get(name) {
                Some(Value::String(text)) => Ok(text.clone()),
                other => Err(UnifiedError::validation(
                    format!("{name}[{idx}]"),
                    "a string",
                    other.map_or_else(|| "a missing cell".to_string(), Value::to_string),
                )),
            })
            .collect()
    }
}

/// A prompt list or a table holding a prompt column.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptSource {
    Prompts(Vec<String>),
    Table(PromptTable),
}

impl PromptSource {
    fn into_texts(self, column: &str) -> UnifiedResult<Vec<String>> {
        match self {
            Self::Prompts(prompts) => Ok(prompts),
            Self::Table(table) => table.text_column(column),
        }
    }
}

impl From<Vec<String>> for PromptSource {
    fn from(prompts: Vec<String>) -> Self {
        Self::Prompts(prompts)
    }
}

impl From<Vec<&str>> for PromptSource {
    fn from(prompts: Vec<&str>) -> Self {
        Self::Prompts(prompts.into_iter().map(str::to_string).collect())
    }
}

impl From<PromptTable> for PromptSource {
    fn from(table: PromptTable) -> Self {
        Self::Table(table)
    }
}

/// One tokenized prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptRecord {
    pub text: String,
    pub input_ids: Vec<u32>,
    /// Unpadded token count.
    pub length: usize,
}

/// Prompts plus the tokenizer used to encode them on access.
#[derive(Clone)]
pub struct PromptDataset {
    prompts: Vec<String>,
    tokenizer: Arc<Tokenizer>,
}

impl PromptDataset {
    /// Table sources must carry a `prompt` column.
    pub fn new(source: impl Into<PromptSource>, tokenizer: Arc<Tokenizer>) -> UnifiedResult<Self> {
        Self::from_column(source, DEFAULT_TEXT_COLUMN, tokenizer)
    }

    /// Like [`PromptDataset::new`] but reads table sources from `column`.
    pub fn from_column(
        source: impl Into<PromptSource>,
        column: &str,
        tokenizer: Arc<Tokenizer>,
    ) -> UnifiedResult<Self> {
        let prompts = source.into().into_texts(column)?;
        Ok(Self { prompts, tokenizer })
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn tokenizer(&self) -> &Arc<Tokenizer> {
        &self.tokenizer
    }

    /// Tokenize the prompt at `index`. Truncation follows the tokenizer's
    /// configured maximum; padding is left to [`Batch::collate`].
    pub fn get_item(&self, index: usize) -> UnifiedResult<PromptRecord> {
        let text = self.prompts.get(index).ok_or_else(|| {
            UnifiedError::validation(
                "index",
                format!("an index below {}", self.prompts.len()),
                index.to_string(),
            )
        })?;
        let encoding = self.tokenizer.encode(text.as_str(), true).map_err(|e| {
            UnifiedError::Processing {
                operation: "tokenize prompt".to_string(),
                cause: e.to_string(),
                input_context: Some(format!("prompt {index}")),
            }
        })?;
        // Single-sequence encodes are never padded, but the mask keeps the
        // length honest if a fixed padding strategy was configured.
        let length = encoding
            .get_attention_mask()
            .iter()
            .filter(|&&m| m == 1)
            .count();
        let input_ids = encoding.get_ids()[..length].to_vec();
        Ok(PromptRecord {
            text: text.clone(),
            input_ids,
            length,
        })
    }

    /// Pad id configured on the tokenizer.
    pub fn pad_id(&self) -> UnifiedResult<u32> {
        self.tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .ok_or_else(|| {
                UnifiedError::precondition("collate batch", "the tokenizer has no pad token configured")
            })
    }

    /// Sequential batches of at most `batch_size` records.
    pub fn batches(&self, batch_size: usize) -> UnifiedResult<BatchIter<'_>> {
        if batch_size == 0 {
            return Err(UnifiedError::validation("batch_size", "a value >= 1", "0"));
        }
        Ok(BatchIter {
            dataset: self,
            batch_size,
            pad_id: self.pad_id()?,
            next: 0,
        })
    }
}

impl std::fmt::Debug for PromptDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptDataset")
            .field("len", &self.prompts.len())
            .finish()
    }
}

/// Iterator returned by [`PromptDataset::batches`].
pub struct BatchIter<'a> {
    dataset: &'a PromptDataset,
    batch_size: usize,
    pad_id: u32,
    next: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = UnifiedResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.dataset.len() {
            return None;
        }
        let end = (self.next + self.batch_size).min(self.dataset.len());
        let records = (self.next..end)
            .map(|idx| self.dataset.get_item(idx))
            .collect::<UnifiedResult<Vec<_>>>();
        self.next = end;
        Some(records.and_then(|records| Batch::collate(&records, self.pad_id)))
    }
}

/// Right-padded token ids plus each row's true length.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    input_ids: Vec<u32>,
    lengths: Vec<usize>,
    width: usize,
    pad_id: u32,
}

impl Batch {
    /// Pad `records` on the right with `pad_id` to the longest record.
    pub fn collate(records: &[PromptRecord], pad_id: u32) -> UnifiedResult<Self> {
        if records.is_empty() {
            return Err(UnifiedError::validation("batch", "at least one record", "none"));
        }
        if let Some((idx, _)) = records.iter().enumerate().find(|(_, r)| r.length == 0) {
            return Err(UnifiedError::validation(
                "batch",
                "records with at least one token",
                format!("an empty record at position {idx}"),
            ));
        }
        let width = records.iter().map(|r| r.length).max().unwrap_or(0);
        let mut input_ids = Vec::with_capacity(records.len() * width);
        for record in records {
            input_ids.extend_from_slice(&record.input_ids[..record.length]);
            input_ids.extend(std::iter::repeat(pad_id).take(width - record.length));
        }
        Ok(Self {
            input_ids,
            lengths: records.iter().map(|r| r.length).collect(),
            width,
            pad_id,
        })
    }

    /// Build a batch from already padded rows.
    pub fn from_padded(rows: Vec<Vec<u32>>, lengths: Vec<usize>, pad_id: u32) -> UnifiedResult<Self> {
        let width = rows.first().map_or(0, Vec::len);
        if rows.is_empty() || rows.len() != lengths.len() {
            return Err(UnifiedError::validation(
                "batch",
                "one length per non-empty row",
                format!("{} rows, {} lengths", rows.len(), lengths.len()),
            ));
        }
        if rows.iter().any(|r| r.len() != width) {
            return Err(UnifiedError::validation("batch", "rows of equal width", "ragged rows"));
        }
        if let Some(&bad) = lengths.iter().find(|&&l| l == 0 || l > width) {
            return Err(UnifiedError::validation(
                "batch",
                format!("lengths in 1..={width}"),
                bad.to_string(),
            ));
        }
        Ok(Self {
            input_ids: rows.concat(),
            lengths,
            width,
            pad_id,
        })
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn row(&self, index: usize) -> &[u32] {
        &self.input_ids[index * self.width..(index + 1) * self.width]
    }

    /// `[batch, width]` u32 token ids.
    pub fn input_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_slice(&self.input_ids, (self.len(), self.width), device)
    }

    /// `[batch, width]` u8 mask, 1 on real tokens.
    pub fn attention_mask(&self, device: &Device) -> candle_core::Result<Tensor> {
        let mask: Vec<u8> = self
            .lengths
            .iter()
            .flat_map(|&len| (0..self.width).map(move |pos| u8::from(pos < len)))
            .collect();
        Tensor::from_vec(mask, (self.len(), self.width), device)
    }
}
