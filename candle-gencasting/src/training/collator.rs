//! Completion-only labels: only tokens after the response marker count
//! towards the loss.

use crate::core::{UnifiedError, UnifiedResult};
use crate::data::{Batch, PromptRecord};
use candle_core::{Device, Result, Tensor};
use tokenizers::Tokenizer;

/// Label value for positions excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Masks everything up to and including the first occurrence of the response
/// template, plus all padding.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOnlyCollator {
    response_ids: Vec<u32>,
    pad_id: u32,
}

impl CompletionOnlyCollator {
    /// The template is encoded without special tokens.
    pub fn new(response_template: &str, tokenizer: &Tokenizer, pad_id: u32) -> UnifiedResult<Self> {
        let encoding = tokenizer.encode(response_template, false).map_err(|e| {
            UnifiedError::validation("response_sequence", "a string the tokenizer can encode", response_template)
                .with_context(e.to_string())
        })?;
        Self::from_token_ids(encoding.get_ids().to_vec(), pad_id)
    }

    pub fn from_token_ids(response_ids: Vec<u32>, pad_id: u32) -> UnifiedResult<Self> {
        if response_ids.is_empty() {
            return Err(UnifiedError::validation(
                "response_sequence",
                "a marker that encodes to at least one token",
                "no tokens",
            ));
        }
        Ok(Self {
            response_ids,
            pad_id,
        })
    }

    pub fn response_ids(&self) -> &[u32] {
        &self.response_ids
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    /// Labels for one padded row whose first `length` tokens are real.
    /// `None` when the template does not occur in the real tokens.
    pub fn row_labels(&self, row: &[u32], length: usize) -> Option<Vec<i64>> {
        let start = find_subsequence(&row[..length], &self.response_ids)?;
        let first_target = start + self.response_ids.len();
        Some(
            row.iter()
                .enumerate()
                .map(|(pos, &id)| {
                    if pos >= first_target && pos < length {
                        i64::from(id)
                    } else {
                        IGNORE_INDEX
                    }
                })
                .collect(),
        )
    }

    pub fn collate(&self, records: &[PromptRecord]) -> UnifiedResult<TrainingBatch> {
        Ok(self.label_batch(Batch::collate(records, self.pad_id)?))
    }

    pub fn label_batch(&self, batch: Batch) -> TrainingBatch {
        let mut labels = Vec::with_capacity(batch.len() * batch.width());
        let mut missing_template = 0;
        for (idx, &length) in batch.lengths().iter().enumerate() {
            match self.row_labels(batch.row(idx), length) {
                Some(row) => labels.extend(row),
                None => {
                    missing_template += 1;
                    labels.extend(std::iter::repeat(IGNORE_INDEX).take(batch.width()));
                }
            }
        }
        TrainingBatch {
            batch,
            labels,
            missing_template,
        }
    }
}

fn find_subsequence(haystack: &[u32], needle: &[u32]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// A padded batch with per-position labels.
#[derive(Debug, Clone)]
pub struct TrainingBatch {
    pub batch: Batch,
    labels: Vec<i64>,
    missing_template: usize,
}

impl TrainingBatch {
    pub fn labels(&self) -> &[i64] {
        &self.labels
    }

    pub fn row_labels(&self, index: usize) -> &[i64] {
        let width = self.batch.width();
        &self.labels[index * width..(index + 1) * width]
    }

    /// Rows whose labels are fully ignored because the template was missing.
    pub fn missing_template(&self) -> usize {
        self.missing_template
    }

    /// Number of positions that predict a label (after the one-token shift).
    pub fn num_targets(&self) -> usize {
        (0..self.batch.len())
            .map(|row| {
                self.row_labels(row)
                    .iter()
                    .skip(1)
                    .filter(|&&l| l != IGNORE_INDEX)
                    .count()
            })
            .sum()
    }

    /// Next-token targets and loss mask, both `[batch, width - 1]`: position
    /// `t` predicts the label at `t + 1`.
    pub fn shifted_targets(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let width = self.batch.width();
        let rows = self.batch.len();
        let shifted = width.saturating_sub(1);
        let mut targets = Vec::with_capacity(rows * shifted);
        let mut mask = Vec::with_capacity(rows * shifted);
        for row in 0..rows {
            for &label in &self.row_labels(row)[1..] {
                if label == IGNORE_INDEX {
                    targets.push(0u32);
                    mask.push(0f32);
                } else {
                    targets.push(label as u32);
                    mask.push(1f32);
                }
            }
        }
        Ok((
            Tensor::from_vec(targets, (rows, shifted), device)?,
            Tensor::from_vec(mask, (rows, shifted), device)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ids: &[u32]) -> PromptRecord {
        PromptRecord {
            text: String::new(),
            input_ids: ids.to_vec(),
            length: ids.len(),
        }
    }

    #[test]
    fn test_labels_start_after_template() {
        let collator = CompletionOnlyCollator::from_token_ids(vec![7, 8], 0).unwrap();
        let labels = collator.row_labels(&[1, 5, 7, 8, 9, 10, 0], 6).unwrap();
        assert_eq!(labels, vec![-100, -100, -100, -100, 9, 10, -100]);
    }

    #[test]
    fn test_first_occurrence_wins() {
        let collator = CompletionOnlyCollator::from_token_ids(vec![7], 0).unwrap();
        let labels = collator.row_labels(&[7, 3, 7, 4], 4).unwrap();
        assert_eq!(labels, vec![-100, 3, 7, 4]);
    }

    #[test]
    fn test_missing_template_ignores_row() {
        let collator = CompletionOnlyCollator::from_token_ids(vec![7, 8], 0).unwrap();
        let batch = collator
            .collate(&[record(&[1, 7, 8, 4]), record(&[1, 8, 7])])
            .unwrap();
        assert_eq!(batch.missing_template(), 1);
        assert!(batch.row_labels(1).iter().all(|&l| l == IGNORE_INDEX));
        assert_eq!(batch.num_targets(), 1);
    }

    #[test]
    fn test_template_in_padding_is_not_found() {
        let collator = CompletionOnlyCollator::from_token_ids(vec![0], 0).unwrap();
        assert!(collator.row_labels(&[4, 5, 0, 0], 2).is_none());
    }

    #[test]
    fn test_shifted_targets() {
        let collator = CompletionOnlyCollator::from_token_ids(vec![7], 0).unwrap();
        let batch = collator
            .collate(&[record(&[1, 7, 4, 5]), record(&[1, 7, 6])])
            .unwrap();
        let (targets, mask) = batch.shifted_targets(&Device::Cpu).unwrap();
        assert_eq!(targets.to_vec2::<u32>().unwrap(), vec![vec![0, 4, 5], vec![0, 6, 0]]);
        assert_eq!(
            mask.to_vec2::<f32>().unwrap(),
            vec![vec![0.0, 1.0, 1.0], vec![0.0, 1.0, 0.0]]
        );
        assert_eq!(batch.num_targets(), 3);
    }

    #[test]
    fn test_empty_template_rejected() {
        assert!(CompletionOnlyCollator::from_token_ids(Vec::new(), 0)
            .unwrap_err()
            .is_validation());
    }
}
