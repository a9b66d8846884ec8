//! Output of one extraction call: a row per prompt, a column per class label.

use crate::core::{UnifiedError, UnifiedResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Class probabilities, one row per prompt in input order. Each row sums to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityTable {
    columns: Vec<String>,
    rows: Vec<Vec<f32>>,
}

impl ProbabilityTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<f32>) -> UnifiedResult<()> {
        if row.len() != self.columns.len() {
            return Err(UnifiedError::validation(
                "probability row",
                format!("{} values", self.columns.len()),
                row.len().to_string(),
            ));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<f32>] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<&[f32]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// All probabilities for one label, in row order.
    pub fn column(&self, label: &str) -> Option<Vec<f32>> {
        let col = self.columns.iter().position(|c| c == label)?;
        Some(self.rows.iter().map(|row| row[col]).collect())
    }

    pub fn get(&self, row: usize, label: &str) -> Option<f32> {
        let col = self.columns.iter().position(|c| c == label)?;
        self.rows.get(row).map(|r| r[col])
    }

    /// Highest-probability label per row. Ties go to the earlier column.
    pub fn predicted_labels(&self) -> Vec<&str> {
        self.rows
            .iter()
            .map(|row| {
                let best = row
                    .iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (idx, &p)| {
                        if p > best.1 {
                            (idx, p)
                        } else {
                            best
                        }
                    })
                    .0;
                self.columns[best].as_str()
            })
            .collect()
    }

    /// One JSON object per row keyed by label, in column order.
    pub fn to_records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let record: Map<String, Value> = self
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(label, &p)| (label.clone(), Value::from(p)))
                    .collect();
                Value::Object(record)
            })
            .collect()
    }
}

impl std::fmt::Display for ProbabilityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let widths: Vec<usize> = self.columns.iter().map(|c| c.len().max(8)).collect();
        write!(f, "{:>5}", "")?;
        for (column, width) in self.columns.iter().zip(&widths) {
            write!(f, " {column:>width$}")?;
        }
        writeln!(f)?;
        for (idx, row) in self.rows.iter().enumerate() {
            write!(f, "{idx:>5}")?;
            for (p, width) in row.iter().zip(&widths) {
                write!(f, " {p:>width$.4}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
