//! Class-probability extraction.

pub mod class_tokens;
pub mod forecaster;
pub mod probability_table;

pub use class_tokens::{ClassTokenMap, ClassTokens};
pub use forecaster::{ExtractionInput, GenerativeForecaster};
pub use probability_table::ProbabilityTable;
