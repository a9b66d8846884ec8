//! Unified error type for the crate.
//!
//! Every public operation returns [`UnifiedResult`]. Failures are grouped the
//! way callers need to react to them:
//!
//! - [`UnifiedError::Configuration`]: the model or tokenizer could not be loaded
//! - [`UnifiedError::Precondition`]: an operation needs a loaded model
//! - [`UnifiedError::Validation`]: the caller passed malformed input
//! - [`UnifiedError::Model`] / [`UnifiedError::Processing`]: a tensor operation
//!   failed inside the forward pass or the training loop

use thiserror::Error;

/// Result alias used across the crate.
pub type UnifiedResult<T> = Result<T, UnifiedError>;

/// Why a configuration step failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigErrorType {
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Which part of the network raised a model error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorType {
    LmHead,
    LoRA,
}

impl std::fmt::Display for ModelErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::LmHead => "lm_head",
            Self::LoRA => "lora",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum UnifiedError {
    #[error("configuration error during {operation}: {source}{}", fmt_context(.context))]
    Configuration {
        operation: String,
        source: ConfigErrorType,
        context: Option<String>,
    },

    #[error("precondition failed for {operation}: {reason}")]
    Precondition { operation: String, reason: String },

    #[error("validation failed for {field}: expected {expected}, got {actual}{}", fmt_context(.context))]
    Validation {
        field: String,
        expected: String,
        actual: String,
        context: Option<String>,
    },

    #[error("{model_type} error during {operation}: {cause}{}", fmt_context(.context))]
    Model {
        model_type: ModelErrorType,
        operation: String,
        cause: String,
        context: Option<String>,
    },

    #[error("processing error during {operation}: {cause}{}", fmt_context(.input_context))]
    Processing {
        operation: String,
        cause: String,
        input_context: Option<String>,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn fmt_context(context: &Option<String>) -> String {
    match context {
        Some(ctx) => format!(" ({ctx})"),
        None => String::new(),
    }
}

impl UnifiedError {
    pub fn configuration(
        operation: impl Into<String>,
        source: ConfigErrorType,
        context: Option<String>,
    ) -> Self {
        Self::Configuration {
            operation: operation.into(),
            source,
            context,
        }
    }

    pub fn precondition(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Precondition {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Validation {
            field: field.into(),
            expected: expected.into(),
            actual: actual.into(),
            context: None,
        }
    }

    /// Attach free-form context to variants that carry it.
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        match &mut self {
            Self::Configuration { context, .. }
            | Self::Validation { context, .. }
            | Self::Model { context, .. } => *context = Some(ctx.into()),
            Self::Processing { input_context, .. } => *input_context = Some(ctx.into()),
            _ => {}
        }
        self
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

/// Build a `map_err` adapter that wraps a candle failure as a processing error.
pub(crate) fn processing(operation: &str) -> impl FnOnce(candle_core::Error) -> UnifiedError + '_ {
    move |e| UnifiedError::Processing {
        operation: operation.to_string(),
        cause: e.to_string(),
        input_context: None,
    }
}

/// Build a `map_err` adapter that wraps a candle failure as a model error.
pub(crate) fn model_error(
    model_type: ModelErrorType,
    operation: &str,
) -> impl FnOnce(candle_core::Error) -> UnifiedError + '_ {
    move |e| UnifiedError::Model {
        model_type,
        operation: operation.to_string(),
        cause: e.to_string(),
        context: None,
    }
}
