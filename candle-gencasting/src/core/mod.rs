//! Errors and loading configuration.

pub mod config;
pub mod unified_error;

pub use config::{DevicePreference, ForecasterConfig, QuantizationMode};
pub use unified_error::{ConfigErrorType, ModelErrorType, UnifiedError, UnifiedResult};
pub(crate) use unified_error::{model_error, processing};
