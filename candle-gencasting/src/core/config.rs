//! Loading options shared by the forecaster and the model loader.

use crate::core::{ConfigErrorType, UnifiedError, UnifiedResult};
use candle_core::quantized::GgmlDType;
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Where the model weights live and where inputs are sent.
///
/// Resolved once when the model is loaded; every extraction call reuses the
/// resolved device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// CUDA if available, then Metal, then CPU.
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DevicePreference {
    pub fn resolve(&self) -> UnifiedResult<Device> {
        let device = match *self {
            Self::Cpu => Device::Cpu,
            Self::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|e| {
                UnifiedError::configuration(
                    "select device",
                    ConfigErrorType::Unsupported(format!("cuda:{ordinal}")),
                    Some(e.to_string()),
                )
            })?,
            Self::Metal(ordinal) => Device::new_metal(ordinal).map_err(|e| {
                UnifiedError::configuration(
                    "select device",
                    ConfigErrorType::Unsupported(format!("metal:{ordinal}")),
                    Some(e.to_string()),
                )
            })?,
            Self::Auto => {
                if candle_core::utils::cuda_is_available() {
                    Device::new_cuda(0).unwrap_or(Device::Cpu)
                } else if candle_core::utils::metal_is_available() {
                    Device::new_metal(0).unwrap_or(Device::Cpu)
                } else {
                    Device::Cpu
                }
            }
        };
        Ok(device)
    }
}

impl FromStr for DevicePreference {
    type Err = UnifiedError;

    /// Accepts `auto`, `cpu`, `cuda`, `cuda:N`, `metal`, `metal:N`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match lowered.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal.parse::<usize>().map_err(|_| {
                    UnifiedError::validation("device", "an ordinal after ':'", s)
                })?;
                (kind.to_string(), ordinal)
            }
            None => (lowered.clone(), 0),
        };
        match kind.as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(ordinal)),
            "metal" => Ok(Self::Metal(ordinal)),
            _ => Err(UnifiedError::validation(
                "device",
                "one of auto, cpu, cuda[:N], metal[:N]",
                s,
            )),
        }
    }
}

/// Weight quantization applied to the decoder projections at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuantizationMode {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "8bit")]
    Int8,
    #[serde(rename = "4bit")]
    Int4,
}

impl QuantizationMode {
    /// `"8bit"` and `"4bit"` select a quantized load; anything else means none.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "8bit" | "8-bit" | "int8" => Self::Int8,
            "4bit" | "4-bit" | "int4" => Self::Int4,
            _ => Self::None,
        }
    }

    /// GGML block format used for the quantized weights.
    pub fn ggml_dtype(&self) -> Option<GgmlDType> {
        match self {
            Self::None => None,
            Self::Int8 => Some(GgmlDType::Q8_0),
            Self::Int4 => Some(GgmlDType::Q4_0),
        }
    }

    pub fn is_quantized(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Everything needed to load a forecaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecasterConfig {
    /// Local model directory or hub repository id.
    pub model_id: String,
    /// Hub revision; ignored for local directories.
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub quantization: QuantizationMode,
    #[serde(default)]
    pub device: DevicePreference,
    /// When false the forecaster is created unloaded and `load_model` must be
    /// called before any model-dependent operation.
    #[serde(default = "default_load_model")]
    pub load_model: bool,
}

fn default_load_model() -> bool {
    true
}

impl ForecasterConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            revision: None,
            quantization: QuantizationMode::None,
            device: DevicePreference::Auto,
            load_model: true,
        }
    }

    pub fn with_quantization(mut self, quantization: QuantizationMode) -> Self {
        self.quantization = quantization;
        self
    }

    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.device = device;
        self
    }

    pub fn deferred(mut self) -> Self {
        self.load_model = false;
        self
    }
}
