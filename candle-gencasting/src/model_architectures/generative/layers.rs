//! Building blocks shared by every decoder family: RMS normalization, rotary
//! position embeddings and projections that may be quantized and may carry a
//! LoRA adapter.

use crate::model_architectures::lora::{LoRAAdapter, LoRAConfig};
use candle_core::quantized::{GgmlDType, QMatMul, QTensor};
use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};
use std::sync::Arc;

/// RMS normalization computed in F32 from primitive ops, so it stays
/// differentiable for adapter training.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    pub fn load(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        Ok(Self::new(weight, eps))
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let norm_x = (x.sqr()?.mean_keepdim(D::Minus1)? + self.eps)?.sqrt()?;
        x.broadcast_div(&norm_x)?
            .broadcast_mul(&self.weight.to_dtype(DType::F32)?)?
            .to_dtype(x_dtype)
    }
}

/// Llama 3 frequency scaling: long wavelengths are divided by `factor`,
/// short ones are kept, and the band in between is interpolated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Llama3RopeScaling {
    pub factor: f64,
    pub low_freq_factor: f64,
    pub high_freq_factor: f64,
    pub original_max_position_embeddings: usize,
}

impl Llama3RopeScaling {
    fn scale(&self, freq: f64) -> f64 {
        let original = self.original_max_position_embeddings as f64;
        let low_freq_wavelen = original / self.low_freq_factor;
        let high_freq_wavelen = original / self.high_freq_factor;
        let wavelen = 2.0 * std::f64::consts::PI / freq;
        if wavelen < high_freq_wavelen {
            freq
        } else if wavelen > low_freq_wavelen {
            freq / self.factor
        } else {
            let smooth = (original / wavelen - self.low_freq_factor)
                / (self.high_freq_factor - self.low_freq_factor);
            (1.0 - smooth) * freq / self.factor + smooth * freq
        }
    }
}

fn inv_frequencies(head_dim: usize, theta: f64, scaling: Option<&Llama3RopeScaling>) -> Vec<f32> {
    (0..head_dim)
        .step_by(2)
        .map(|i| {
            let freq = 1.0 / theta.powf(i as f64 / head_dim as f64);
            match scaling {
                Some(scaling) => scaling.scale(freq) as f32,
                None => freq as f32,
            }
        })
        .collect()
}

/// Precomputed RoPE tables of shape `[max_seq_len, head_dim / 2]`.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    pub fn new(
        head_dim: usize,
        max_seq_len: usize,
        theta: f64,
        scaling: Option<&Llama3RopeScaling>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let inv_freq = inv_frequencies(head_dim, theta, scaling);
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    /// Rotate `q` and `k` (both `[batch, heads, seq, head_dim]`). The fused
    /// kernel has no backward pass, so training goes through `rope_slow`.
    pub fn apply(&self, q: &Tensor, k: &Tensor, seq_len: usize, train: bool) -> Result<(Tensor, Tensor)> {
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;
        let rope = if train {
            candle_nn::rotary_emb::rope_slow
        } else {
            candle_nn::rotary_emb::rope
        };
        let q = rope(&q.contiguous()?, &cos, &sin)?;
        let k = rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

/// Frozen base weight of a projection.
#[derive(Debug, Clone)]
enum BaseWeight {
    Full(Tensor),
    /// The raw quantized tensor is kept next to the matmul so training can
    /// dequantize it and let gradients flow to earlier adapters.
    Quantized { matmul: QMatMul, raw: Arc<QTensor> },
}

/// A linear projection `y = x W^T (+ b)` with optional quantized storage and
/// an optional LoRA adapter.
#[derive(Debug, Clone)]
pub struct Projection {
    name: String,
    base: BaseWeight,
    bias: Option<Tensor>,
    lora: Option<LoRAAdapter>,
    in_features: usize,
    out_features: usize,
}

impl Projection {
    /// Load `weight` (and `bias` when `with_bias`) from `vb`. When a GGML
    /// dtype is given and the input width is a multiple of its block size the
    /// weight is quantized; otherwise it stays in full precision.
    pub fn load(
        name: &str,
        in_features: usize,
        out_features: usize,
        with_bias: bool,
        quantize: Option<GgmlDType>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_features, in_features),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = if with_bias {
            Some(vb.get_with_hints(out_features, "bias", Init::Const(0.0))?)
        } else {
            None
        };

        let base = match quantize {
            Some(dtype) if in_features % dtype.block_size() == 0 => {
                let raw = Arc::new(QTensor::quantize(&weight.to_dtype(DType::F32)?, dtype)?);
                let matmul = QMatMul::from_arc(raw.clone())?;
                BaseWeight::Quantized { matmul, raw }
            }
            Some(dtype) => {
                tracing::warn!(
                    "{name}: input width {in_features} is not a multiple of the {dtype:?} block size, keeping full precision"
                );
                BaseWeight::Full(weight)
            }
            None => BaseWeight::Full(weight),
        };

        Ok(Self {
            name: name.to_string(),
            base,
            bias,
            lora: None,
            in_features,
            out_features,
        })
    }

    /// Wrap an existing `[out, in]` weight, e.g. a tied embedding matrix.
    pub fn from_weight(name: &str, weight: Tensor) -> Self {
        let (out_features, in_features) = weight.dims2().unwrap_or((0, 0));
        Self {
            name: name.to_string(),
            base: BaseWeight::Full(weight),
            bias: None,
            lora: None,
            in_features,
            out_features,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.base, BaseWeight::Quantized { .. })
    }

    pub fn has_adapter(&self) -> bool {
        self.lora.is_some()
    }

    /// Attach (or replace) the adapter for this projection. `vb` must point at
    /// the projection in the adapter namespace.
    pub fn attach_lora(&mut self, config: &LoRAConfig, vb: VarBuilder) -> crate::core::UnifiedResult<()> {
        self.lora = Some(LoRAAdapter::new(
            self.in_features,
            self.out_features,
            config,
            vb,
        )?);
        Ok(())
    }

    pub fn detach_lora(&mut self) {
        self.lora = None;
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut out = match &self.base {
            BaseWeight::Full(weight) => {
                // The base stays frozen; only adapters receive gradients.
                let weight = if train { weight.detach() } else { weight.clone() };
                let x = x.to_dtype(weight.dtype())?;
                match x.dims() {
                    [b1, b2, _, _] => x.matmul(&weight.broadcast_left((*b1, *b2))?.t()?)?,
                    [b, _, _] => x.matmul(&weight.broadcast_left(*b)?.t()?)?,
                    _ => x.matmul(&weight.t()?)?,
                }
            }
            BaseWeight::Quantized { raw, .. } if train => {
                let weight = raw.dequantize(x.device())?;
                x.to_dtype(DType::F32)?.broadcast_matmul(&weight.t()?)?
            }
            BaseWeight::Quantized { matmul, .. } => matmul.forward(&x.to_dtype(DType::F32)?)?,
        };
        if let Some(bias) = &self.bias {
            out = out.broadcast_add(&bias.to_dtype(out.dtype())?)?;
        }
        if let Some(lora) = &self.lora {
            out = (&out + lora.forward(x, train)?.to_dtype(out.dtype())?)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn test_llama3_scaling_keeps_short_and_stretches_long_wavelengths() {
        let scaling = Llama3RopeScaling {
            factor: 8.0,
            low_freq_factor: 1.0,
            high_freq_factor: 4.0,
            original_max_position_embeddings: 64,
        };
        // Wavelengths 2pi, 20pi, 200pi and 2000pi against the band [16, 64].
        let plain = inv_frequencies(8, 10_000.0, None);
        let scaled = inv_frequencies(8, 10_000.0, Some(&scaling));
        assert_eq!(scaled[0], plain[0]);
        assert!(scaled[1] < plain[1] && scaled[1] > plain[1] / 8.0);
        assert!((scaled[2] - plain[2] / 8.0).abs() < 1e-9);
        assert!((scaled[3] - plain[3] / 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_rms_norm_unit_weight() {
        let device = Device::Cpu;
        let norm = RmsNorm::new(Tensor::ones(4, DType::F32, &device).unwrap(), 1e-6);
        let x = Tensor::new(&[[1f32, 1., 1., 1.], [2., 2., 2., 2.]], &device).unwrap();
        let y = norm.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        for row in y {
            for v in row {
                assert!((v - 1.0).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn test_rope_paths_agree() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(8, 16, 10_000.0, None, DType::F32, &device).unwrap();
        let q = Tensor::randn(0f32, 1.0, (1, 2, 5, 8), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (1, 2, 5, 8), &device).unwrap();
        let (fast_q, _) = rope.apply(&q, &k, 5, false).unwrap();
        let (slow_q, _) = rope.apply(&q, &k, 5, true).unwrap();
        let diff = (fast_q - slow_q)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4);
    }

    #[test]
    fn test_projection_shapes_and_bias() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let proj = Projection::load("q_proj", 8, 4, true, None, vb.pp("q_proj")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 8), &device).unwrap();
        assert_eq!(proj.forward(&x, false).unwrap().dims(), &[2, 3, 4]);
        assert!(!proj.is_quantized());
    }

    #[test]
    fn test_quantized_projection_close_to_full() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let full = Projection::load("up_proj", 64, 8, false, None, vb.pp("up_proj")).unwrap();
        let quant =
            Projection::load("up_proj", 64, 8, false, Some(GgmlDType::Q8_0), vb.pp("up_proj")).unwrap();
        assert!(quant.is_quantized());

        let x = Tensor::randn(0f32, 1.0, (2, 64), &device).unwrap();
        let a = full.forward(&x, false).unwrap();
        let b = quant.forward(&x, false).unwrap();
        let scale = a.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff <= 0.05 * scale.max(1.0));
    }

    #[test]
    fn test_unaligned_width_stays_full_precision() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let proj =
            Projection::load("o_proj", 12, 8, false, Some(GgmlDType::Q4_0), vb.pp("o_proj")).unwrap();
        assert!(!proj.is_quantized());
    }
}
