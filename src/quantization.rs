use tch::{Kind, Tensor, no_grad};

use crate::error::{ConfigError, ServiceError};

/// Weight precision requested at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizationMode {
    None,
    Int8,
    Int4,
}

impl QuantizationMode {
    pub fn from_flags(load_in_8bit: bool, load_in_4bit: bool) -> Result<Self, ConfigError> {
        match (load_in_8bit, load_in_4bit) {
            (true, true) => Err(ConfigError::ConflictingQuantization),
            (true, false) => Ok(QuantizationMode::Int8),
            (false, true) => Ok(QuantizationMode::Int4),
            (false, false) => Ok(QuantizationMode::None),
        }
    }

    pub fn bits(self) -> Option<u8> {
        match self {
            QuantizationMode::None => None,
            QuantizationMode::Int8 => Some(8),
            QuantizationMode::Int4 => Some(4),
        }
    }
}

#[derive(Debug)]
pub struct QuantizationSummary {
    pub mode: QuantizationMode,
    pub quantized_tensors: usize,
    pub quantized_parameters: i64,
    pub max_abs_error: f64,
}

/// Symmetric round-to-nearest quantization with one scale per output row,
/// dequantized back to the tensor's own kind.
pub fn fake_quantize(weight: &Tensor, bits: u8) -> Tensor {
    let qmax = ((1i64 << (bits - 1)) - 1) as f64;
    let w = weight.to_kind(Kind::Float);
    let scale = w.abs().amax([1i64].as_slice(), true).clamp_min(1e-8) / qmax;
    let levels = (&w / &scale).round().clamp(-qmax - 1.0, qmax);
    (levels * &scale).to_kind(weight.kind())
}

/// Linear projections only; embeddings and the output head stay in full precision.
fn is_quantizable(name: &str, weight: &Tensor) -> bool {
    weight.dim() == 2
        && name.ends_with("weight")
        && !name.contains("embed")
        && !name.contains("wte")
        && !name.contains("lm_head")
}

/// Rewrites matching parameters in place.
pub fn quantize_parameters(
    parameters: &[(String, Tensor)],
    mode: QuantizationMode,
) -> Result<QuantizationSummary, ServiceError> {
    let mut summary = QuantizationSummary {
        mode,
        quantized_tensors: 0,
        quantized_parameters: 0,
        max_abs_error: 0.0,
    };
    let Some(bits) = mode.bits() else {
        return Ok(summary);
    };

    no_grad(|| {
        for (name, weight) in parameters {
            if !is_quantizable(name, weight) {
                continue;
            }
            let quantized = fake_quantize(weight, bits);
            let error = (&quantized - weight)
                .abs()
                .max()
                .to_kind(Kind::Double)
                .f_double_value(&[])
                .map_err(|e| ServiceError::Quantization(format!("{name}: {e}")))?;

            let mut target = weight.shallow_clone();
            target
                .f_copy_(&quantized)
                .map_err(|e| ServiceError::Quantization(format!("{name}: {e}")))?;

            summary.quantized_tensors += 1;
            summary.quantized_parameters += weight.numel() as i64;
            summary.max_abs_error = summary.max_abs_error.max(error);
        }
        Ok::<(), ServiceError>(())
    })?;

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_modes() {
        assert_eq!(QuantizationMode::from_flags(false, false).unwrap(), QuantizationMode::None);
        assert_eq!(QuantizationMode::from_flags(true, false).unwrap(), QuantizationMode::Int8);
        assert_eq!(QuantizationMode::from_flags(false, true).unwrap(), QuantizationMode::Int4);
        assert_eq!(
            QuantizationMode::from_flags(true, true).unwrap_err(),
            ConfigError::ConflictingQuantization
        );
    }

    #[test]
    fn int8_error_is_bounded_by_half_a_step() {
        let weight = Tensor::from_slice(&[0.5f32, -1.0, 0.25, 0.9, -0.3, 0.01]).reshape([2, 3]);
        let quantized = fake_quantize(&weight, 8);
        let err = (&quantized - &weight).abs().max().double_value(&[]);
        // row scales are 1/127 and 0.9/127
        assert!(err <= 0.5 / 127.0 + 1e-6, "error {err}");
        assert_eq!(quantized.size(), vec![2, 3]);
    }

    #[test]
    fn int4_keeps_row_maximum_exact() {
        let weight = Tensor::from_slice(&[0.7f32, -0.2, 0.1, 0.05]).reshape([1, 4]);
        let quantized = fake_quantize(&weight, 4);
        let first = quantized.double_value(&[0, 0]);
        assert!((first - 0.7).abs() < 1e-6);
    }

    #[test]
    fn embeddings_and_head_are_skipped() {
        let params = vec![
            ("model.embed_tokens.weight".to_string(), Tensor::ones([4, 2], (Kind::Float, tch::Device::Cpu)) * 0.33),
            ("lm_head.weight".to_string(), Tensor::ones([4, 2], (Kind::Float, tch::Device::Cpu)) * 0.33),
            ("model.layers.0.mlp.up_proj.weight".to_string(), Tensor::from_slice(&[0.3f32, 0.11, -0.2, 0.05]).reshape([2, 2])),
            ("model.norm.bias".to_string(), Tensor::ones([2], (Kind::Float, tch::Device::Cpu))),
        ];
        let summary = quantize_parameters(&params, QuantizationMode::Int4).unwrap();
        assert_eq!(summary.quantized_tensors, 1);
        assert_eq!(summary.quantized_parameters, 4);
        assert!(summary.max_abs_error > 0.0);
    }

    #[test]
    fn none_mode_leaves_parameters_alone() {
        let params = vec![("layer.weight".to_string(), Tensor::ones([2, 2], (Kind::Float, tch::Device::Cpu)))];
        let summary = quantize_parameters(&params, QuantizationMode::None).unwrap();
        assert_eq!(summary.quantized_tensors, 0);
    }
}
