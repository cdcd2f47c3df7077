//! Sentence embeddings from the last hidden layer.

use tch::{Device, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;

use crate::{error::ServiceError, model::CausalLanguageModel};

const NORM_EPSILON: f64 = 1e-12;

/// Averages `hidden` (`[b, s, h]`) over positions where `mask` (`[b, s]`) is set.
pub fn mean_pool(hidden: &Tensor, mask: &Tensor) -> Tensor {
    let mask = mask
        .unsqueeze(-1)
        .expand_as(hidden)
        .to_kind(hidden.kind());
    let summed = (hidden * &mask).sum_dim_intlist([1i64].as_slice(), false, hidden.kind());
    let counts = mask
        .sum_dim_intlist([1i64].as_slice(), false, hidden.kind())
        .clamp_min(1e-9);
    summed / counts
}

/// Row-wise L2 normalization with a floor on the norm.
pub fn l2_normalize(vectors: &Tensor) -> Tensor {
    let norms = vectors
        .square()
        .sum_dim_intlist([-1i64].as_slice(), true, vectors.kind())
        .sqrt()
        .clamp_min(NORM_EPSILON);
    vectors / norms
}

/// One unit-norm vector per input, plus the number of non-padding tokens
/// consumed. `tokenizer` must pad batches.
pub fn embed(
    model: &dyn CausalLanguageModel,
    tokenizer: &Tokenizer,
    inputs: &[String],
) -> Result<(Vec<Vec<f32>>, usize), ServiceError> {
    if inputs.is_empty() {
        return Err(ServiceError::BadRequest("input must not be empty".into()));
    }
    let encodings = tokenizer
        .encode_batch(inputs.to_vec(), true)
        .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;

    let batch = encodings.len() as i64;
    let seq_len = encodings.first().map_or(0, |e| e.get_ids().len()) as i64;
    if seq_len == 0 {
        return Err(ServiceError::BadRequest("input produced no tokens".into()));
    }
    let ids: Vec<i64> = encodings
        .iter()
        .flat_map(|e| e.get_ids().iter().map(|&id| id as i64))
        .collect();
    let mask: Vec<i64> = encodings
        .iter()
        .flat_map(|e| e.get_attention_mask().iter().map(|&m| m as i64))
        .collect();
    let prompt_tokens = mask.iter().filter(|&&m| m != 0).count();

    let device = model.device();
    let input_ids = Tensor::from_slice(&ids).reshape([batch, seq_len]).to(device);
    let attention_mask = Tensor::from_slice(&mask).reshape([batch, seq_len]).to(device);

    let pooled = no_grad(|| -> Result<Tensor, ServiceError> {
        let output = model.forward(&input_ids, &attention_mask)?;
        let hidden = output.hidden_states.ok_or_else(|| {
            ServiceError::Inference("model does not expose hidden states".into())
        })?;
        let hidden = hidden.to_kind(Kind::Float);
        Ok(l2_normalize(&mean_pool(&hidden, &attention_mask)))
    })?
    .to_device(Device::Cpu);

    let vectors = (0..batch)
        .map(|row| Vec::<f32>::try_from(pooled.get(row)).map_err(ServiceError::from))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((vectors, prompt_tokens))
}
