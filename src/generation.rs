use tch::{Device, Kind, Tensor, no_grad};

use crate::{
    error::ServiceError,
    model::{CausalLanguageModel, FinishReason, GenerationConfig},
    sampling::{LogitsProcessor, log_softmax, softmax, top_indices},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    pub tokens: Vec<u32>,
    pub finish_reason: FinishReason,
}

/// `on_token` returning `Ok(false)` stops decoding. Beam search never calls it.
pub fn generate<F>(
    model: &dyn CausalLanguageModel,
    prompt: &[u32],
    config: &GenerationConfig,
    eos_token_ids: &[u32],
    on_token: F,
) -> Result<Generated, ServiceError>
where
    F: FnMut(u32) -> Result<bool, ServiceError>,
{
    if config.num_beams > 1 {
        beam_search(model, prompt, config, eos_token_ids)
    } else {
        sample_loop(model, prompt, config, eos_token_ids, on_token)
    }
}

fn sample_loop<F>(
    model: &dyn CausalLanguageModel,
    prompt: &[u32],
    config: &GenerationConfig,
    eos_token_ids: &[u32],
    mut on_token: F,
) -> Result<Generated, ServiceError>
where
    F: FnMut(u32) -> Result<bool, ServiceError>,
{
    let mut processor = LogitsProcessor::new(config);
    let mut sequence: Vec<i64> = prompt.iter().map(|&id| id as i64).collect();
    let mut tokens = Vec::with_capacity(config.max_new_tokens);

    for _ in 0..config.max_new_tokens {
        let mut logits = next_token_logits(model, std::slice::from_ref(&sequence))?
            .pop()
            .ok_or_else(|| ServiceError::Inference("model returned an empty batch".into()))?;
        let token = processor.sample(&mut logits, &sequence);

        if eos_token_ids.contains(&token) {
            return Ok(Generated {
                tokens,
                finish_reason: FinishReason::Stop,
            });
        }

        tokens.push(token);
        sequence.push(token as i64);

        if !on_token(token)? {
            tracing::debug!(generated = tokens.len(), "consumer closed, stopping decode");
            return Ok(Generated {
                tokens,
                finish_reason: FinishReason::Stop,
            });
        }
    }

    Ok(Generated {
        tokens,
        finish_reason: FinishReason::Length,
    })
}

struct Beam {
    sequence: Vec<i64>,
    score: f64,
}

struct Hypothesis {
    tokens: Vec<u32>,
    score: f64,
    finish_reason: FinishReason,
}

fn beam_search(
    model: &dyn CausalLanguageModel,
    prompt: &[u32],
    config: &GenerationConfig,
    eos_token_ids: &[u32],
) -> Result<Generated, ServiceError> {
    let num_beams = config.num_beams;
    let prompt_len = prompt.len();
    let mut processor = LogitsProcessor::new(config);
    let mut beams = vec![Beam {
        sequence: prompt.iter().map(|&id| id as i64).collect(),
        score: 0.0,
    }];
    let mut finished: Vec<Hypothesis> = Vec::new();

    for step in 0..config.max_new_tokens {
        let sequences: Vec<Vec<i64>> = beams.iter().map(|b| b.sequence.clone()).collect();
        let batch_logits = next_token_logits(model, &sequences)?;

        // (cumulative score, beam index, token)
        let mut candidates: Vec<(f64, usize, u32)> = Vec::new();
        for (beam_idx, (beam, logits)) in beams.iter().zip(batch_logits).enumerate() {
            let mut scores = log_softmax(&logits);
            processor.penalize(&mut scores, &beam.sequence);

            let picks = if processor.is_sampling() {
                let mut warped = scores.clone();
                processor.warp(&mut warped);
                let probs = softmax(&warped);
                processor.draw_distinct(&probs, 2 * num_beams)
            } else {
                top_indices(&scores, 2 * num_beams)
            };
            candidates.extend(
                picks
                    .into_iter()
                    .map(|token| (beam.score + scores[token as usize] as f64, beam_idx, token)),
            );
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let generated_len = step + 1;
        let mut next_beams = Vec::with_capacity(num_beams);
        for (rank, &(score, beam_idx, token)) in candidates.iter().enumerate() {
            let beam = &beams[beam_idx];
            if eos_token_ids.contains(&token) {
                if rank < num_beams {
                    finished.push(Hypothesis {
                        tokens: generated_ids(&beam.sequence, prompt_len),
                        score: score / generated_len as f64,
                        finish_reason: FinishReason::Stop,
                    });
                }
                continue;
            }
            let mut sequence = beam.sequence.clone();
            sequence.push(token as i64);
            next_beams.push(Beam { sequence, score });
            if next_beams.len() == num_beams {
                break;
            }
        }

        beams = next_beams;
        if beams.is_empty() || is_done(&finished, &beams, num_beams, generated_len) {
            break;
        }
    }

    for beam in &beams {
        let tokens = generated_ids(&beam.sequence, prompt_len);
        let len = tokens.len().max(1);
        finished.push(Hypothesis {
            tokens,
            score: beam.score / len as f64,
            finish_reason: FinishReason::Length,
        });
    }

    let best = finished
        .into_iter()
        .max_by(|a, b| a.score.total_cmp(&b.score))
        .ok_or_else(|| ServiceError::Inference("beam search produced no hypotheses".into()))?;

    Ok(Generated {
        tokens: best.tokens,
        finish_reason: best.finish_reason,
    })
}

fn is_done(finished: &[Hypothesis], beams: &[Beam], num_beams: usize, generated_len: usize) -> bool {
    if finished.len() < num_beams {
        return false;
    }
    let mut scores: Vec<f64> = finished.iter().map(|h| h.score).collect();
    scores.sort_by(|a, b| b.total_cmp(a));
    let worst_kept = scores[num_beams - 1];
    let best_running = beams
        .iter()
        .map(|b| b.score / generated_len as f64)
        .fold(f64::NEG_INFINITY, f64::max);
    best_running <= worst_kept
}

fn generated_ids(sequence: &[i64], prompt_len: usize) -> Vec<u32> {
    sequence[prompt_len..].iter().map(|&id| id as u32).collect()
}

// no KV cache in the exported graph: every step re-runs the full sequence
pub(crate) fn next_token_logits(
    model: &dyn CausalLanguageModel,
    sequences: &[Vec<i64>],
) -> Result<Vec<Vec<f32>>, ServiceError> {
    let batch = sequences.len() as i64;
    let seq_len = sequences.first().map_or(0, Vec::len) as i64;
    let flat: Vec<i64> = sequences.concat();

    let input_ids = Tensor::from_slice(&flat)
        .reshape([batch, seq_len])
        .to(model.device());
    let attention_mask = input_ids.ones_like();

    let output = no_grad(|| model.forward(&input_ids, &attention_mask))?;
    let last = output
        .logits
        .f_select(1, -1)?
        .f_to_kind(Kind::Float)?
        .to_device(Device::Cpu);

    (0..batch)
        .map(|row| Vec::<f32>::try_from(last.get(row)).map_err(ServiceError::from))
        .collect()
}
