use rand::{
    SeedableRng,
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
};

use crate::model::GenerationConfig;

#[derive(Debug, Clone, Copy)]
enum Strategy {
    Greedy,
    Sample {
        temperature: f32,
        top_k: usize,
        top_p: f32,
    },
}

pub struct LogitsProcessor {
    strategy: Strategy,
    repetition_penalty: f32,
    rng: StdRng,
}

impl LogitsProcessor {
    pub fn new(config: &GenerationConfig) -> Self {
        let strategy = if config.do_sample && config.temperature > 0.0 {
            Strategy::Sample {
                temperature: config.temperature as f32,
                top_k: config.top_k,
                top_p: config.top_p as f32,
            }
        } else {
            Strategy::Greedy
        };
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            strategy,
            repetition_penalty: config.repetition_penalty as f32,
            rng,
        }
    }

    pub fn is_sampling(&self) -> bool {
        matches!(self.strategy, Strategy::Sample { .. })
    }

    pub fn penalize(&self, scores: &mut [f32], history: &[i64]) {
        apply_repetition_penalty(scores, history, self.repetition_penalty);
    }

    // penalty first, then warping; greedy skips the warp entirely
    pub fn sample(&mut self, logits: &mut [f32], history: &[i64]) -> u32 {
        self.penalize(logits, history);
        match self.strategy {
            Strategy::Greedy => argmax(logits),
            Strategy::Sample { .. } => {
                self.warp(logits);
                let probs = softmax(logits);
                self.draw(&probs).unwrap_or_else(|| argmax(logits))
            }
        }
    }

    pub fn warp(&self, scores: &mut [f32]) {
        if let Strategy::Sample {
            temperature,
            top_k,
            top_p,
        } = self.strategy
        {
            for s in scores.iter_mut() {
                *s /= temperature;
            }
            top_k_filter(scores, top_k);
            top_p_filter(scores, top_p);
        }
    }

    pub fn draw(&mut self, probs: &[f32]) -> Option<u32> {
        let dist = WeightedIndex::new(probs).ok()?;
        Some(dist.sample(&mut self.rng) as u32)
    }

    pub fn draw_distinct(&mut self, probs: &[f32], n: usize) -> Vec<u32> {
        let mut weights = probs.to_vec();
        let mut picked = Vec::with_capacity(n);
        while picked.len() < n {
            let Some(token) = WeightedIndex::new(&weights)
                .ok()
                .map(|dist| dist.sample(&mut self.rng))
            else {
                break;
            };
            weights[token] = 0.0;
            picked.push(token as u32);
        }
        picked
    }
}

/// CTRL-style penalty: positive scores of seen tokens are divided by the
/// penalty, negative ones multiplied.
pub fn apply_repetition_penalty(scores: &mut [f32], history: &[i64], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let mut seen = history.to_vec();
    seen.sort_unstable();
    seen.dedup();
    for token in seen {
        let Some(score) = usize::try_from(token).ok().and_then(|t| scores.get_mut(t)) else {
            continue;
        };
        if *score > 0.0 {
            *score /= penalty;
        } else {
            *score *= penalty;
        }
    }
}

pub fn argmax(scores: &[f32]) -> u32 {
    let mut best_idx = 0u32;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in scores.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best_idx = i as u32;
        }
    }
    best_idx
}

pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return vec![0.0; scores.len()];
    }
    let exps: Vec<f32> = scores.iter().map(|&s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

pub fn log_softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = scores.iter().map(|&s| (s - max).exp()).sum();
    let log_sum = max + sum.ln();
    scores.iter().map(|&s| s - log_sum).collect()
}

pub fn top_indices(scores: &[f32], k: usize) -> Vec<u32> {
    let mut order: Vec<u32> = (0..scores.len() as u32).collect();
    order.sort_by(|&a, &b| scores[b as usize].total_cmp(&scores[a as usize]));
    order.truncate(k);
    order
}

fn top_k_filter(scores: &mut [f32], top_k: usize) {
    if top_k == 0 || top_k >= scores.len() {
        return;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let threshold = sorted[top_k - 1];
    for s in scores.iter_mut() {
        if *s < threshold {
            *s = f32::NEG_INFINITY;
        }
    }
}

// the most likely token always survives
fn top_p_filter(scores: &mut [f32], top_p: f32) {
    if top_p >= 1.0 {
        return;
    }
    let probs = softmax(scores);
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut cumulative = 0.0f32;
    let mut keep = order.len();
    for (rank, &idx) in order.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative >= top_p {
            keep = rank + 1;
            break;
        }
    }
    for &idx in &order[keep.max(1)..] {
        scores[idx] = f32::NEG_INFINITY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampling_config(top_k: usize, top_p: f64) -> GenerationConfig {
        GenerationConfig {
            temperature: 1.0,
            top_k,
            top_p,
            do_sample: true,
            repetition_penalty: 1.0,
            seed: Some(7),
            ..GenerationConfig::default()
        }
    }

    #[test]
    fn greedy_ignores_sampling_parameters() {
        let config = GenerationConfig {
            do_sample: false,
            repetition_penalty: 1.0,
            ..GenerationConfig::default()
        };
        let mut processor = LogitsProcessor::new(&config);
        assert!(!processor.is_sampling());
        let mut logits = vec![1.0, 5.0, 2.0, 3.0];
        assert_eq!(processor.sample(&mut logits, &[]), 1);
    }

    #[test]
    fn zero_temperature_falls_back_to_greedy() {
        let config = GenerationConfig {
            temperature: 0.0,
            do_sample: true,
            ..GenerationConfig::default()
        };
        assert!(!LogitsProcessor::new(&config).is_sampling());
    }

    #[test]
    fn top_k_one_always_picks_the_best() {
        let mut processor = LogitsProcessor::new(&sampling_config(1, 1.0));
        for _ in 0..50 {
            let mut logits = vec![1.0, 10.0, 9.5, 3.0];
            assert_eq!(processor.sample(&mut logits, &[]), 1);
        }
    }

    #[test]
    fn tiny_top_p_keeps_only_the_mode() {
        let mut processor = LogitsProcessor::new(&sampling_config(0, 0.01));
        for _ in 0..50 {
            let mut logits = vec![0.0, 4.0, 3.9, 0.0];
            assert_eq!(processor.sample(&mut logits, &[]), 1);
        }
    }

    #[test]
    fn same_seed_same_draws() {
        let config = sampling_config(0, 1.0);
        let mut a = LogitsProcessor::new(&config);
        let mut b = LogitsProcessor::new(&config);
        for _ in 0..20 {
            let mut la = vec![1.0, 1.2, 0.8, 1.1];
            let mut lb = la.clone();
            assert_eq!(a.sample(&mut la, &[]), b.sample(&mut lb, &[]));
        }
    }

    #[test]
    fn repetition_penalty_handles_both_signs() {
        let mut scores = vec![2.0, -2.0, 2.0];
        apply_repetition_penalty(&mut scores, &[0, 1, 1, 99, -1], 2.0);
        assert_eq!(scores, vec![1.0, -4.0, 2.0]);
    }

    #[test]
    fn repetition_penalty_can_flip_greedy_choice() {
        let config = GenerationConfig {
            do_sample: false,
            repetition_penalty: 2.0,
            ..GenerationConfig::default()
        };
        let mut processor = LogitsProcessor::new(&config);
        let mut logits = vec![3.0, 2.0];
        assert_eq!(processor.sample(&mut logits, &[0]), 1);
    }

    #[test]
    fn softmax_and_log_softmax_agree() {
        let scores = [0.5f32, 1.5, -0.5];
        let probs = softmax(&scores);
        let logs = log_softmax(&scores);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        for (p, l) in probs.iter().zip(&logs) {
            assert!((p.ln() - l).abs() < 1e-5);
        }
    }

    #[test]
    fn distinct_draws_never_repeat() {
        let mut processor = LogitsProcessor::new(&sampling_config(0, 1.0));
        let picked = processor.draw_distinct(&[0.25, 0.25, 0.0, 0.5], 4);
        assert_eq!(picked.len(), 3);
        let mut sorted = picked.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 3]);
    }

    #[test]
    fn top_indices_orders_best_first() {
        assert_eq!(top_indices(&[0.1, 0.7, 0.3, 0.9], 2), vec![3, 1]);
    }
}
