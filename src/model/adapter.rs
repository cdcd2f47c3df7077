use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
};

use serde::Deserialize;
use tch::{Device, Tensor, no_grad};

use crate::error::ServiceError;

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

#[derive(Debug, Clone, Deserialize)]
struct AdapterConfig {
    r: usize,
    lora_alpha: f64,
    #[serde(default)]
    fan_in_fan_out: bool,
    #[serde(default)]
    target_modules: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Factor {
    A,
    B,
}

#[derive(Default)]
struct LowRankPair {
    a: Option<Tensor>,
    b: Option<Tensor>,
}

#[derive(Debug, Default)]
pub struct LoraMergeSummary {
    pub merged: usize,
    pub replaced: usize,
}

/// Low-rank adapter weights read from a PEFT-style directory.
pub struct LoraAdapter {
    scaling: f64,
    fan_in_fan_out: bool,
    pairs: BTreeMap<String, LowRankPair>,
    replacements: BTreeMap<String, Tensor>,
}

impl LoraAdapter {
    pub fn load(dir: &Path, device: Device) -> Result<Self, ServiceError> {
        let raw = fs::read_to_string(dir.join(ADAPTER_CONFIG_FILE))?;
        let config: AdapterConfig = serde_json::from_str(&raw)
            .map_err(|e| ServiceError::Adapter(format!("invalid {ADAPTER_CONFIG_FILE}: {e}")))?;
        if config.r == 0 {
            return Err(ServiceError::Adapter("adapter rank must be positive".into()));
        }

        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        if !weights_path.exists() {
            return Err(ServiceError::Adapter(format!(
                "adapter weights missing: {}",
                weights_path.display()
            )));
        }
        let tensors = Tensor::read_safetensors(&weights_path)
            .map_err(|e| ServiceError::Adapter(e.to_string()))?;

        tracing::info!(
            rank = config.r,
            alpha = config.lora_alpha,
            targets = ?config.target_modules,
            tensors = tensors.len(),
            "loaded LoRA adapter"
        );

        let mut adapter = Self {
            scaling: config.lora_alpha / config.r as f64,
            fan_in_fan_out: config.fan_in_fan_out,
            pairs: BTreeMap::new(),
            replacements: BTreeMap::new(),
        };
        for (key, tensor) in tensors {
            adapter.insert(&key, tensor.to_device(device));
        }
        Ok(adapter)
    }

    fn insert(&mut self, key: &str, tensor: Tensor) {
        match lora_target(key) {
            Some((target, factor)) => {
                let pair = self.pairs.entry(target).or_default();
                match factor {
                    Factor::A => pair.a = Some(tensor),
                    Factor::B => pair.b = Some(tensor),
                }
            }
            None => {
                self.replacements.insert(strip_peft_prefix(key).to_string(), tensor);
            }
        }
    }

    /// Folds `scaling * B @ A` into the matching base weights and copies
    /// fully saved modules over their base counterparts.
    pub fn merge_into(
        &self,
        parameters: &[(String, Tensor)],
    ) -> Result<LoraMergeSummary, ServiceError> {
        let by_name: HashMap<&str, &Tensor> = parameters
            .iter()
            .map(|(name, tensor)| (name.as_str(), tensor))
            .collect();
        let mut summary = LoraMergeSummary::default();

        no_grad(|| {
            for (target, pair) in &self.pairs {
                let (Some(a), Some(b)) = (&pair.a, &pair.b) else {
                    return Err(ServiceError::Adapter(format!(
                        "incomplete low-rank pair for {target}"
                    )));
                };
                let weight = lookup(&by_name, target)?;
                let mut delta = b.matmul(a) * self.scaling;
                if self.fan_in_fan_out {
                    delta = delta.transpose(0, 1);
                }
                if delta.size() != weight.size() {
                    return Err(ServiceError::Adapter(format!(
                        "{target}: delta shape {:?} does not match weight {:?}",
                        delta.size(),
                        weight.size()
                    )));
                }
                let mut weight = weight.shallow_clone();
                weight
                    .f_add_(&delta.to_kind(weight.kind()))
                    .map_err(|e| ServiceError::Adapter(format!("{target}: {e}")))?;
                summary.merged += 1;
            }

            for (target, replacement) in &self.replacements {
                let weight = lookup(&by_name, target)?;
                if replacement.size() != weight.size() {
                    return Err(ServiceError::Adapter(format!(
                        "{target}: saved module shape {:?} does not match base {:?}",
                        replacement.size(),
                        weight.size()
                    )));
                }
                let mut weight = weight.shallow_clone();
                weight
                    .f_copy_(&replacement.to_kind(weight.kind()))
                    .map_err(|e| ServiceError::Adapter(format!("{target}: {e}")))?;
                summary.replaced += 1;
            }
            Ok(())
        })?;

        Ok(summary)
    }
}

fn lookup<'a>(by_name: &HashMap<&str, &'a Tensor>, target: &str) -> Result<&'a Tensor, ServiceError> {
    by_name
        .get(target)
        .copied()
        .ok_or_else(|| ServiceError::Adapter(format!("base model has no parameter {target}")))
}

fn strip_peft_prefix(key: &str) -> &str {
    key.strip_prefix("base_model.model.").unwrap_or(key)
}

/// Maps `base_model.model.<module>.lora_A[.<adapter>].weight` to
/// `<module>.weight`.
fn lora_target(key: &str) -> Option<(String, Factor)> {
    let key = strip_peft_prefix(key);
    let (module, factor) = if let Some((module, _)) = key.split_once(".lora_A") {
        (module, Factor::A)
    } else if let Some((module, _)) = key.split_once(".lora_B") {
        (module, Factor::B)
    } else {
        return None;
    };
    Some((format!("{module}.weight"), factor))
}
