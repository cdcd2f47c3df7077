use std::path::Path;

use tch::{CModule, Device, IValue, Kind, Tensor};
use tokenizers::{PaddingParams, Tokenizer};

use crate::{
    config::{AppConfig, RopeAlpha, compute_kind},
    error::ServiceError,
    model::{CausalLanguageModel, LoraAdapter, ModelMetadata, ModelOutput},
    prompt::PromptFormatter,
    quantization::quantize_parameters,
};

const FALLBACK_EOS_TOKENS: [&str; 4] = ["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>"];

/// Everything loaded once at startup.
pub struct ModelArtifacts {
    pub model: Box<dyn CausalLanguageModel>,
    pub tokenizer: Tokenizer,
    pub formatter: PromptFormatter,
    pub metadata: ModelMetadata,
}

/// A TorchScript export taking `(input_ids, attention_mask)`.
pub struct TorchScriptModel {
    module: CModule,
    device: Device,
}

impl ModelArtifacts {
    pub fn load(config: &AppConfig) -> Result<Self, ServiceError> {
        let device = config.device();
        let kind = compute_kind(device);
        log_graph_options(config);

        let tokenizer = Tokenizer::from_file(config.tokenizer_path.as_path())
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let tokenizer_dir = config
            .tokenizer_path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        let formatter = PromptFormatter::from_dir(tokenizer_dir)?;

        let model = TorchScriptModel::load(&config.base_model_path, device, kind)?;
        let parameters = model
            .module
            .named_parameters()
            .map_err(|e| ServiceError::Inference(e.to_string()))?;

        let tokenizer_vocab = tokenizer.get_vocab_size(true);
        let model_vocab = embedding_rows(&parameters);
        tracing::info!(model_vocab = ?model_vocab, tokenizer_vocab, "vocabulary sizes");
        if model_vocab.is_some_and(|rows| rows != tokenizer_vocab) {
            tracing::warn!("model and tokenizer vocabularies differ; the exported graph cannot be resized");
        }

        if let Some(dir) = config.lora_model_path.as_deref() {
            tracing::info!(path = %dir.display(), "loading LoRA adapter");
            let adapter = LoraAdapter::load(dir, device)?;
            let merged = adapter.merge_into(&parameters)?;
            tracing::info!(merged = merged.merged, replaced = merged.replaced, "adapter merged into base weights");
        }

        let summary = quantize_parameters(&parameters, config.quantization)?;
        if summary.quantized_tensors > 0 {
            tracing::info!(
                mode = ?summary.mode,
                tensors = summary.quantized_tensors,
                parameters = summary.quantized_parameters,
                max_abs_error = summary.max_abs_error,
                "weights quantized"
            );
        }

        let metadata = ModelMetadata {
            name: config.model_name.clone(),
            device: format!("{device:?}"),
            dtype: format!("{kind:?}"),
            quantization: format!("{:?}", config.quantization).to_lowercase(),
            adapter: config
                .lora_model_path
                .as_ref()
                .map(|p| p.display().to_string()),
            vocab_size: tokenizer_vocab,
        };

        Ok(Self {
            model: Box::new(model),
            tokenizer,
            formatter,
            metadata,
        })
    }
}

impl TorchScriptModel {
    pub fn load(path: &Path, device: Device, kind: Kind) -> Result<Self, ServiceError> {
        if !path.exists() {
            return Err(ServiceError::Other(format!(
                "model artifact missing: {}",
                path.display()
            )));
        }
        tracing::info!(path = %path.display(), ?device, ?kind, "loading TorchScript module");
        let mut module = CModule::load_on_device(path, device)
            .map_err(|e| ServiceError::Inference(e.to_string()))?;
        module.set_eval();
        module.to(device, kind, false);
        Ok(Self { module, device })
    }
}

impl CausalLanguageModel for TorchScriptModel {
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> Result<ModelOutput, ServiceError> {
        let output = self
            .module
            .forward_is(&[
                IValue::Tensor(input_ids.shallow_clone()),
                IValue::Tensor(attention_mask.shallow_clone()),
            ])
            .map_err(|e| ServiceError::Inference(e.to_string()))?;

        match output {
            IValue::Tensor(logits) => Ok(ModelOutput {
                logits,
                hidden_states: None,
            }),
            IValue::Tuple(items) => {
                let mut items = items.into_iter();
                let logits = match items.next() {
                    Some(IValue::Tensor(t)) => t,
                    _ => {
                        return Err(ServiceError::Inference(
                            "expected logits tensor as first tuple element".into(),
                        ));
                    }
                };
                Ok(ModelOutput {
                    logits,
                    hidden_states: items.next().and_then(last_hidden_state),
                })
            }
            _ => Err(ServiceError::Inference("unexpected model output format".into())),
        }
    }

    fn device(&self) -> Device {
        self.device
    }
}

/// Accepts either the last layer directly or the full per-layer collection.
fn last_hidden_state(value: IValue) -> Option<Tensor> {
    match value {
        IValue::Tensor(t) => Some(t),
        IValue::TensorList(mut layers) => layers.pop(),
        IValue::Tuple(mut layers) | IValue::GenericList(mut layers) => match layers.pop() {
            Some(IValue::Tensor(t)) => Some(t),
            _ => None,
        },
        _ => None,
    }
}

fn embedding_rows(parameters: &[(String, Tensor)]) -> Option<usize> {
    parameters
        .iter()
        .find(|(name, _)| name.ends_with("embed_tokens.weight") || name.ends_with("wte.weight"))
        .and_then(|(_, t)| t.size().first().map(|&rows| rows as usize))
}

fn log_graph_options(config: &AppConfig) {
    let alpha = match config.alpha {
        RopeAlpha::Auto => "auto".to_string(),
        RopeAlpha::Fixed(value) => value.to_string(),
    };
    if config.use_ntk || config.use_flash_attention_2 || config.alpha != RopeAlpha::Fixed(1.0) {
        tracing::warn!(
            alpha = %alpha,
            use_ntk = config.use_ntk,
            use_flash_attention_2 = config.use_flash_attention_2,
            "rotary scaling and attention kernels are fixed by the exported graph; options recorded only"
        );
    }
}

/// End-of-sequence ids: the configured EOS token plus the common spellings
/// the vocabulary happens to contain.
pub fn eos_token_ids(tokenizer: &Tokenizer, formatter: &PromptFormatter) -> Vec<u32> {
    let mut ids: Vec<u32> = std::iter::once(formatter.eos_token())
        .chain(FALLBACK_EOS_TOKENS)
        .filter_map(|token| tokenizer.token_to_id(token))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Copy of the tokenizer that pads batches to the longest entry.
pub(crate) fn padded_tokenizer(tokenizer: &Tokenizer, eos_ids: &[u32]) -> Tokenizer {
    let mut padded = tokenizer.clone();
    if padded.get_padding().is_none() {
        let pad_id = eos_ids.first().copied().unwrap_or(0);
        let pad_token = tokenizer
            .id_to_token(pad_id)
            .unwrap_or_else(|| PaddingParams::default().pad_token);
        padded.with_padding(Some(PaddingParams {
            pad_id,
            pad_token,
            ..PaddingParams::default()
        }));
    }
    padded
}
