use std::{sync::Arc, time::Instant};

use parking_lot::Mutex;
use tch::{Device, Tensor};
use tokenizers::Tokenizer;
use tokio::{sync::mpsc, task};

use crate::{
    config::AppConfig,
    embedding,
    error::ServiceError,
    generation,
    model::{
        CausalLanguageModel, ChatMessage, GenerationConfig, GenerationOutput, ModelMetadata,
        ModelOutput,
        loader::{ModelArtifacts, eos_token_ids, padded_tokenizer},
    },
    prompt::PromptFormatter,
    streaming::TokenOutputStream,
};

/// A text fragment, or the error that ended the stream.
pub type StreamEvent = Result<String, ServiceError>;

#[derive(Debug, Clone)]
pub struct EmbeddingBatch {
    pub vectors: Vec<Vec<f32>>,
    pub prompt_tokens: usize,
}

/// The one loaded model. The lock covers a single forward pass, so decodes
/// from concurrent requests interleave step by step and a stalled stream
/// consumer never holds the model.
struct SharedModel {
    inner: Mutex<Box<dyn CausalLanguageModel>>,
    device: Device,
}

impl CausalLanguageModel for SharedModel {
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> Result<ModelOutput, ServiceError> {
        self.inner.lock().forward(input_ids, attention_mask)
    }

    fn device(&self) -> Device {
        self.device
    }
}

pub struct ModelRegistry {
    model: Arc<SharedModel>,
    tokenizer: Arc<Tokenizer>,
    padded_tokenizer: Arc<Tokenizer>,
    formatter: Arc<PromptFormatter>,
    eos_token_ids: Arc<Vec<u32>>,
    metadata: ModelMetadata,
    stream_buffer: usize,
}

impl ModelRegistry {
    pub fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        let artifacts = ModelArtifacts::load(config)?;
        Ok(Self::from_artifacts(artifacts, config.stream_buffer))
    }

    pub fn from_artifacts(artifacts: ModelArtifacts, stream_buffer: usize) -> Self {
        let ModelArtifacts {
            model,
            tokenizer,
            formatter,
            metadata,
        } = artifacts;
        let eos = eos_token_ids(&tokenizer, &formatter);
        if eos.is_empty() {
            tracing::warn!("no end-of-sequence token in vocabulary; decoding stops at max_tokens");
        }
        let padded = padded_tokenizer(&tokenizer, &eos);

        Self {
            model: Arc::new(SharedModel {
                device: model.device(),
                inner: Mutex::new(model),
            }),
            tokenizer: Arc::new(tokenizer),
            padded_tokenizer: Arc::new(padded),
            formatter: Arc::new(formatter),
            eos_token_ids: Arc::new(eos),
            metadata,
            stream_buffer: stream_buffer.max(1),
        }
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn encode_prompt(&self, messages: &[ChatMessage]) -> Result<Vec<u32>, ServiceError> {
        self.formatter.encode(&self.tokenizer, messages)
    }

    /// Blocking generation: decodes only the new span, special tokens skipped.
    pub async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        config: GenerationConfig,
    ) -> Result<GenerationOutput, ServiceError> {
        let prompt = self.encode_prompt(&messages)?;
        let model = self.model.clone();
        let tokenizer = self.tokenizer.clone();
        let eos = self.eos_token_ids.clone();

        task::spawn_blocking(move || {
            let started = Instant::now();
            let generated =
                generation::generate(&*model, &prompt, &config, &eos, |_| Ok(true))?;
            let text = tokenizer
                .decode(&generated.tokens, true)
                .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;

            let elapsed = started.elapsed().as_secs_f64();
            tracing::info!(
                prompt_tokens = prompt.len(),
                completion_tokens = generated.tokens.len(),
                finish_reason = generated.finish_reason.as_str(),
                tokens_per_sec = generated.tokens.len() as f64 / elapsed.max(1e-6),
                "generation finished"
            );

            Ok(GenerationOutput {
                text,
                prompt_tokens: prompt.len(),
                completion_tokens: generated.tokens.len(),
                finish_reason: generated.finish_reason,
            })
        })
        .await
        .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }

    /// Starts a streaming decode and returns the receiving end of its
    /// fragment channel. The channel closes when decoding ends; a worker
    /// failure arrives as a final `Err`.
    pub fn generate_stream(
        &self,
        messages: Vec<ChatMessage>,
        config: GenerationConfig,
    ) -> Result<mpsc::Receiver<StreamEvent>, ServiceError> {
        if config.num_beams > 1 {
            return Err(ServiceError::BadRequest(
                "streaming is not supported with num_beams > 1".into(),
            ));
        }
        let prompt = self.encode_prompt(&messages)?;
        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let model = self.model.clone();
        let tokenizer = self.tokenizer.clone();
        let eos = self.eos_token_ids.clone();

        let worker_tx = tx.clone();
        let worker = task::spawn_blocking(move || {
            stream_worker(&*model, tokenizer, &prompt, &config, &eos, &worker_tx)
        });

        // a panicking worker drops its sender silently; report it as an error
        tokio::spawn(async move {
            let failure = match worker.await {
                Ok(Ok(())) => return,
                Ok(Err(err)) => err,
                Err(err) => ServiceError::Inference(format!("streaming worker failed: {err}")),
            };
            tracing::error!(error = %failure, "streaming generation failed");
            let _ = tx.send(Err(failure)).await;
        });

        Ok(rx)
    }

    pub async fn embed(&self, inputs: Vec<String>) -> Result<EmbeddingBatch, ServiceError> {
        let model = self.model.clone();
        let tokenizer = self.padded_tokenizer.clone();

        task::spawn_blocking(move || {
            let (vectors, prompt_tokens) = embedding::embed(&*model, &tokenizer, &inputs)?;
            tracing::debug!(inputs = vectors.len(), prompt_tokens, "embeddings computed");
            Ok(EmbeddingBatch {
                vectors,
                prompt_tokens,
            })
        })
        .await
        .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }
}

fn stream_worker(
    model: &dyn CausalLanguageModel,
    tokenizer: Arc<Tokenizer>,
    prompt: &[u32],
    config: &GenerationConfig,
    eos: &[u32],
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<(), ServiceError> {
    let started = Instant::now();
    let mut output = TokenOutputStream::new(tokenizer);
    let mut open = true;

    let generated = generation::generate(model, prompt, config, eos, |token| {
        if let Some(fragment) = output.next_token(token)? {
            open = tx.blocking_send(Ok(fragment)).is_ok();
        }
        Ok(open)
    })?;

    if !open {
        tracing::info!(completion_tokens = generated.tokens.len(), "client disconnected, stream abandoned");
        return Ok(());
    }
    if let Some(rest) = output.decode_rest()? {
        let _ = tx.blocking_send(Ok(rest));
    }

    let elapsed = started.elapsed().as_secs_f64();
    tracing::info!(
        prompt_tokens = prompt.len(),
        completion_tokens = generated.tokens.len(),
        tokens_per_sec = generated.tokens.len() as f64 / elapsed.max(1e-6),
        "stream finished"
    );
    Ok(())
}
