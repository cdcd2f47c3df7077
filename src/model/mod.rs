mod adapter;
mod loader;
mod registry;
mod types;

use tch::{Device, Tensor};

use crate::error::ServiceError;

pub use adapter::{LoraAdapter, LoraMergeSummary};
pub use loader::{ModelArtifacts, TorchScriptModel, eos_token_ids};
pub use registry::{EmbeddingBatch, ModelRegistry, StreamEvent};
pub use types::{
    ChatMessage, FinishReason, GenerationConfig, GenerationOutput, ModelMetadata, Role,
};

/// Result of one forward pass.
pub struct ModelOutput {
    /// `[batch, seq, vocab]`
    pub logits: Tensor,
    /// Last layer hidden state, `[batch, seq, hidden]`, when the model exposes it.
    pub hidden_states: Option<Tensor>,
}

/// A causal language model the server can drive.
///
/// Callers wrap forward passes in `tch::no_grad`.
pub trait CausalLanguageModel: Send {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor)
    -> Result<ModelOutput, ServiceError>;

    fn device(&self) -> Device;
}
