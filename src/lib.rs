pub mod api;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod model;
pub mod prompt;
pub mod quantization;
pub mod sampling;
pub mod server;
pub mod streaming;

pub use config::{AppConfig, ServerArgs};
pub use model::{CausalLanguageModel, ModelArtifacts, ModelRegistry};
pub use server::build_router;
