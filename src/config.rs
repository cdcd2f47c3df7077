use std::{
    env,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};

use clap::Parser;
use tch::{Device, Kind};

use crate::{error::ConfigError, model::GenerationConfig, quantization::QuantizationMode};

pub const DEFAULT_MODEL_NAME: &str = "chinese-llama-alpaca-2";
pub const MODEL_FILE_NAME: &str = "model.ts";
pub const TOKENIZER_FILE_NAME: &str = "tokenizer.json";

/// Command line surface of the server. Every value-carrying flag can also be
/// supplied through the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "causal-llm-service", version, about = "OpenAI-compatible API server for a causal language model")]
pub struct ServerArgs {
    /// TorchScript export of the base model, or a directory containing `model.ts`
    #[arg(long = "base_model", env = "BASE_MODEL")]
    pub base_model: PathBuf,

    /// LoRA adapter directory; inference runs on the base model when omitted
    #[arg(long = "lora_model", env = "LORA_MODEL")]
    pub lora_model: Option<PathBuf>,

    /// `tokenizer.json` or its directory; defaults to the adapter, then the base model directory
    #[arg(long = "tokenizer_path", env = "TOKENIZER_PATH")]
    pub tokenizer_path: Option<PathBuf>,

    /// Comma separated accelerator ids; an empty string forces CPU
    #[arg(long, env = "GPUS", default_value = "0")]
    pub gpus: String,

    /// Load the model in 8bit mode
    #[arg(long = "load_in_8bit")]
    pub load_in_8bit: bool,

    /// Load the model in 4bit mode
    #[arg(long = "load_in_4bit")]
    pub load_in_4bit: bool,

    /// Only use CPU for inference
    #[arg(long = "only_cpu")]
    pub only_cpu: bool,

    /// NTK scaling factor, a float or 'auto'
    #[arg(long, default_value = "1.0")]
    pub alpha: String,

    /// Use dynamic NTK to extend the context window
    #[arg(long = "use_ntk")]
    pub use_ntk: bool,

    /// Use flash-attention 2 kernels
    #[arg(long = "use_flash_attention_2")]
    pub use_flash_attention_2: bool,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 19327)]
    pub port: u16,

    /// Model id reported in responses
    #[arg(long = "model_name", env = "MODEL_NAME", default_value = DEFAULT_MODEL_NAME)]
    pub model_name: String,

    /// Capacity of the per-request streaming channel
    #[arg(long = "stream_buffer", env = "STREAM_BUFFER", default_value_t = 32)]
    pub stream_buffer: usize,

    #[arg(long = "max_new_tokens", env = "MAX_NEW_TOKENS", default_value_t = 512)]
    pub max_new_tokens: usize,

    #[arg(long, env = "TEMPERATURE", default_value_t = 0.2)]
    pub temperature: f64,

    #[arg(long = "top_p", env = "TOP_P", default_value_t = 0.9)]
    pub top_p: f64,

    #[arg(long = "top_k", env = "TOP_K", default_value_t = 40)]
    pub top_k: usize,

    #[arg(long = "repetition_penalty", env = "REPETITION_PENALTY", default_value_t = 1.1)]
    pub repetition_penalty: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RopeAlpha {
    Fixed(f64),
    Auto,
}

impl RopeAlpha {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("auto") {
            return Ok(RopeAlpha::Auto);
        }
        trimmed
            .parse::<f64>()
            .map(RopeAlpha::Fixed)
            .map_err(|_| ConfigError::InvalidAlpha(raw.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_name: String,
    pub base_model_path: PathBuf,
    pub lora_model_path: Option<PathBuf>,
    pub tokenizer_path: PathBuf,
    pub visible_devices: String,
    pub quantization: QuantizationMode,
    pub alpha: RopeAlpha,
    pub use_ntk: bool,
    pub use_flash_attention_2: bool,
    pub stream_buffer: usize,
    pub generation: GenerationConfig,
}

impl AppConfig {
    pub fn from_args(args: ServerArgs) -> Result<Self, ConfigError> {
        let (visible_devices, quantization) = validate_devices(&args)?;
        let alpha = RopeAlpha::parse(&args.alpha)?;

        let host: IpAddr = args
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(args.host.clone()))?;
        let listen_addr = SocketAddr::new(host, args.port);

        let base_model_path = resolve_artifact(&args.base_model, MODEL_FILE_NAME)?;
        let lora_model_path = match args.lora_model {
            Some(dir) if dir.is_dir() => Some(dir),
            Some(dir) => return Err(ConfigError::MissingPath(dir.display().to_string())),
            None => None,
        };

        // tokenizer falls back to the adapter directory, then the base model's
        let tokenizer_source = args
            .tokenizer_path
            .clone()
            .or_else(|| lora_model_path.clone())
            .unwrap_or_else(|| artifact_dir(&base_model_path));
        let tokenizer_path = resolve_artifact(&tokenizer_source, TOKENIZER_FILE_NAME)?;

        let generation = GenerationConfig {
            max_new_tokens: args.max_new_tokens,
            temperature: args.temperature,
            top_p: args.top_p,
            top_k: args.top_k,
            repetition_penalty: args.repetition_penalty,
            ..GenerationConfig::default()
        };

        Ok(Self {
            listen_addr,
            model_name: args.model_name,
            base_model_path,
            lora_model_path,
            tokenizer_path,
            visible_devices,
            quantization,
            alpha,
            use_ntk: args.use_ntk,
            use_flash_attention_2: args.use_flash_attention_2,
            stream_buffer: args.stream_buffer.max(1),
            generation,
        })
    }

    /// Publishes the accelerator visibility mask for libtorch.
    ///
    /// Must run before any tch call and before the async runtime spawns
    /// worker threads.
    pub fn export_visible_devices(&self) {
        // SAFETY: called from `main` while the process is still single threaded.
        unsafe {
            env::set_var("CUDA_VISIBLE_DEVICES", &self.visible_devices);
        }
    }

    pub fn device(&self) -> Device {
        if self.visible_devices.trim().is_empty() {
            return Device::Cpu;
        }
        if tch::Cuda::is_available() {
            Device::Cuda(0)
        } else {
            tracing::warn!(gpus = %self.visible_devices, "CUDA unavailable, falling back to CPU");
            Device::Cpu
        }
    }
}

/// Half precision on accelerators, full precision on CPU.
pub fn compute_kind(device: Device) -> Kind {
    match device {
        Device::Cpu => Kind::Float,
        _ => Kind::Half,
    }
}

fn validate_devices(args: &ServerArgs) -> Result<(String, QuantizationMode), ConfigError> {
    let mut gpus = args.gpus.clone();
    if args.only_cpu {
        gpus.clear();
        if args.load_in_8bit || args.load_in_4bit {
            return Err(ConfigError::QuantizationOnCpu);
        }
    }
    let quantization = QuantizationMode::from_flags(args.load_in_8bit, args.load_in_4bit)?;
    Ok((gpus, quantization))
}

fn resolve_artifact(path: &Path, file_name: &str) -> Result<PathBuf, ConfigError> {
    let candidate = if path.is_dir() {
        path.join(file_name)
    } else {
        path.to_path_buf()
    };
    if candidate.is_file() {
        Ok(candidate)
    } else {
        Err(ConfigError::MissingPath(candidate.display().to_string()))
    }
}

fn artifact_dir(file: &Path) -> PathBuf {
    file.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}
