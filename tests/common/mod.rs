#![allow(dead_code)]

use std::{
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response, StatusCode, header},
};
use serde_json::Value;
use tch::{Device, Tensor};
use tokenizers::Tokenizer;
use tower::ServiceExt;

use causal_llm_service::{
    AppConfig, CausalLanguageModel, ModelArtifacts, ModelRegistry, build_router,
    config::RopeAlpha,
    error::ServiceError,
    model::{GenerationConfig, ModelMetadata, ModelOutput},
    prompt::PromptFormatter,
    quantization::QuantizationMode,
};

pub const VOCAB: [&str; 8] = ["<pad>", "</s>", "<unk>", "hello", "world", "alpha", "beta", "gamma"];
pub const HIDDEN: i64 = 4;
pub const EOS: i64 = 1;

/// Deterministic stand-in for the TorchScript model: after `alpha` comes
/// `beta`, then `gamma`, then `</s>`; anything else is followed by `alpha`.
pub struct ScriptedModel;

impl ScriptedModel {
    fn next(id: i64) -> i64 {
        match id {
            5 => 6,
            6 => 7,
            7 => EOS,
            _ => 5,
        }
    }
}

impl CausalLanguageModel for ScriptedModel {
    fn forward(&self, input_ids: &Tensor, _mask: &Tensor) -> Result<ModelOutput, ServiceError> {
        let size = input_ids.size();
        let (batch, seq) = (size[0], size[1]);
        let ids = Vec::<i64>::try_from(input_ids.flatten(0, -1))?;
        let vocab = VOCAB.len();

        let mut logits = vec![0f32; ids.len() * vocab];
        let mut hidden = Vec::with_capacity(ids.len() * HIDDEN as usize);
        for (pos, &id) in ids.iter().enumerate() {
            logits[pos * vocab + Self::next(id) as usize] = 10.0;
            hidden.extend_from_slice(&[id as f32, 1.0, (id % 3) as f32, -(id as f32) / 2.0]);
        }

        Ok(ModelOutput {
            logits: Tensor::from_slice(&logits).reshape([batch, seq, vocab as i64]),
            hidden_states: Some(Tensor::from_slice(&hidden).reshape([batch, seq, HIDDEN])),
        })
    }

    fn device(&self) -> Device {
        Device::Cpu
    }
}

/// Fails every forward pass.
pub struct BrokenModel;

impl CausalLanguageModel for BrokenModel {
    fn forward(&self, _input_ids: &Tensor, _mask: &Tensor) -> Result<ModelOutput, ServiceError> {
        Err(ServiceError::Inference("device lost".into()))
    }

    fn device(&self) -> Device {
        Device::Cpu
    }
}

/// Panics inside every forward pass.
pub struct PanickingModel;

impl CausalLanguageModel for PanickingModel {
    fn forward(&self, _input_ids: &Tensor, _mask: &Tensor) -> Result<ModelOutput, ServiceError> {
        panic!("libtorch kernel aborted");
    }

    fn device(&self) -> Device {
        Device::Cpu
    }
}

#[derive(Default)]
pub struct ForwardStats {
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

/// Never emits EOS: every position predicts `alpha`. Each forward pass takes
/// about a millisecond and is counted in the shared stats.
pub struct LoopingModel {
    pub stats: Arc<ForwardStats>,
}

impl CausalLanguageModel for LoopingModel {
    fn forward(&self, input_ids: &Tensor, _mask: &Tensor) -> Result<ModelOutput, ServiceError> {
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(1));

        let size = input_ids.size();
        let (batch, seq) = (size[0], size[1]);
        let vocab = VOCAB.len();
        let mut logits = vec![0f32; (batch * seq) as usize * vocab];
        for pos in 0..(batch * seq) as usize {
            logits[pos * vocab + 5] = 10.0;
        }

        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ModelOutput {
            logits: Tensor::from_slice(&logits).reshape([batch, seq, vocab as i64]),
            hidden_states: None,
        })
    }

    fn device(&self) -> Device {
        Device::Cpu
    }
}

pub fn looping_router() -> (Router, Arc<ForwardStats>) {
    let stats = Arc::new(ForwardStats::default());
    let model = LoopingModel {
        stats: stats.clone(),
    };
    (router_with(Box::new(model)), stats)
}

pub fn tokenizer() -> Tokenizer {
    let vocab: serde_json::Map<String, Value> = VOCAB
        .iter()
        .enumerate()
        .map(|(id, token)| (token.to_string(), Value::from(id)))
        .collect();
    let special = |id: usize| {
        serde_json::json!({
            "id": id, "content": VOCAB[id], "single_word": false, "lstrip": false,
            "rstrip": false, "normalized": false, "special": true
        })
    };
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [special(0), special(1)],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    });
    Tokenizer::from_str(&json.to_string()).expect("valid tokenizer json")
}

pub fn app_config() -> AppConfig {
    AppConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 19327)),
        model_name: "test-model".into(),
        base_model_path: PathBuf::from("model.ts"),
        lora_model_path: None,
        tokenizer_path: PathBuf::from("tokenizer.json"),
        visible_devices: String::new(),
        quantization: QuantizationMode::None,
        alpha: RopeAlpha::Fixed(1.0),
        use_ntk: false,
        use_flash_attention_2: false,
        stream_buffer: 4,
        generation: GenerationConfig::default(),
    }
}

pub fn router_with(model: Box<dyn CausalLanguageModel>) -> Router {
    let formatter =
        PromptFormatter::new("{% for m in messages %}{{ m.content }} {% endfor %}", "", "</s>")
            .expect("template compiles");
    let artifacts = ModelArtifacts {
        model,
        tokenizer: tokenizer(),
        formatter,
        metadata: ModelMetadata {
            name: "test-model".into(),
            device: "Cpu".into(),
            dtype: "Float".into(),
            quantization: "none".into(),
            adapter: None,
            vocab_size: VOCAB.len(),
        },
    };
    let registry = ModelRegistry::from_artifacts(artifacts, 4);
    build_router(Arc::new(app_config()), Arc::new(registry))
}

pub fn router() -> Router {
    router_with(Box::new(ScriptedModel))
}

pub async fn post_json(router: Router, uri: &str, body: Value) -> Response<Body> {
    let request = Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request builds");
    router.oneshot(request).await.expect("router is infallible")
}

pub async fn get(router: Router, uri: &str) -> Response<Body> {
    let request = Request::get(uri).body(Body::empty()).expect("request builds");
    router.oneshot(request).await.expect("router is infallible")
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body readable");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_str(&body_text(response).await).expect("json body")
}

/// Payloads of every `data:` frame, in order.
pub fn sse_payloads(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim_start().to_string())
        .collect()
}

pub fn assert_ok(response: &Response<Body>) {
    assert_eq!(response.status(), StatusCode::OK);
}
