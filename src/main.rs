use std::sync::Arc;

use clap::Parser;
use tokio::{net::TcpListener, task};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use causal_llm_service::{AppConfig, ModelRegistry, ServerArgs, build_router};

// The runtime is built by hand: CUDA_VISIBLE_DEVICES has to be exported while
// the process is still single threaded.
fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_args(ServerArgs::parse())?;
    config.export_visible_devices();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(serve(Arc::new(config)))
}

async fn serve(config: Arc<AppConfig>) -> anyhow::Result<()> {
    tracing::info!(
        base_model = %config.base_model_path.display(),
        tokenizer = %config.tokenizer_path.display(),
        gpus = %config.visible_devices,
        "loading model artifacts"
    );

    let load_config = config.clone();
    let registry = task::spawn_blocking(move || ModelRegistry::initialize(&load_config)).await??;
    let router = build_router(config.clone(), Arc::new(registry));

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, model = %config.model_name, "OpenAI-compatible server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
