use std::sync::Arc;

use tokio::{net::TcpListener, task};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use local_llm_service::{AppConfig, GenerationEngine, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    let engine = Arc::new(GenerationEngine::new(config.stream_buffer));
    let router = build_router(config.clone(), engine.clone());

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, style = %config.prompt_style, "REST server ready");

    tokio::spawn(load_model(config.clone(), engine.clone()));

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.unload();
    Ok(())
}

async fn load_model(config: Arc<AppConfig>, engine: Arc<GenerationEngine>) {
    tracing::info!(path = %config.model_path.display(), device = %config.device, "loading model artifacts");

    let loaded = {
        let config = config.clone();
        task::spawn_blocking(move || load_backend(&config)).await
    };
    match loaded {
        Ok(Ok(backend)) => engine.install(backend),
        Ok(Err(err)) => {
            tracing::error!(error = %err, "failed to load model");
            engine.mark_failed(err.to_string());
        }
        Err(err) => {
            tracing::error!(error = %err, "model loader task failed");
            engine.mark_failed(format!("loader task failed: {err}"));
        }
    }
}

#[cfg(feature = "tch-backend")]
fn load_backend(
    config: &AppConfig,
) -> Result<Arc<dyn local_llm_service::InferenceBackend>, local_llm_service::ServiceError> {
    let backend = local_llm_service::model::TorchBackend::load(config)?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "tch-backend"))]
fn load_backend(
    _config: &AppConfig,
) -> Result<Arc<dyn local_llm_service::InferenceBackend>, local_llm_service::ServiceError> {
    Err(local_llm_service::ServiceError::Other(
        "built without an inference backend; enable the `tch-backend` feature".into(),
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining connections");
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
