use std::{fmt, ops::ControlFlow, pin::Pin, sync::Arc, time::Instant};

use futures::Stream;
use parking_lot::RwLock;
use tokio::{
    sync::{Mutex, OwnedMutexGuard, mpsc},
    task,
};
use tracing::{debug, info};

use crate::{
    error::ServiceError,
    model::{
        GenerationParams, InferenceBackend,
        output::{FragmentFilter, clean_output},
    },
};

/// Decoded fragments in generation order. A trailing `Err` means generation
/// failed after the preceding fragments were produced.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ServiceError>> + Send>>;

pub enum GenerationResult {
    Complete(String),
    Stream(FragmentStream),
}

impl fmt::Debug for GenerationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationResult::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            GenerationResult::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

enum ModelState {
    Loading,
    Ready(Arc<dyn InferenceBackend>),
    Unloaded { reason: Option<String> },
}

/// Sole owner of the model backend.
///
/// At most one generation runs at a time. Callers wait on a fair mutex, so
/// queued requests are served in arrival order. The gate is held by the
/// blocking task doing the work, not by the caller, so a caller that gives up
/// (client disconnect, timeout) never lets a second generation overlap one
/// that is still running.
pub struct GenerationEngine {
    state: RwLock<ModelState>,
    gate: Arc<Mutex<()>>,
    stream_buffer: usize,
}

impl GenerationEngine {
    /// Creates an engine waiting for [`install`](Self::install).
    pub fn new(stream_buffer: usize) -> Self {
        Self {
            state: RwLock::new(ModelState::Loading),
            gate: Arc::new(Mutex::new(())),
            stream_buffer: stream_buffer.max(1),
        }
    }

    pub fn with_backend(backend: Arc<dyn InferenceBackend>, stream_buffer: usize) -> Self {
        let engine = Self::new(stream_buffer);
        engine.install(backend);
        engine
    }

    pub fn install(&self, backend: Arc<dyn InferenceBackend>) {
        info!(device = %backend.device(), "model ready");
        *self.state.write() = ModelState::Ready(backend);
    }

    pub fn mark_failed(&self, reason: impl Into<String>) {
        *self.state.write() = ModelState::Unloaded {
            reason: Some(reason.into()),
        };
    }

    /// Drops the engine's handle on the backend. A generation already in
    /// progress keeps its own handle until it finishes.
    pub fn unload(&self) {
        *self.state.write() = ModelState::Unloaded { reason: None };
        info!("model unloaded");
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*self.state.read(), ModelState::Ready(_))
    }

    pub fn device(&self) -> Option<String> {
        match &*self.state.read() {
            ModelState::Ready(backend) => Some(backend.device()),
            _ => None,
        }
    }

    pub fn load_error(&self) -> Option<String> {
        match &*self.state.read() {
            ModelState::Unloaded { reason } => reason.clone(),
            _ => None,
        }
    }

    fn backend(&self) -> Result<Arc<dyn InferenceBackend>, ServiceError> {
        match &*self.state.read() {
            ModelState::Ready(backend) => Ok(backend.clone()),
            ModelState::Loading | ModelState::Unloaded { .. } => {
                Err(ServiceError::ModelUnavailable)
            }
        }
    }

    pub async fn generate(
        &self,
        prompt: String,
        params: GenerationParams,
        streaming: bool,
    ) -> Result<GenerationResult, ServiceError> {
        // Fail fast instead of queueing behind the gate for nothing.
        self.backend()?;
        let permit = self.gate.clone().lock_owned().await;
        let backend = self.backend()?;

        debug!(
            streaming,
            max_tokens = params.max_tokens,
            temperature = params.temperature,
            do_sample = params.do_sample(),
            "starting generation"
        );

        if streaming {
            return Ok(GenerationResult::Stream(
                self.spawn_stream(backend, permit, prompt, params),
            ));
        }

        let text = task::spawn_blocking(move || {
            let _permit = permit;
            run_to_completion(backend.as_ref(), &prompt, &params)
        })
        .await
        .map_err(|err| ServiceError::Inference(format!("generation task failed: {err}")))??;

        Ok(GenerationResult::Complete(text))
    }

    fn spawn_stream(
        &self,
        backend: Arc<dyn InferenceBackend>,
        permit: OwnedMutexGuard<()>,
        prompt: String,
        params: GenerationParams,
    ) -> FragmentStream {
        let (tx, mut rx) = mpsc::channel::<String>(self.stream_buffer);

        let producer = task::spawn_blocking(move || {
            let _permit = permit;
            run_streaming(backend.as_ref(), &prompt, &params, &tx)
        });

        Box::pin(async_stream::stream! {
            while let Some(fragment) = rx.recv().await {
                yield Ok(fragment);
            }
            // The channel closes when the producer returns; join it so no
            // generation outlives the stream's end.
            match producer.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => yield Err(err),
                Err(err) => {
                    yield Err(ServiceError::Inference(format!("generation task failed: {err}")))
                }
            }
        })
    }
}

fn run_to_completion(
    backend: &dyn InferenceBackend,
    prompt: &str,
    params: &GenerationParams,
) -> Result<String, ServiceError> {
    let start = Instant::now();
    let prompt_ids = backend.tokenize(prompt)?;

    let output = backend.generate(&prompt_ids, params, &mut |_: u32| {
        ControlFlow::Continue(())
    })?;
    let generated = output.get(prompt_ids.len()..).unwrap_or_default();
    let text = clean_output(&backend.detokenize(generated)?);

    info!(
        prompt_tokens = prompt_ids.len(),
        generated_tokens = generated.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "generation finished"
    );
    Ok(text)
}

fn run_streaming(
    backend: &dyn InferenceBackend,
    prompt: &str,
    params: &GenerationParams,
    tx: &mpsc::Sender<String>,
) -> Result<(), ServiceError> {
    let start = Instant::now();
    let prompt_ids = backend.tokenize(prompt)?;

    let mut generated: Vec<u32> = Vec::new();
    let mut filter = FragmentFilter::default();
    let mut decode_error = None;
    let mut cancelled = false;

    backend.generate(&prompt_ids, params, &mut |token: u32| {
        generated.push(token);
        let decoded = match backend.detokenize(&generated) {
            Ok(text) => text,
            Err(err) => {
                decode_error = Some(err);
                return ControlFlow::Break(());
            }
        };
        if let Some(fragment) = filter.push(&decoded) {
            if tx.blocking_send(fragment).is_err() {
                cancelled = true;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    })?;

    if let Some(err) = decode_error {
        return Err(err);
    }
    if cancelled {
        debug!(
            generated_tokens = generated.len(),
            "stream consumer went away, generation stopped early"
        );
        return Ok(());
    }

    let decoded = backend.detokenize(&generated)?;
    if let Some(fragment) = filter.finish(&decoded) {
        let _ = tx.blocking_send(fragment);
    }

    info!(
        prompt_tokens = prompt_ids.len(),
        generated_tokens = generated.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "streamed generation finished"
    );
    Ok(())
}
