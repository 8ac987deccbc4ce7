#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    body::Body,
    http::{Request, Response},
};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde_json::Value;

use local_llm_service::{
    AppConfig, GenerationEngine, GenerationParams, InferenceBackend, ServiceError, build_router,
    model::TokenSink,
};

/// Character-level backend that answers `You said: <last user turn>`, or a
/// fixed `reply` when one is set.
pub struct ScriptedBackend {
    pub reply: Option<String>,
    pub fail_after: Option<usize>,
    pub token_delay: Duration,
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub stopped_early: AtomicBool,
    pub prompts: Mutex<Vec<String>>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self {
            reply: None,
            fail_after: None,
            token_delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            stopped_early: AtomicBool::new(false),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedBackend {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn stopped_early(&self) -> bool {
        self.stopped_early.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().last().cloned()
    }

    fn reply_for(&self, prompt: &str) -> String {
        if let Some(reply) = &self.reply {
            return reply.clone();
        }
        let said = prompt
            .rsplit_once("User: ")
            .map(|(_, rest)| rest.split("\n\n").next().unwrap_or(rest))
            .unwrap_or(prompt)
            .trim();
        format!("You said: {said}</s>")
    }
}

impl InferenceBackend for ScriptedBackend {
    fn device(&self) -> String {
        "scripted".into()
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>, ServiceError> {
        self.prompts.lock().push(text.to_string());
        Ok(text.chars().map(u32::from).collect())
    }

    fn generate(
        &self,
        prompt: &[u32],
        params: &GenerationParams,
        sink: &mut TokenSink<'_>,
    ) -> Result<Vec<u32>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let prompt_text = self.detokenize(prompt)?;
        let mut sequence = prompt.to_vec();
        let mut outcome = Ok(());
        for (idx, ch) in self
            .reply_for(&prompt_text)
            .chars()
            .take(params.max_tokens)
            .enumerate()
        {
            if self.fail_after == Some(idx) {
                outcome = Err(ServiceError::Inference("device lost".into()));
                break;
            }
            std::thread::sleep(self.token_delay);
            sequence.push(u32::from(ch));
            if sink(u32::from(ch)).is_break() {
                self.stopped_early.store(true, Ordering::SeqCst);
                break;
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome.map(|()| sequence)
    }

    fn detokenize(&self, ids: &[u32]) -> Result<String, ServiceError> {
        Ok(ids.iter().filter_map(|&id| char::from_u32(id)).collect())
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        system_prompt: None,
        ..AppConfig::default()
    }
}

pub fn app_with(backend: Option<Arc<ScriptedBackend>>) -> (Router, Arc<GenerationEngine>) {
    app_with_config(test_config(), backend)
}

pub fn app_with_config(
    config: AppConfig,
    backend: Option<Arc<ScriptedBackend>>,
) -> (Router, Arc<GenerationEngine>) {
    let config = Arc::new(config);
    let engine = Arc::new(GenerationEngine::new(config.stream_buffer));
    if let Some(backend) = backend {
        engine.install(backend);
    }
    (build_router(config, engine.clone()), engine)
}

pub fn json_request(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn body_string(resp: Response<Body>) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(resp: Response<Body>) -> Value {
    serde_json::from_str(&body_string(resp).await).unwrap()
}

/// Splits an SSE body into the data payload of each event.
pub fn sse_payloads(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter(|event| !event.is_empty())
        .filter_map(|event| {
            let lines: Vec<&str> = event
                .lines()
                .filter_map(|line| line.strip_prefix("data: ").or(line.strip_prefix("data:")))
                .collect();
            (!lines.is_empty()).then(|| lines.join("\n"))
        })
        .collect()
}
