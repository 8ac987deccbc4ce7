mod common;

use std::{sync::Arc, time::Duration};

use futures::StreamExt;

use common::ScriptedBackend;
use local_llm_service::{GenerationEngine, GenerationParams, GenerationResult, ServiceError};

fn greedy(max_tokens: usize) -> GenerationParams {
    GenerationParams::new(0.0, max_tokens, 1.0).unwrap()
}

async fn collect(result: GenerationResult) -> Vec<Result<String, ServiceError>> {
    match result {
        GenerationResult::Stream(stream) => stream.collect().await,
        GenerationResult::Complete(text) => panic!("expected a stream, got {text:?}"),
    }
}

fn complete_text(result: GenerationResult) -> String {
    match result {
        GenerationResult::Complete(text) => text,
        GenerationResult::Stream(_) => panic!("expected a complete result"),
    }
}

#[tokio::test]
async fn rejects_generation_until_model_is_installed() {
    let engine = GenerationEngine::new(4);
    assert!(!engine.is_loaded());
    let err = engine
        .generate("Hi".into(), greedy(4), false)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ModelUnavailable));

    engine.install(Arc::new(ScriptedBackend::replying("ok")));
    assert!(engine.is_loaded());
    assert_eq!(engine.device().as_deref(), Some("scripted"));

    engine.unload();
    let err = engine
        .generate("Hi".into(), greedy(4), true)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ModelUnavailable));
}

#[tokio::test]
async fn greedy_generation_is_deterministic_and_bounded() {
    let engine =
        GenerationEngine::with_backend(Arc::new(ScriptedBackend::replying("Hello there")), 4);

    let first = complete_text(engine.generate("Hi".into(), greedy(5), false).await.unwrap());
    let second = complete_text(engine.generate("Hi".into(), greedy(5), false).await.unwrap());

    assert_eq!(first, "Hello");
    assert_eq!(first, second);
}

#[tokio::test]
async fn streamed_fragments_concatenate_to_complete_text() {
    let reply = "  Sure.\n\nHere it  is: 42!</s>";
    let engine = GenerationEngine::with_backend(Arc::new(ScriptedBackend::replying(reply)), 2);

    let complete = complete_text(engine.generate("Q".into(), greedy(64), false).await.unwrap());
    let fragments: Vec<String> = collect(engine.generate("Q".into(), greedy(64), true).await.unwrap())
        .await
        .into_iter()
        .map(|item| item.unwrap())
        .collect();

    assert_eq!(complete, "Sure.\n\nHere it  is: 42!");
    assert!(fragments.iter().all(|f| !f.trim().is_empty()));
    assert_eq!(fragments.concat(), complete);
}

#[tokio::test]
async fn mid_stream_failure_ends_with_error() {
    let backend = ScriptedBackend {
        fail_after: Some(3),
        ..ScriptedBackend::replying("abcdef")
    };
    let engine = GenerationEngine::with_backend(Arc::new(backend), 8);

    let items = collect(engine.generate("Q".into(), greedy(16), true).await.unwrap()).await;
    let (last, fragments) = items.split_last().unwrap();

    assert!(matches!(last, Err(ServiceError::Inference(_))));
    let text: String = fragments.iter().map(|f| f.as_ref().unwrap().as_str()).collect();
    assert_eq!(text, "abc");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_are_single_flight() {
    let backend = Arc::new(ScriptedBackend {
        token_delay: Duration::from_millis(2),
        ..ScriptedBackend::replying("serialized")
    });
    let engine = Arc::new(GenerationEngine::with_backend(backend.clone(), 4));

    let mut handles = Vec::new();
    for i in 0..5 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let streaming = i % 2 == 0;
            match engine.generate("Q".into(), greedy(32), streaming).await.unwrap() {
                GenerationResult::Complete(text) => text,
                GenerationResult::Stream(stream) => stream
                    .map(|item| item.unwrap())
                    .collect::<Vec<_>>()
                    .await
                    .concat(),
            }
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), "serialized");
    }
    assert_eq!(backend.calls(), 5);
    assert_eq!(backend.max_in_flight(), 1);
}

#[tokio::test]
async fn dropping_the_stream_stops_generation_and_frees_the_model() {
    let backend = Arc::new(ScriptedBackend::replying(&"x".repeat(64)));
    let engine = GenerationEngine::with_backend(backend.clone(), 1);

    let GenerationResult::Stream(mut stream) =
        engine.generate("Q".into(), greedy(64), true).await.unwrap()
    else {
        panic!("expected a stream");
    };
    assert_eq!(stream.next().await.unwrap().unwrap(), "x");
    drop(stream);

    // Queues behind the abandoned producer until it notices the drop.
    let text = complete_text(engine.generate("Q".into(), greedy(3), false).await.unwrap());
    assert_eq!(text, "xxx");
    assert!(backend.stopped_early());
}
