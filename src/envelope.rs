//! Response shapes for the chat and generate endpoints.
//!
//! Complete results become a single JSON body. Streams are framed as
//! server-sent events, one `data:` event per fragment, closed by a single
//! `data: [DONE]` event. A stream that fails part way ends without the
//! sentinel so clients can tell truncation from completion.

use std::convert::Infallible;

use axum::{
    Json,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::error;

use crate::model::{FragmentStream, GenerationResult, Message, Role};

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Chat,
    Completion,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub model: String,
    pub created_at: String,
    pub message: Message,
    pub done: bool,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub model: String,
    pub created_at: String,
    pub response: String,
    pub done: bool,
}

impl ChatResponse {
    pub fn new(model: String, content: String) -> Self {
        Self {
            model,
            created_at: timestamp(),
            message: Message {
                role: Role::Assistant,
                content,
            },
            done: true,
        }
    }
}

impl CompletionResponse {
    pub fn new(model: String, response: String) -> Self {
        Self {
            model,
            created_at: timestamp(),
            response,
            done: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Fragment(String),
    Done,
}

impl From<SseFrame> for Event {
    fn from(frame: SseFrame) -> Self {
        match frame {
            // SSE lines cannot carry bare carriage returns.
            SseFrame::Fragment(text) => {
                Event::default().data(text.replace("\r\n", "\n").replace('\r', "\n"))
            }
            SseFrame::Done => Event::default().data(DONE_SENTINEL),
        }
    }
}

/// Maps fragments to frames: empty fragments are skipped, `Done` follows
/// the last fragment, and an error ends the frames early.
pub fn sse_frames(fragments: FragmentStream) -> impl Stream<Item = SseFrame> + Send {
    async_stream::stream! {
        let mut fragments = fragments;
        while let Some(item) = fragments.next().await {
            match item {
                Ok(fragment) if fragment.is_empty() => continue,
                Ok(fragment) => yield SseFrame::Fragment(fragment),
                Err(err) => {
                    error!(error = %err, "generation failed mid-stream, closing without terminator");
                    return;
                }
            }
        }
        yield SseFrame::Done;
    }
}

pub fn respond(kind: EnvelopeKind, model: String, result: GenerationResult) -> Response {
    match result {
        GenerationResult::Complete(text) => match kind {
            EnvelopeKind::Chat => Json(ChatResponse::new(model, text)).into_response(),
            EnvelopeKind::Completion => Json(CompletionResponse::new(model, text)).into_response(),
        },
        GenerationResult::Stream(fragments) => {
            let events = sse_frames(fragments).map(|frame| Ok::<_, Infallible>(Event::from(frame)));
            Sse::new(events)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
    }
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
