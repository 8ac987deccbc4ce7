use std::ops::ControlFlow;

use crate::{error::ServiceError, model::GenerationParams};

/// Receives each newly produced token id. Returning `Break` asks the backend
/// to stop at the next token boundary.
pub type TokenSink<'a> = dyn FnMut(u32) -> ControlFlow<()> + 'a;

/// A loaded model and tokenizer.
///
/// Calls are blocking and are only ever made from a blocking task while the
/// engine holds its generation gate, so implementations need not support
/// concurrent `generate` calls.
pub trait InferenceBackend: Send + Sync + 'static {
    /// Human readable device name, e.g. `cpu` or `cuda:0`.
    fn device(&self) -> String;

    fn tokenize(&self, text: &str) -> Result<Vec<u32>, ServiceError>;

    /// Generates up to `params.max_tokens` new tokens after `prompt`.
    ///
    /// Returns the full sequence, prompt included. Every new token is passed
    /// to `sink` as soon as it is produced.
    fn generate(
        &self,
        prompt: &[u32],
        params: &GenerationParams,
        sink: &mut TokenSink<'_>,
    ) -> Result<Vec<u32>, ServiceError>;

    /// Decodes ids to text, skipping special tokens.
    fn detokenize(&self, ids: &[u32]) -> Result<String, ServiceError>;
}
