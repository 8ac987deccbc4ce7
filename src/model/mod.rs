mod backend;
mod engine;
pub mod output;
mod types;

#[cfg(feature = "tch-backend")]
mod loader;

pub use backend::{InferenceBackend, TokenSink};
pub use engine::{FragmentStream, GenerationEngine, GenerationResult};
#[cfg(feature = "tch-backend")]
pub use loader::TorchBackend;
pub use types::{
    ChatRequest, CompletionRequest, GenerationParams, Message, ModelDescriptor, ModelDetails,
    Role,
};
