pub mod config;
pub mod envelope;
pub mod error;
pub mod model;
pub mod prompt;
pub mod server;

pub use config::AppConfig;
pub use error::ServiceError;
pub use model::{GenerationEngine, GenerationParams, GenerationResult, InferenceBackend};
pub use server::build_router;
