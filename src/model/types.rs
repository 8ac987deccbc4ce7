use serde::{Deserialize, Serialize};

use crate::{config::AppConfig, error::ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    pub temperature: Option<f64>,
    pub max_tokens: Option<usize>,
    pub top_p: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    pub temperature: Option<f64>,
    pub max_tokens: Option<usize>,
}

impl ChatRequest {
    pub fn params(&self, config: &AppConfig) -> Result<GenerationParams, ServiceError> {
        GenerationParams::resolve(config, self.temperature, self.max_tokens, self.top_p)
    }
}

impl CompletionRequest {
    pub fn params(&self, config: &AppConfig) -> Result<GenerationParams, ServiceError> {
        GenerationParams::resolve(config, self.temperature, self.max_tokens, None)
    }
}

/// Per-request sampling settings. Sampling is implied by the temperature
/// and cannot be toggled on its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f64,
    pub max_tokens: usize,
    pub top_p: f64,
}

impl GenerationParams {
    pub fn new(temperature: f64, max_tokens: usize, top_p: f64) -> Result<Self, ServiceError> {
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(ServiceError::BadRequest(format!(
                "temperature must be a non-negative number, got {temperature}"
            )));
        }
        if max_tokens == 0 {
            return Err(ServiceError::BadRequest(
                "max_tokens must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&top_p) {
            return Err(ServiceError::BadRequest(format!(
                "top_p must be within [0, 1], got {top_p}"
            )));
        }
        Ok(Self {
            temperature,
            max_tokens,
            top_p,
        })
    }

    fn resolve(
        config: &AppConfig,
        temperature: Option<f64>,
        max_tokens: Option<usize>,
        top_p: Option<f64>,
    ) -> Result<Self, ServiceError> {
        let max_tokens = max_tokens.unwrap_or(config.default_max_tokens);
        let mut params = Self::new(
            temperature.unwrap_or(config.default_temperature),
            max_tokens,
            top_p.unwrap_or(config.default_top_p),
        )?;
        if params.max_tokens > config.max_tokens_limit {
            tracing::debug!(
                requested = params.max_tokens,
                limit = config.max_tokens_limit,
                "clamping max_tokens"
            );
            params.max_tokens = config.max_tokens_limit;
        }
        Ok(params)
    }

    pub fn do_sample(&self) -> bool {
        self.temperature > 0.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub model: String,
    pub modified_at: String,
    pub size: u64,
    pub digest: String,
    pub details: ModelDetails,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_model: Option<String>,
    pub format: String,
    pub family: String,
    pub families: Vec<String>,
    pub parameter_size: String,
    pub quantization_level: String,
}

impl ModelDescriptor {
    /// Builds the descriptor once at startup; file size and mtime are read
    /// from the model artifact when it exists.
    pub fn from_config(config: &AppConfig) -> Self {
        let file = std::fs::metadata(&config.model_path).ok();
        let size = file.as_ref().map(|m| m.len()).unwrap_or(0);
        let modified_at = file
            .and_then(|m| m.modified().ok())
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
            .unwrap_or_default();
        let descriptor = &config.descriptor;

        Self {
            name: format!("{}:latest", config.model_name),
            model: config.model_name.clone(),
            modified_at,
            size,
            digest: String::new(),
            details: ModelDetails {
                parent_model: descriptor.parent_model.clone(),
                format: descriptor.format.clone(),
                family: descriptor.family.clone(),
                families: vec![descriptor.family.clone()],
                parameter_size: descriptor.parameter_size.clone(),
                quantization_level: descriptor.quantization_level.clone(),
            },
        }
    }
}
