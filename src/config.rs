use std::{
    env, fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::prompt::PromptStyle;

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer clearly and accurately, and say so when you are unsure.";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_name: String,
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub device: String,
    pub prompt_style: PromptStyle,
    pub system_prompt: Option<String>,
    pub default_temperature: f64,
    pub default_max_tokens: usize,
    pub default_top_p: f64,
    pub max_tokens_limit: usize,
    pub stream_buffer: usize,
    pub request_timeout: Option<Duration>,
    pub seed: Option<u64>,
    pub eos_token_id: Option<u32>,
    pub descriptor: DescriptorConfig,
}

/// Static metadata reported by `/api/tags`.
#[derive(Debug, Clone)]
pub struct DescriptorConfig {
    pub family: String,
    pub parameter_size: String,
    pub quantization_level: String,
    pub format: String,
    pub parent_model: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 11434),
            model_name: "local-7b".to_string(),
            model_path: PathBuf::from("models/model.ts"),
            tokenizer_path: PathBuf::from("models/tokenizer.json"),
            device: "cpu".to_string(),
            prompt_style: PromptStyle::Transcript,
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            default_temperature: 0.7,
            default_max_tokens: 512,
            default_top_p: 0.9,
            max_tokens_limit: 4096,
            stream_buffer: 32,
            request_timeout: None,
            seed: None,
            eos_token_id: None,
            descriptor: DescriptorConfig {
                family: "mistral".to_string(),
                parameter_size: "7B".to_string(),
                quantization_level: "fp16".to_string(),
                format: "torchscript".to_string(),
                parent_model: None,
            },
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = env::var("SERVER_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.listen_addr);

        let model_name = env::var("MODEL_NAME").unwrap_or(defaults.model_name);
        let model_path = env::var("MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.model_path);
        let tokenizer_path = env::var("TOKENIZER_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.tokenizer_path);
        let device = env::var("DEVICE").unwrap_or(defaults.device);

        let prompt_style = match env::var("PROMPT_STYLE") {
            Ok(raw) => raw.parse().map_err(anyhow::Error::msg)?,
            Err(_) => defaults.prompt_style,
        };

        // A prompt file takes precedence over the inline variable; an empty
        // value disables the default instruction entirely.
        let system_prompt = match env::var("SYSTEM_PROMPT_PATH") {
            Ok(path) => Some(fs::read_to_string(path)?.trim().to_string()),
            Err(_) => env::var("SYSTEM_PROMPT")
                .ok()
                .or(defaults.system_prompt),
        }
        .filter(|s| !s.trim().is_empty());

        let default_temperature = parse_env("DEFAULT_TEMPERATURE", defaults.default_temperature);
        let default_max_tokens = parse_env("DEFAULT_MAX_TOKENS", defaults.default_max_tokens);
        let default_top_p = parse_env("DEFAULT_TOP_P", defaults.default_top_p);
        let max_tokens_limit = parse_env("MAX_TOKENS_LIMIT", defaults.max_tokens_limit).max(1);
        let stream_buffer = parse_env("STREAM_BUFFER", defaults.stream_buffer).max(1);

        let request_timeout = env::var("REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs);
        let seed = env::var("SEED").ok().and_then(|v| v.parse().ok());
        let eos_token_id = env::var("EOS_TOKEN_ID").ok().and_then(|v| v.parse().ok());

        let descriptor = DescriptorConfig {
            family: env::var("MODEL_FAMILY").unwrap_or(defaults.descriptor.family),
            parameter_size: env::var("MODEL_PARAMETER_SIZE")
                .unwrap_or(defaults.descriptor.parameter_size),
            quantization_level: env::var("MODEL_QUANTIZATION")
                .unwrap_or(defaults.descriptor.quantization_level),
            format: env::var("MODEL_FORMAT").unwrap_or(defaults.descriptor.format),
            parent_model: env::var("MODEL_PARENT").ok(),
        };

        Ok(Self {
            listen_addr,
            model_name,
            model_path,
            tokenizer_path,
            device,
            prompt_style,
            system_prompt,
            default_temperature,
            default_max_tokens,
            default_top_p,
            max_tokens_limit,
            stream_buffer,
            request_timeout,
            seed,
            eos_token_id,
            descriptor,
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}
