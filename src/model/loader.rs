use std::{ops::ControlFlow, time::Instant};

use parking_lot::Mutex;
use tch::{Device, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;
use tracing::info;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{GenerationParams, InferenceBackend, TokenSink, output::END_MARKERS},
    prompt::BOS_MARKER,
};

/// TorchScript causal LM driven token by token through its traced forward
/// pass.
pub struct TorchBackend {
    tokenizer: Tokenizer,
    module: Mutex<tch::CModule>,
    device: Device,
    eos_ids: Vec<u32>,
}

impl TorchBackend {
    pub fn load(config: &AppConfig) -> Result<Self, ServiceError> {
        let start = Instant::now();
        let tokenizer = Tokenizer::from_file(config.tokenizer_path.as_path())
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;

        if !config.model_path.exists() {
            return Err(ServiceError::Other(format!(
                "model artifact missing: {}",
                config.model_path.display()
            )));
        }
        let device = parse_device(&config.device);
        let mut module = tch::CModule::load_on_device(&config.model_path, device)
            .map_err(|e| ServiceError::Inference(e.to_string()))?;
        module.set_eval();

        if let Some(seed) = config.seed {
            tch::manual_seed(seed as i64);
        }

        let mut eos_ids: Vec<u32> = END_MARKERS
            .iter()
            .filter_map(|marker| tokenizer.token_to_id(marker))
            .collect();
        eos_ids.extend(config.eos_token_id);

        info!(
            path = %config.model_path.display(),
            device = ?device,
            eos_ids = ?eos_ids,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "torchscript module loaded"
        );

        Ok(Self {
            tokenizer,
            module: Mutex::new(module),
            device,
            eos_ids,
        })
    }

    fn forward(&self, module: &tch::CModule, ids: &[i64]) -> Result<Tensor, ServiceError> {
        let input = Tensor::from_slice(ids)
            .reshape([1, ids.len() as i64])
            .to(self.device);

        // Traced models return either bare logits or a (logits, past) tuple.
        let output = module
            .forward_is(&[tch::IValue::Tensor(input)])
            .map_err(|e| ServiceError::Inference(e.to_string()))?;
        match output {
            tch::IValue::Tensor(t) => Ok(t),
            tch::IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                tch::IValue::Tensor(t) => Ok(t.shallow_clone()),
                _ => Err(ServiceError::Inference(
                    "expected tensor as first tuple element".into(),
                )),
            },
            _ => Err(ServiceError::Inference(
                "unexpected model output format".into(),
            )),
        }
    }
}

impl InferenceBackend for TorchBackend {
    fn device(&self) -> String {
        match self.device {
            Device::Cuda(idx) => format!("cuda:{idx}"),
            Device::Mps => "mps".to_string(),
            _ => "cpu".to_string(),
        }
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>, ServiceError> {
        // Envelope prompts already spell out the BOS marker.
        let add_special = !text.starts_with(BOS_MARKER);
        let encoding = self
            .tokenizer
            .encode(text, add_special)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn generate(
        &self,
        prompt: &[u32],
        params: &GenerationParams,
        sink: &mut TokenSink<'_>,
    ) -> Result<Vec<u32>, ServiceError> {
        let mut ids: Vec<i64> = prompt.iter().map(|&id| i64::from(id)).collect();
        if ids.is_empty() {
            ids.push(0);
        }

        no_grad(|| {
            let module = self.module.lock();

            for _ in 0..params.max_tokens {
                let logits = self.forward(&module, &ids)?;
                // [1, seq_len, vocab] -> [vocab] at the last position
                let last = logits.select(1, -1).squeeze().to_kind(Kind::Float);
                let next = sample_next(&last, params)?;
                ids.push(next);

                let token = next as u32;
                if self.eos_ids.contains(&token) {
                    break;
                }
                if let ControlFlow::Break(()) = sink(token) {
                    break;
                }
            }
            Ok::<(), ServiceError>(())
        })?;

        Ok(ids.into_iter().map(|id| id as u32).collect())
    }

    fn detokenize(&self, ids: &[u32]) -> Result<String, ServiceError> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }
}

/// Greedy argmax at temperature zero, otherwise nucleus sampling over the
/// temperature-scaled distribution.
fn sample_next(logits: &Tensor, params: &GenerationParams) -> Result<i64, ServiceError> {
    if !params.do_sample() {
        return logits
            .f_argmax(0, false)
            .and_then(|best| best.f_int64_value(&[]))
            .map_err(tensor_error);
    }

    // Shifting by the max keeps the scaled logits at or below zero, so a tiny
    // temperature saturates to -inf instead of overflowing to NaN.
    let scaled = logits
        .f_sub(&logits.f_max().map_err(tensor_error)?)
        .and_then(|shifted| shifted.f_div_scalar(params.temperature))
        .map_err(tensor_error)?;
    let probs = scaled.f_softmax(-1, Kind::Float).map_err(tensor_error)?;
    let (sorted, indices) = probs.f_sort(-1, true).map_err(tensor_error)?;

    let candidates = if params.top_p >= 1.0 {
        sorted
    } else {
        // Keep the smallest prefix whose mass reaches top_p; the first token
        // always survives.
        let cumulative = sorted.f_cumsum(-1, Kind::Float).map_err(tensor_error)?;
        let outside = cumulative
            .f_sub(&sorted)
            .and_then(|before| before.f_gt(params.top_p))
            .map_err(tensor_error)?;
        sorted.f_masked_fill(&outside, 0.0).map_err(tensor_error)?
    };

    candidates
        .f_multinomial(1, false)
        .and_then(|choice| indices.f_gather(0, &choice, false))
        .and_then(|picked| picked.f_int64_value(&[0]))
        .map_err(tensor_error)
}

fn tensor_error(err: tch::TchError) -> ServiceError {
    ServiceError::Inference(format!("sampling failed: {err}"))
}

fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            Device::Cpu
        }
    } else if lower == "mps" && tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::Cpu
    }
}
