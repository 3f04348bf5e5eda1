use std::{fs, time::Instant};

use parking_lot::Mutex;
use tch::{Device, IValue, Kind, Tensor, no_grad};

use crate::{
    config::{AppConfig, ModelDtype},
    error::ServiceError,
    model::{BackendInfo, CancelFlag, GenerationParams, LanguageModel},
};

/// A TorchScript causal LM exported from a pretrained checkpoint.
pub struct TorchModel {
    device: Device,
    kind: Kind,
    module: Mutex<tch::CModule>,
}

impl TorchModel {
    pub fn load(config: &AppConfig) -> Result<Self, ServiceError> {
        let module_path = config.module_path.as_path();
        if !module_path.exists() {
            return Err(ServiceError::Other(format!(
                "model artifact missing: {}",
                module_path.display()
            )));
        }
        let size_bytes = fs::metadata(module_path)?.len();

        if let Some(seed) = config.seed {
            tch::manual_seed(seed as i64);
        }

        let device = config.device;
        let kind = resolve_kind(config.dtype, device);
        let start = Instant::now();

        let mut module = tch::CModule::load_on_device(module_path, device)?;
        module.to(device, kind, false);
        module.set_eval();

        tracing::info!(
            path = %module_path.display(),
            size_bytes,
            ?device,
            ?kind,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model loaded"
        );

        Ok(Self {
            device,
            kind,
            module: Mutex::new(module),
        })
    }
}

impl LanguageModel for TorchModel {
    fn generate(
        &self,
        prompt_ids: &[u32],
        params: &GenerationParams,
        cancel: &CancelFlag,
    ) -> Result<Vec<u32>, ServiceError> {
        let mut input_ids: Vec<i64> = prompt_ids.iter().map(|&id| i64::from(id)).collect();
        let mut generated = Vec::with_capacity(params.max_new_tokens);

        no_grad(|| {
            let module = self.module.lock();

            for _ in 0..params.max_new_tokens {
                cancel.check()?;

                let input_tensor = Tensor::from_slice(&input_ids)
                    .reshape([1, input_ids.len() as i64])
                    .to(self.device);

                // Traced exports return either bare logits or (logits, past).
                let output = module.forward_is(&[IValue::Tensor(input_tensor)])?;
                let logits = match output {
                    IValue::Tensor(t) => t,
                    IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                        IValue::Tensor(t) => t.shallow_clone(),
                        _ => {
                            return Err(ServiceError::Inference(
                                "expected tensor as first tuple element".into(),
                            ));
                        }
                    },
                    _ => {
                        return Err(ServiceError::Inference(
                            "unexpected model output format".into(),
                        ));
                    }
                };

                // [1, seq_len, vocab] -> [vocab]
                let last_logits = logits.select(1, -1).squeeze_dim(0).to_kind(Kind::Float);
                let next = sample_next(&last_logits, params);
                let next = u32::try_from(next).map_err(|_| {
                    ServiceError::Inference(format!("model produced invalid token id {next}"))
                })?;

                if params.stop_token_ids.contains(&next) {
                    break;
                }
                input_ids.push(i64::from(next));
                generated.push(next);
            }

            Ok::<(), ServiceError>(())
        })?;

        Ok(generated)
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            dtype: kind_name(self.kind).to_string(),
            device: format!("{:?}", self.device),
        }
    }
}

fn resolve_kind(dtype: ModelDtype, device: Device) -> Kind {
    match dtype {
        ModelDtype::Auto if device.is_cuda() => Kind::Half,
        ModelDtype::Auto => Kind::Float,
        ModelDtype::Float16 => Kind::Half,
        ModelDtype::BFloat16 => Kind::BFloat16,
        ModelDtype::Float32 => Kind::Float,
    }
}

fn kind_name(kind: Kind) -> &'static str {
    match kind {
        Kind::Half => "float16",
        Kind::BFloat16 => "bfloat16",
        _ => "float32",
    }
}

/// Picks the next token from last-position logits: greedy when temperature is
/// not positive, otherwise temperature + top-k + nucleus sampling.
fn sample_next(logits: &Tensor, params: &GenerationParams) -> i64 {
    if params.is_greedy() {
        return logits.argmax(0, false).int64_value(&[]);
    }

    let scaled = logits / params.temperature;
    let vocab = scaled.size()[0];
    let k = match params.top_k {
        0 => vocab,
        top_k => (top_k as i64).min(vocab),
    };

    // topk with sorted=true gives descending probabilities for the nucleus cut.
    let (values, indices) = scaled.topk(k, -1, true, true);
    let mut probs = values.softmax(-1, Kind::Float);
    if params.top_p > 0.0 && params.top_p < 1.0 {
        let cumulative = probs.cumsum(-1, Kind::Float);
        let outside_nucleus = (&cumulative - &probs).gt(params.top_p);
        probs = probs.masked_fill(&outside_nucleus, 0.0);
        probs = &probs / probs.sum(Kind::Float);
    }

    let choice = probs.multinomial(1, false);
    indices.gather(0, &choice, false).int64_value(&[0])
}
