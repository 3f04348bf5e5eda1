use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use axum::http::HeaderValue;
#[cfg(feature = "tch-backend")]
use tch::Device;

use crate::{error::ServiceError, model::TemplateKind};

pub const DEFAULT_MODEL_ID: &str = "meta-llama/Llama-3.1-8B-Instruct";
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:3000";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_id: String,
    pub revision: Option<String>,
    pub module_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub dtype: ModelDtype,
    pub chat_template: TemplateKind,
    pub system_prompt: Option<String>,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    pub seed: Option<u64>,
    pub max_prompt_chars: usize,
    pub max_prompt_tokens: usize,
    pub max_concurrent_generations: usize,
    pub generation_timeout: Duration,
    pub cors_allowed_origins: Vec<String>,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

/// Weight precision requested for the loaded checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelDtype {
    /// Half precision on accelerators, full precision on CPU.
    Auto,
    Float16,
    BFloat16,
    Float32,
}

impl FromStr for ModelDtype {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "auto" => Ok(ModelDtype::Auto),
            "float16" | "fp16" | "half" => Ok(ModelDtype::Float16),
            "bfloat16" | "bf16" => Ok(ModelDtype::BFloat16),
            "float32" | "fp32" | "float" => Ok(ModelDtype::Float32),
            other => Err(ServiceError::Config(format!("unknown MODEL_DTYPE '{other}'"))),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ServiceError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup, so callers other
    /// than the process environment can supply settings.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ServiceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("SERVER_ADDR")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000));

        let model_id = lookup("MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string());
        let revision = lookup("MODEL_REVISION").filter(|v| !v.is_empty());

        let module_path = PathBuf::from(
            lookup("MODULE_PATH").unwrap_or_else(|| "models/model.ts".to_string()),
        );
        let tokenizer_path = PathBuf::from(
            lookup("TOKENIZER_PATH").unwrap_or_else(|| "models/tokenizer.json".to_string()),
        );

        let dtype = match lookup("MODEL_DTYPE") {
            Some(raw) => raw.parse()?,
            None => ModelDtype::Auto,
        };
        let chat_template = match lookup("CHAT_TEMPLATE") {
            Some(raw) => raw.parse()?,
            None => TemplateKind::Llama3,
        };
        let system_prompt = lookup("SYSTEM_PROMPT").filter(|v| !v.trim().is_empty());

        let max_new_tokens = parse_var(&lookup, "MAX_NEW_TOKENS").unwrap_or(100);
        let temperature = parse_var(&lookup, "TEMPERATURE").unwrap_or(0.6);
        let top_k = parse_var(&lookup, "TOP_K").unwrap_or(50);
        let top_p = parse_var(&lookup, "TOP_P").unwrap_or(0.9);
        let seed = parse_var(&lookup, "SEED");

        let max_prompt_chars = parse_var(&lookup, "MAX_PROMPT_CHARS").unwrap_or(16_384);
        let max_prompt_tokens = parse_var(&lookup, "MAX_PROMPT_TOKENS").unwrap_or(4_096);
        let max_concurrent_generations = parse_var(&lookup, "MAX_CONCURRENT_GENERATIONS")
            .filter(|&n: &usize| n > 0)
            .unwrap_or(1);
        let generation_timeout = parse_var(&lookup, "GENERATION_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(120));

        let cors_allowed_origins = lookup("CORS_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| vec![DEFAULT_CORS_ORIGIN.to_string()]);
        if let Some(bad) = cors_allowed_origins
            .iter()
            .find(|origin| HeaderValue::from_str(origin).is_err())
        {
            return Err(ServiceError::Config(format!("invalid CORS origin '{bad}'")));
        }
        // Credentialed CORS cannot use a wildcard origin.
        if cors_allowed_origins.iter().any(|origin| origin == "*") {
            return Err(ServiceError::Config(
                "CORS_ALLOWED_ORIGINS cannot contain '*' when credentials are allowed".into(),
            ));
        }

        #[cfg(feature = "tch-backend")]
        let device = {
            let raw = lookup("DEVICE").unwrap_or_else(|| "auto".into());
            parse_device(&raw)
        };

        Ok(Self {
            listen_addr,
            model_id,
            revision,
            module_path,
            tokenizer_path,
            dtype,
            chat_template,
            system_prompt,
            max_new_tokens,
            temperature,
            top_k,
            top_p,
            seed,
            max_prompt_chars,
            max_prompt_tokens,
            max_concurrent_generations,
            generation_timeout,
            cors_allowed_origins,
            #[cfg(feature = "tch-backend")]
            device,
        })
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "auto" {
        Device::cuda_if_available()
    } else if lower == "cpu" {
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
            tracing::warn!(requested = raw, "CUDA unavailable, falling back to CPU");
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ServiceError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_the_reference_deployment() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:8000");
        assert_eq!(config.model_id, DEFAULT_MODEL_ID);
        assert_eq!(config.revision, None);
        assert_eq!(config.max_new_tokens, 100);
        assert_eq!(config.chat_template, TemplateKind::Llama3);
        assert_eq!(config.dtype, ModelDtype::Auto);
        assert_eq!(config.cors_allowed_origins, vec![DEFAULT_CORS_ORIGIN]);
        assert_eq!(config.max_concurrent_generations, 1);
        assert_eq!(config.generation_timeout, Duration::from_secs(120));
        assert!(config.system_prompt.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("SERVER_ADDR", "0.0.0.0:9000"),
            ("MAX_NEW_TOKENS", "32"),
            ("TEMPERATURE", "0"),
            ("MODEL_DTYPE", "bf16"),
            ("CHAT_TEMPLATE", "chatml"),
            ("SEED", "7"),
            ("GENERATION_TIMEOUT_SECS", "5"),
            ("CORS_ALLOWED_ORIGINS", "http://a.test, http://b.test,"),
            ("SYSTEM_PROMPT", "You are AgriBot, a smart farming assistant."),
        ])
        .unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.max_new_tokens, 32);
        assert_eq!(config.temperature, 0.0);
        assert_eq!(config.dtype, ModelDtype::BFloat16);
        assert_eq!(config.chat_template, TemplateKind::ChatMl);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.generation_timeout, Duration::from_secs(5));
        assert_eq!(
            config.cors_allowed_origins,
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
        assert!(config.system_prompt.unwrap().starts_with("You are AgriBot"));
    }

    #[test]
    fn unparseable_numbers_fall_back_to_defaults() {
        let config = config_from(&[
            ("MAX_NEW_TOKENS", "lots"),
            ("MAX_CONCURRENT_GENERATIONS", "0"),
        ])
        .unwrap();
        assert_eq!(config.max_new_tokens, 100);
        assert_eq!(config.max_concurrent_generations, 1);
    }

    #[test]
    fn unknown_enumerations_are_rejected() {
        assert!(matches!(
            config_from(&[("MODEL_DTYPE", "int3")]),
            Err(ServiceError::Config(_))
        ));
        assert!(matches!(
            config_from(&[("CHAT_TEMPLATE", "alpaca")]),
            Err(ServiceError::Config(_))
        ));
        assert!(matches!(
            config_from(&[("CORS_ALLOWED_ORIGINS", "http://ok.test,bad\norigin")]),
            Err(ServiceError::Config(_))
        ));
        assert!(matches!(
            config_from(&[("CORS_ALLOWED_ORIGINS", "*")]),
            Err(ServiceError::Config(_))
        ));
        assert!(matches!(
            config_from(&[("CORS_ALLOWED_ORIGINS", "http://localhost:3000, *")]),
            Err(ServiceError::Config(_))
        ));
    }
}
