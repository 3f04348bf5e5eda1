use std::{sync::Arc, time::Duration, time::Instant};

use tokio::{sync::Semaphore, task, time};

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        CancelFlag, ChatMessage, ChatTemplate, Generation, GenerationParams, GenerationRequest,
        LanguageModel, ModelMetadata, TextTokenizer, tokenizer::resolve_stop_tokens,
    },
};

/// Process-wide model handles plus the request pipeline around them.
pub struct ModelRegistry {
    tokenizer: Arc<dyn TextTokenizer>,
    model: Arc<dyn LanguageModel>,
    template: Box<dyn ChatTemplate>,
    system_prompt: Option<String>,
    params: GenerationParams,
    max_prompt_chars: usize,
    max_prompt_tokens: usize,
    permits: Arc<Semaphore>,
    timeout: Duration,
    metadata: ModelMetadata,
}

impl ModelRegistry {
    /// Loads the tokenizer and model named by `config`.
    #[cfg(feature = "tch-backend")]
    pub fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        let tokenizer = super::tokenizer::load_tokenizer(config)?;
        let model = super::loader::TorchModel::load(config)?;
        Ok(Self::from_parts(config, Arc::new(tokenizer), Arc::new(model)))
    }

    #[cfg(not(feature = "tch-backend"))]
    pub fn initialize(_config: &AppConfig) -> Result<Self, ServiceError> {
        Err(ServiceError::Config(
            "built without a model backend; enable the `tch-backend` feature".into(),
        ))
    }

    /// Assembles a registry around already-loaded handles.
    pub fn from_parts(
        config: &AppConfig,
        tokenizer: Arc<dyn TextTokenizer>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        let template = config.chat_template.build();
        let stop_token_ids = resolve_stop_tokens(tokenizer.as_ref(), template.stop_sequences());
        let info = model.info();

        let metadata = ModelMetadata {
            model_id: config.model_id.clone(),
            revision: config.revision.clone(),
            dtype: info.dtype,
            device: info.device,
            chat_template: config.chat_template.to_string(),
            max_new_tokens: config.max_new_tokens,
        };

        Self {
            tokenizer,
            model,
            template,
            system_prompt: config.system_prompt.clone(),
            params: GenerationParams {
                max_new_tokens: config.max_new_tokens,
                temperature: config.temperature,
                top_k: config.top_k,
                top_p: config.top_p,
                stop_token_ids,
            },
            max_prompt_chars: config.max_prompt_chars,
            max_prompt_tokens: config.max_prompt_tokens,
            permits: Arc::new(Semaphore::new(config.max_concurrent_generations)),
            timeout: config.generation_timeout,
            metadata,
        }
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// Templates and tokenizes `prompt`, checking the configured bounds.
    fn prepare(&self, prompt: &str) -> Result<Vec<u32>, ServiceError> {
        let chars = prompt.chars().count();
        if chars > self.max_prompt_chars {
            return Err(ServiceError::PromptTooLong {
                actual: chars,
                limit: self.max_prompt_chars,
                unit: "characters",
            });
        }

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = self.system_prompt.as_ref() {
            messages.push(ChatMessage::system(system.as_str()));
        }
        messages.push(ChatMessage::user(prompt));
        let rendered = self.template.apply(&messages);

        let mut prompt_ids = self.tokenizer.encode(&rendered)?;
        if prompt_ids.is_empty() {
            // Only an untemplated empty prompt gets here; seed with id 0.
            prompt_ids.push(0);
        }
        if prompt_ids.len() > self.max_prompt_tokens {
            return Err(ServiceError::PromptTooLong {
                actual: prompt_ids.len(),
                limit: self.max_prompt_tokens,
                unit: "tokens",
            });
        }
        Ok(prompt_ids)
    }

    pub async fn generate(&self, request: GenerationRequest) -> Result<Generation, ServiceError> {
        let prompt_ids = self.prepare(&request.prompt)?;
        let prompt_tokens = prompt_ids.len();

        let model = self.model.clone();
        let params = self.params.clone();
        let permits = self.permits.clone();
        let cancel = CancelFlag::new();
        let worker_cancel = cancel.clone();
        let start = Instant::now();

        let work = async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|err| ServiceError::Other(format!("worker pool closed: {err}")))?;
            task::spawn_blocking(move || {
                // Held until the decode loop returns, even after a timeout.
                let _permit = permit;
                model.generate(&prompt_ids, &params, &worker_cancel)
            })
            .await
            .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
        };

        // Dropping this future (client gone) or timing out cancels the worker.
        let guard = cancel.guard();
        let generated_ids = match time::timeout(self.timeout, work).await {
            Ok(result) => {
                guard.disarm();
                result?
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, prompt_tokens, "generation timed out");
                return Err(ServiceError::Timeout(self.timeout));
            }
        };

        let text = self.tokenizer.decode(&generated_ids)?;
        let generation = Generation {
            text,
            prompt_tokens,
            generated_tokens: generated_ids.len(),
            elapsed: start.elapsed(),
        };

        tracing::info!(
            prompt_tokens,
            generated_tokens = generation.generated_tokens,
            elapsed_ms = generation.elapsed.as_millis() as u64,
            tokens_per_second = generation.tokens_per_second(),
            "generation complete"
        );

        Ok(generation)
    }
}
