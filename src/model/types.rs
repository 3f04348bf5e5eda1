use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationResponse {
    pub response: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub model_id: String,
    pub revision: Option<String>,
    pub dtype: String,
    pub device: String,
    pub chat_template: String,
    pub max_new_tokens: usize,
}

/// Decoding settings handed to a [`LanguageModel`](super::LanguageModel).
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    /// Token ids that end the assistant turn. The stop token itself is not
    /// part of the returned continuation.
    pub stop_token_ids: Vec<u32>,
}

impl GenerationParams {
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

/// Outcome of one generation call.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub elapsed: Duration,
}

impl Generation {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.generated_tokens as f64 / secs
        } else {
            self.generated_tokens as f64
        }
    }
}
