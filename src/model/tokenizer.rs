use std::ops::Deref;

use tokenizers::{FromPretrainedParameters, Tokenizer};

use crate::{config::AppConfig, error::ServiceError};

/// Text <-> token id conversion used by the generation pipeline.
pub trait TextTokenizer: Send + Sync {
    /// Encodes already-templated text. No special tokens are added, the chat
    /// template carries its own.
    fn encode(&self, text: &str) -> Result<Vec<u32>, ServiceError>;

    /// Decodes generated ids, dropping special tokens.
    fn decode(&self, ids: &[u32]) -> Result<String, ServiceError>;

    fn token_id(&self, token: &str) -> Option<u32>;
}

impl TextTokenizer for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, ServiceError> {
        // The wrapper derefs to `TokenizerImpl`, which owns the inherent methods.
        let encoding = self
            .deref()
            .encode(text, false)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String, ServiceError> {
        self.deref()
            .decode(ids, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.token_to_id(token)
    }
}

/// Loads the tokenizer from `tokenizer_path`, or from the hub by model id when
/// no local file is present.
pub fn load_tokenizer(config: &AppConfig) -> Result<Tokenizer, ServiceError> {
    if config.tokenizer_path.exists() {
        tracing::info!(path = %config.tokenizer_path.display(), "loading tokenizer from file");
        return Tokenizer::from_file(config.tokenizer_path.as_path())
            .map_err(|e| ServiceError::Tokenizer(e.to_string()));
    }

    tracing::info!(model_id = %config.model_id, "downloading tokenizer from the hub");
    let mut params = FromPretrainedParameters::default();
    if let Some(revision) = config.revision.as_ref() {
        params.revision = revision.clone();
    }
    Tokenizer::from_pretrained(&config.model_id, Some(params))
        .map_err(|e| ServiceError::Tokenizer(e.to_string()))
}

/// Maps stop sequences to token ids, skipping those the vocabulary lacks.
pub fn resolve_stop_tokens(tokenizer: &dyn TextTokenizer, sequences: &[&str]) -> Vec<u32> {
    let mut ids: Vec<u32> = Vec::with_capacity(sequences.len());
    for seq in sequences {
        match tokenizer.token_id(seq) {
            Some(id) if !ids.contains(&id) => ids.push(id),
            Some(_) => {}
            None => tracing::debug!(token = *seq, "stop sequence not in vocabulary"),
        }
    }
    ids
}
