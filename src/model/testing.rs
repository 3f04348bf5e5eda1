//! Stub tokenizer and models for exercising the pipeline without weights.

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{BackendInfo, CancelFlag, GenerationParams, LanguageModel, TemplateKind, TextTokenizer},
};

pub fn test_config(template: TemplateKind) -> AppConfig {
    let mut config = AppConfig::from_lookup(|_| None).expect("default config");
    config.chat_template = template;
    config.temperature = 0.0;
    config
}

/// One id per byte. Ids above 255 are special tokens and decode to nothing.
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const EOT_ID: u32 = 256;
    pub const END_OF_TEXT_ID: u32 = 257;
}

impl TextTokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, ServiceError> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String, ServiceError> {
        let bytes: Vec<u8> = ids.iter().filter_map(|&id| u8::try_from(id).ok()).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        match token {
            "<|eot_id|>" => Some(Self::EOT_ID),
            "<|end_of_text|>" => Some(Self::END_OF_TEXT_ID),
            _ => None,
        }
    }
}

fn stub_info() -> BackendInfo {
    BackendInfo {
        dtype: "float32".into(),
        device: "stub".into(),
    }
}

/// Continues with the prompt itself, so each response identifies its request.
#[derive(Default)]
pub struct EchoModel {
    pub calls: AtomicUsize,
}

impl LanguageModel for EchoModel {
    fn generate(
        &self,
        prompt_ids: &[u32],
        params: &GenerationParams,
        cancel: &CancelFlag,
    ) -> Result<Vec<u32>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        cancel.check()?;
        Ok(prompt_ids
            .iter()
            .copied()
            .take(params.max_new_tokens)
            .collect())
    }

    fn info(&self) -> BackendInfo {
        stub_info()
    }
}

/// Emits a fixed id sequence, honouring stop ids and the token cap.
pub struct ScriptedModel {
    script: Vec<u32>,
}

impl ScriptedModel {
    pub fn new(text: &str) -> Self {
        Self::with_ids(text.bytes().map(u32::from).collect())
    }

    pub fn with_ids(script: Vec<u32>) -> Self {
        Self { script }
    }
}

impl LanguageModel for ScriptedModel {
    fn generate(
        &self,
        _prompt_ids: &[u32],
        params: &GenerationParams,
        cancel: &CancelFlag,
    ) -> Result<Vec<u32>, ServiceError> {
        let mut generated = Vec::new();
        for &id in self.script.iter().take(params.max_new_tokens) {
            cancel.check()?;
            if params.stop_token_ids.contains(&id) {
                break;
            }
            generated.push(id);
        }
        Ok(generated)
    }

    fn info(&self) -> BackendInfo {
        stub_info()
    }
}

/// Takes 10ms per step until cancelled.
#[derive(Default)]
pub struct SlowModel {
    pub observed_cancel: AtomicBool,
}

impl LanguageModel for SlowModel {
    fn generate(
        &self,
        _prompt_ids: &[u32],
        _params: &GenerationParams,
        cancel: &CancelFlag,
    ) -> Result<Vec<u32>, ServiceError> {
        for _ in 0..1_000 {
            if let Err(err) = cancel.check() {
                self.observed_cancel.store(true, Ordering::SeqCst);
                return Err(err);
            }
            thread::sleep(Duration::from_millis(10));
        }
        Ok(Vec::new())
    }

    fn info(&self) -> BackendInfo {
        stub_info()
    }
}
