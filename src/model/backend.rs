use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::{error::ServiceError, model::GenerationParams};

/// A causal language model able to continue a tokenized prompt.
///
/// Implementations are called from the blocking thread pool and must be safe
/// to share across requests.
pub trait LanguageModel: Send + Sync {
    /// Generates up to `params.max_new_tokens` ids following `prompt_ids` and
    /// returns only the new ids. A stop token ends generation and is not
    /// included. Implementations check `cancel` between decode steps.
    fn generate(
        &self,
        prompt_ids: &[u32],
        params: &GenerationParams,
        cancel: &CancelFlag,
    ) -> Result<Vec<u32>, ServiceError>;

    fn info(&self) -> BackendInfo;
}

#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub dtype: String,
    pub device: String,
}

/// Cooperative cancellation shared between a request and its blocking task.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Returns a guard that cancels this flag when dropped unless disarmed.
    pub fn guard(&self) -> CancelGuard {
        CancelGuard {
            flag: self.clone(),
            armed: true,
        }
    }

    pub fn check(&self) -> Result<(), ServiceError> {
        if self.is_cancelled() {
            Err(ServiceError::Inference("generation cancelled".into()))
        } else {
            Ok(())
        }
    }
}

/// Cancels the decode loop if the waiting request goes away first.
#[derive(Debug)]
pub struct CancelGuard {
    flag: CancelFlag,
    armed: bool,
}

impl CancelGuard {
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.flag.cancel();
        }
    }
}
