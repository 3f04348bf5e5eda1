mod backend;
mod chat_template;
mod registry;
mod tokenizer;
mod types;

#[cfg(feature = "tch-backend")]
mod loader;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BackendInfo, CancelFlag, CancelGuard, LanguageModel};
pub use chat_template::{
    ChatMessage, ChatMlTemplate, ChatTemplate, Llama3Template, RawTemplate, TemplateKind,
};
#[cfg(feature = "tch-backend")]
pub use loader::TorchModel;
pub use registry::ModelRegistry;
pub use tokenizer::{TextTokenizer, load_tokenizer};
pub use types::{Generation, GenerationParams, GenerationRequest, GenerationResponse, ModelMetadata};
