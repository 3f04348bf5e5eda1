pub mod config;
pub mod error;
pub mod model;
pub mod server;

pub use config::AppConfig;
pub use error::ServiceError;
pub use model::{GenerationRequest, GenerationResponse, ModelRegistry};
pub use server::build_router;
