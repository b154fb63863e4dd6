//! Engine configuration: document model, generation and validation.

pub mod generator;
pub mod model;
mod outbound;
pub mod validator;

pub use generator::{ConfigGenerator, GenerateOptions, GeneratedConfig, NodeDescriptor, RESERVED_TAGS};
pub use model::EngineConfig;
pub use validator::ValidationResult;
