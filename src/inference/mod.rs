//! Inference Client: OpenAI-compatible streaming completions.
//!
//! This module handles all communication with the completion endpoint:
//! - Streaming chat completions over SSE
//! - Model configuration (`model:` section of `switchboard.yaml`)
//! - Extracting invocation directives from model output
//!
//! The client speaks the OpenAI Chat Completions API, so switching models
//! is a config change, not a code change.

pub mod client;
pub mod config;
pub mod directive_parser;
pub mod errors;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use client::{CompletionEngine, InferenceClient, TextStream};
pub use config::ModelConfig;
pub use directive_parser::{extract_directives, InvocationDirective};
pub use errors::InferenceError;
pub use types::{ChatMessage, Role};
