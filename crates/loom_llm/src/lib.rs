//! # loom_llm
//!
//! Chat-completions client for AppLoom.
//!
//! Implements the pipeline's [`loom_core::CodeGenerationService`] and the
//! preview supervisor's [`loom_runner::FailureFixer`] against any
//! OpenAI-compatible endpoint (OpenRouter by default).

pub mod client;
pub mod config;
pub mod error;
pub mod parse;
pub mod prompts;

pub use client::{Completion, LlmClient};
pub use config::LlmConfig;
pub use error::{LlmError, LlmResult};
