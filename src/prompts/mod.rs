//! Prompt templates for LLM-based operations.

pub mod screening;

pub use screening::*;
