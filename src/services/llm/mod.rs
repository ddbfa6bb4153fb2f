//! Completer Module
//!
//! The completer is the LLM oracle behind rewrites, transform ranking, and
//! snipe proposals. It is a generic capability: the rest of the system only
//! sees the `Completer` trait, with one HTTP implementation for
//! OpenAI-compatible endpoints.

pub mod client;
pub mod error;

pub use client::{Completer, HttpCompleter};
pub use error::CompleterError;
