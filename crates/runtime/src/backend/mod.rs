//! Text generation backends.
//!
//! The decision loop only needs "prompt in, text out". Anything that can do
//! that implements [`Generator`].

mod anthropic;

pub use anthropic::{AnthropicBackend, AnthropicBackendBuilder, DEFAULT_MODEL};

use std::future::Future;

use crate::Result;

/// Produces raw model text for a prompt.
pub trait Generator: Send + Sync {
    fn generate(&self, prompt: &str) -> impl Future<Output = Result<String>> + Send;
}
