//! The embedding-plus-chat capability.
//!
//! The oracle is passed in by the caller everywhere it is needed; core never
//! constructs one. Tests substitute a deterministic fake.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum OracleError {
    #[error("oracle unreachable: {0}")]
    Unreachable(String),

    #[error("model not available: {0}")]
    ModelMissing(String),

    #[error("oracle request timed out")]
    Timeout,

    #[error("malformed oracle response: {0}")]
    Malformed(String),
}

/// A chat request with deterministic sampling defaults.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system: Option<String>,
    pub prompt: String,
    /// Ask the model to emit a JSON object.
    pub json: bool,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            json: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn as_json(mut self) -> Self {
        self.json = true;
        self
    }
}

pub trait Oracle: Send + Sync {
    /// Embed each text into a fixed-dimension vector.
    fn embed(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, OracleError>> + Send;

    /// Run a single chat completion.
    fn chat(&self, request: ChatRequest) -> impl Future<Output = Result<String, OracleError>> + Send;
}

/// Retry an oracle call once with a short backoff. Used at the build and
/// search boundaries; transient failures inside the pack path degrade
/// instead of retrying.
pub(crate) async fn with_retry<T, F, Fut>(mut call: F) -> Result<T, OracleError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OracleError>>,
{
    match call().await {
        Ok(value) => Ok(value),
        Err(err) => {
            tracing::warn!("oracle call failed, retrying once: {err}");
            tokio::time::sleep(Duration::from_millis(500)).await;
            call().await
        }
    }
}
