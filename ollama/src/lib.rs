//! Ollama HTTP client implementing the core [`Oracle`] capability.
//!
//! Two endpoints matter: `POST /api/embed` for embeddings and
//! `POST /api/chat` (non-streaming, deterministic sampling) for
//! summarization and reranking. `GET /api/tags` doubles as a healthcheck.

use std::time::Duration;

use memory_bank_core::config::OllamaSettings;
use memory_bank_core::oracle::ChatRequest;
use memory_bank_core::oracle::Oracle;
use memory_bank_core::oracle::OracleError;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

/// Connect timeout for every request.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Deterministic sampling seed for chat calls.
const CHAT_SEED: u64 = 42;

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    embed_model: String,
    chat_model: String,
}

#[derive(Serialize)]
struct EmbedPayload<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl OllamaClient {
    pub fn new(
        base_url: impl Into<String>,
        embed_model: impl Into<String>,
        chat_model: impl Into<String>,
        read_timeout: Duration,
    ) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(read_timeout)
            .build()
            .map_err(|err| OracleError::Unreachable(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            embed_model: embed_model.into(),
            chat_model: chat_model.into(),
        })
    }

    pub fn from_settings(settings: &OllamaSettings) -> Result<Self, OracleError> {
        Self::new(
            settings.base_url.clone(),
            settings.embed_model.clone(),
            settings.chat_model.clone(),
            Duration::from_secs(settings.read_timeout_secs),
        )
    }

    /// Whether an Ollama server answers at the configured base URL.
    pub async fn is_running(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!("ollama healthcheck failed: {err}");
                false
            }
        }
    }

    fn map_send_error(&self, err: reqwest::Error) -> OracleError {
        if err.is_timeout() {
            return OracleError::Timeout;
        }
        if err.is_connect() {
            return OracleError::Unreachable(format!(
                "cannot connect to Ollama at {}",
                self.base_url
            ));
        }
        OracleError::Unreachable(err.to_string())
    }

    fn check_status(&self, status: reqwest::StatusCode, model: &str) -> Result<(), OracleError> {
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(OracleError::ModelMissing(format!(
                "model '{model}' not found; run: ollama pull {model}"
            )));
        }
        if !status.is_success() {
            return Err(OracleError::Malformed(format!(
                "ollama returned HTTP {status}"
            )));
        }
        Ok(())
    }
}

fn chat_payload(model: &str, request: &ChatRequest) -> serde_json::Value {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.push(json!({"role": "user", "content": request.prompt}));

    let mut payload = json!({
        "model": model,
        "messages": messages,
        "stream": false,
        "options": {
            "temperature": 0.0,
            "seed": CHAT_SEED,
            "top_k": 1,
        },
    });
    if request.json {
        payload["format"] = json!("json");
    }
    payload
}

impl Oracle for OllamaClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, OracleError> {
        let url = format!("{}/api/embed", self.base_url);
        let payload = EmbedPayload {
            model: &self.embed_model,
            input: texts,
        };

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| self.map_send_error(err))?;
        self.check_status(response.status(), &self.embed_model)?;

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|err| OracleError::Malformed(err.to_string()))?;
        if parsed.embeddings.len() != texts.len() {
            return Err(OracleError::Malformed(format!(
                "requested {} embeddings, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        Ok(parsed.embeddings)
    }

    async fn chat(&self, request: ChatRequest) -> Result<String, OracleError> {
        let url = format!("{}/api/chat", self.base_url);
        let payload = chat_payload(&self.chat_model, &request);

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| self.map_send_error(err))?;
        self.check_status(response.status(), &self.chat_model)?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| OracleError::Malformed(err.to_string()))?;
        Ok(parsed.message.content)
    }
}
