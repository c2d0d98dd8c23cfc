//! The per-store `config.json` document.
//!
//! Every field has a serde default so older stores keep loading as the
//! schema grows; unknown keys are preserved-by-ignore rather than rejected.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

pub const CONFIG_VERSION: &str = "1.0";
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_CHAT_MODEL: &str = "gemma3:4b";

pub const DEFAULT_MAX_TOKENS: u32 = 512;
pub const DEFAULT_OVERLAP_TOKENS: u32 = 50;
pub const DEFAULT_HALF_LIFE_DAYS: f64 = 14.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBankConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub ollama: OllamaSettings,
    #[serde(default)]
    pub chunking: ChunkingSettings,
    #[serde(default)]
    pub decay: DecaySettings,
    /// Per-mode overrides of the built-in section weights:
    /// `{"debug": {"recent_context": 0.8}}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pack_modes: BTreeMap<String, BTreeMap<String, f64>>,
    /// Multiplicative score boost per chunk source type, default 1.0.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_boosts: BTreeMap<String, f64>,
    #[serde(default)]
    pub redaction: RedactionSettings,
}

impl Default for MemoryBankConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            schema_version: default_schema_version(),
            ollama: OllamaSettings::default(),
            chunking: ChunkingSettings::default(),
            decay: DecaySettings::default(),
            pack_modes: BTreeMap::new(),
            source_boosts: BTreeMap::new(),
            redaction: RedactionSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OllamaSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_embed_model")]
    pub embed_model: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    /// Read timeout for oracle requests, in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            embed_model: default_embed_model(),
            chat_model: default_chat_model(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkingSettings {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: u32,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecaySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_half_life")]
    pub half_life_days: f64,
}

impl Default for DecaySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            half_life_days: DEFAULT_HALF_LIFE_DAYS,
        }
    }
}

impl DecaySettings {
    /// Effective half-life: `None` when decay is disabled or the configured
    /// half-life is not positive.
    pub fn effective_half_life(&self) -> Option<f64> {
        if self.enabled && self.half_life_days > 0.0 {
            Some(self.half_life_days)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RedactionSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for RedactionSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl MemoryBankConfig {
    /// Boost factor for a source type; 1.0 unless configured.
    pub fn source_boost(&self, source_type: crate::models::SourceType) -> f64 {
        self.source_boosts
            .get(source_type.as_str())
            .copied()
            .unwrap_or(1.0)
    }
}

fn default_version() -> String {
    CONFIG_VERSION.to_string()
}

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_embed_model() -> String {
    DEFAULT_EMBED_MODEL.to_string()
}

fn default_chat_model() -> String {
    DEFAULT_CHAT_MODEL.to_string()
}

fn default_read_timeout() -> u64 {
    60
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_overlap_tokens() -> u32 {
    DEFAULT_OVERLAP_TOKENS
}

fn default_half_life() -> f64 {
    DEFAULT_HALF_LIFE_DAYS
}

fn default_true() -> bool {
    true
}
