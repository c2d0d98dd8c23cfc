//! Canonical domain types shared by every subsystem: sessions, chunks,
//! search results, and the cached project state.

use serde::Deserialize;
use serde::Serialize;

/// Ingestion source of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    Pty,
    Hook,
    Import,
}

impl SessionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionSource::Pty => "pty",
            SessionSource::Hook => "hook",
            SessionSource::Import => "import",
        }
    }
}

impl std::fmt::Display for SessionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of document a chunk was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Session,
    Plan,
    Todo,
    Task,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Session => "session",
            SourceType::Plan => "plan",
            SourceType::Todo => "todo",
            SourceType::Task => "task",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "session" => Some(SourceType::Session),
            "plan" => Some(SourceType::Plan),
            "todo" => Some(SourceType::Todo),
            "task" => Some(SourceType::Task),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who authored the text inside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerRole {
    User,
    Assistant,
    Mixed,
}

/// Direction of a captured PTY event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStream {
    In,
    Out,
    System,
}

/// One timestamped entry in a PTY session's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Seconds relative to session start.
    pub ts: f64,
    pub stream: EventStream,
    pub text: String,
}

/// Metadata about one captured session. Immutable after finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub source: SessionSource,
    pub command: Vec<String>,
    pub cwd: String,
    pub started_at: f64,
    #[serde(default)]
    pub ended_at: Option<f64>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// The host agent's own session id, when this session was created by a
    /// hook or an import.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
}

/// A token-bounded text unit with a quality score; the atomic unit of
/// indexing and retrieval. Immutable once written to a chunk log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub session_id: String,
    pub chunk_index: u32,
    pub source_type: SourceType,
    pub text: String,
    pub token_count: u32,
    pub quality: f64,
    pub start_ts: f64,
    pub end_ts: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_role: Option<SpeakerRole>,
}

impl Chunk {
    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            session_id: self.session_id.clone(),
            chunk_index: self.chunk_index,
            source_type: self.source_type,
        }
    }
}

/// Identity of a chunk within a store. Vectors, metadata records, and dedup
/// sets are all keyed by this triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    pub session_id: String,
    pub chunk_index: u32,
    pub source_type: SourceType,
}

impl std::fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.session_id, self.chunk_index, self.source_type
        )
    }
}

/// A chunk matched by retrieval, with its final pipeline score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub key: ChunkKey,
    pub text: String,
    pub token_count: u32,
    pub quality: f64,
    pub start_ts: f64,
    pub score: f64,
}

/// One decision extracted by the state generator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub statement: String,
    #[serde(default)]
    pub rationale: String,
}

/// One active task extracted by the state generator or imported as an
/// artifact item.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub session_id: String,
}

/// Monotonic digest of the chunk set at state-generation time. Two stores
/// with the same chunks produce the same fingerprint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChunkFingerprint {
    pub chunk_count: u64,
    pub max_start_ts: f64,
    pub tail_digest: String,
}

/// The cached, LLM-generated project summary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProjectState {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub active_tasks: Vec<TaskEntry>,
    #[serde(default)]
    pub recent_topics: Vec<String>,
    #[serde(default)]
    pub generated_at: f64,
    #[serde(default)]
    pub fingerprint: ChunkFingerprint,
}

/// Approximate token count: `max(1, ceil(chars / 4))`.
///
/// Every place a token budget is enforced (chunker, budgeter, retriever,
/// pack) must go through this one function so the arithmetic can never
/// drift between components.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    (chars.div_ceil(4)).max(1) as u32
}

/// Quality score for chunk text: the ratio of alphanumeric characters to
/// non-whitespace characters, rounded to three decimals. Empty or
/// whitespace-only text scores 0.
pub fn quality_score(text: &str) -> f64 {
    let mut alnum = 0u64;
    let mut total = 0u64;
    for ch in text.chars() {
        if ch.is_whitespace() {
            continue;
        }
        total += 1;
        if ch.is_alphanumeric() {
            alnum += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    round3(alnum as f64 / total as f64)
}

/// Round to three decimal places.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
