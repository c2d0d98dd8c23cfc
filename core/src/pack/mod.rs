//! Context pack assembly: mode-specific budget allocation across named
//! sections, filled from the state generator, the artifacts store, and the
//! recency retriever, then rendered as XML, JSON, or Markdown.

mod budget;
mod render;

pub use budget::Section;
pub use budget::SectionItem;

use chrono::SecondsFormat;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::config::MemoryBankConfig;
use crate::episode::Episode;
use crate::episode::classify_episode;
use crate::error::MemoryBankError;
use crate::error::Result;
use crate::models::Chunk;
use crate::models::SourceType;
use crate::models::estimate_tokens;
use crate::oracle::Oracle;
use crate::retriever::RecencyLimits;
use crate::retriever::chunks_by_episode;
use crate::retriever::recent_chunks;
use crate::state_gen::current_state;
use crate::storage::Store;
use budget::ENVELOPE_OVERHEAD_TOKENS;
use budget::fill_section;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackMode {
    Auto,
    Debug,
    Build,
    Explore,
}

impl PackMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackMode::Auto => "auto",
            PackMode::Debug => "debug",
            PackMode::Build => "build",
            PackMode::Explore => "explore",
        }
    }

    pub fn parse(s: &str) -> Result<PackMode> {
        match s {
            "auto" => Ok(PackMode::Auto),
            "debug" => Ok(PackMode::Debug),
            "build" => Ok(PackMode::Build),
            "explore" => Ok(PackMode::Explore),
            other => Err(MemoryBankError::InvalidMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for PackMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackFormat {
    Xml,
    Json,
    Markdown,
}

impl PackFormat {
    pub fn parse(s: &str) -> Result<PackFormat> {
        match s {
            "xml" => Ok(PackFormat::Xml),
            "json" => Ok(PackFormat::Json),
            "md" => Ok(PackFormat::Markdown),
            other => Err(MemoryBankError::InvalidMode(format!("format {other}"))),
        }
    }
}

/// Fractions of the total budget per section, normalized to sum to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetProfile {
    pub project_state: f64,
    pub decisions: f64,
    pub active_tasks: f64,
    pub plans: f64,
    pub recent_context: f64,
}

impl BudgetProfile {
    fn normalized(self) -> BudgetProfile {
        let total = self.project_state
            + self.decisions
            + self.active_tasks
            + self.plans
            + self.recent_context;
        if total <= 0.0 {
            return profile_for(PackMode::Auto);
        }
        BudgetProfile {
            project_state: self.project_state / total,
            decisions: self.decisions / total,
            active_tasks: self.active_tasks / total,
            plans: self.plans / total,
            recent_context: self.recent_context / total,
        }
    }
}

fn profile_for(mode: PackMode) -> BudgetProfile {
    match mode {
        PackMode::Auto => BudgetProfile {
            project_state: 0.15,
            decisions: 0.15,
            active_tasks: 0.15,
            plans: 0.15,
            recent_context: 0.40,
        },
        PackMode::Debug => BudgetProfile {
            project_state: 0.10,
            decisions: 0.05,
            active_tasks: 0.05,
            plans: 0.05,
            recent_context: 0.75,
        },
        PackMode::Build => BudgetProfile {
            project_state: 0.15,
            decisions: 0.20,
            active_tasks: 0.20,
            plans: 0.20,
            recent_context: 0.25,
        },
        PackMode::Explore => BudgetProfile {
            project_state: 0.25,
            decisions: 0.15,
            active_tasks: 0.05,
            plans: 0.15,
            recent_context: 0.40,
        },
    }
}

/// The built-in profile for `mode`, with `config.pack_modes` overrides
/// merged over it and the result re-normalized.
pub fn load_profile(config: &MemoryBankConfig, mode: PackMode) -> BudgetProfile {
    let mut profile = profile_for(mode);
    let Some(overrides) = config.pack_modes.get(mode.as_str()) else {
        return profile;
    };

    for (key, value) in overrides {
        match key.as_str() {
            "project_state" => profile.project_state = *value,
            "decisions" => profile.decisions = *value,
            "active_tasks" => profile.active_tasks = *value,
            "plans" => profile.plans = *value,
            "recent_context" => profile.recent_context = *value,
            other => warn!("ignoring unknown pack section weight {other}"),
        }
    }
    profile.normalized()
}

/// Map the latest session's episode onto a concrete mode. `Auto` weights
/// remain when the store is empty.
pub fn infer_mode(store: &Store) -> Result<PackMode> {
    let sessions = store.list_sessions()?;
    let Some(latest) = sessions.first() else {
        return Ok(PackMode::Auto);
    };
    let chunks = store.read_chunks(&latest.id)?;
    let mode = match classify_episode(latest, &chunks) {
        Episode::Debug => PackMode::Debug,
        Episode::Build | Episode::Refactor | Episode::Test | Episode::Config | Episode::Deploy => {
            PackMode::Build
        }
        Episode::Explore | Episode::Docs | Episode::Review => PackMode::Explore,
    };
    Ok(mode)
}

#[derive(Debug, Clone)]
pub struct PackRequest {
    pub budget: u32,
    pub mode: PackMode,
    pub format: PackFormat,
    pub episode: Option<Episode>,
}

impl PackRequest {
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            mode: PackMode::Auto,
            format: PackFormat::Xml,
            episode: None,
        }
    }
}

/// Fully assembled document handed to a renderer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PackDocument {
    pub generated_at: String,
    pub mode: PackMode,
    pub session_count: usize,
    pub summary: String,
    pub sections: Vec<Section>,
    pub instructions: String,
}

/// Assemble a context pack within `request.budget` approximate tokens.
///
/// The project state summary and the instructions footer are always
/// emitted; weighted sections are filled in priority order and truncated
/// from their tails. A chat-oracle failure degrades to the cached state
/// rather than failing the pack.
pub async fn build_pack<O: Oracle>(
    store: &Store,
    oracle: &O,
    request: &PackRequest,
) -> Result<String> {
    if request.budget == 0 {
        return Err(MemoryBankError::InvalidBudget(0));
    }

    let config = store.read_config()?;
    crate::ingest::chunk_all_sessions(store, false)?;

    let state = current_state(store, oracle).await?;
    let session_count = store.list_sessions()?.len();

    let mode = match request.mode {
        PackMode::Auto => infer_mode(store)?,
        explicit => explicit,
    };
    let profile = load_profile(&config, mode);
    let budget = request.budget;

    let generated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let instructions = render::INSTRUCTIONS_TEXT.to_string();

    // Protected cost first: summary, instructions footer, envelope.
    let protected = estimate_tokens(&state.summary)
        + estimate_tokens(&instructions)
        + ENVELOPE_OVERHEAD_TOKENS;
    let mut global_remaining = budget.saturating_sub(protected);
    if protected > budget {
        warn!("token budget {budget} is smaller than the protected sections");
    }

    let alloc = |fraction: f64| -> u32 { (budget as f64 * fraction) as u32 };
    let mut sections: Vec<Section> = Vec::new();

    // Decisions.
    let decision_items: Vec<SectionItem> = state
        .decisions
        .iter()
        .map(|d| SectionItem {
            id: d.id.clone(),
            source_type: "session".to_string(),
            session: "state".to_string(),
            body: if d.rationale.is_empty() {
                d.statement.clone()
            } else {
                format!("{} ({})", d.statement, d.rationale)
            },
            label: None,
        })
        .collect();
    if let Some(section) = fill_section(
        "decisions",
        decision_items,
        alloc(profile.decisions),
        &mut global_remaining,
    ) {
        sections.push(section);
    }

    // Constraints carry no weight of their own; they ride on whatever
    // budget remains (they come straight from the state and are small).
    let constraint_items: Vec<SectionItem> = state
        .constraints
        .iter()
        .enumerate()
        .map(|(i, c)| SectionItem {
            id: format!("C{}", i + 1),
            source_type: "session".to_string(),
            session: "state".to_string(),
            body: c.clone(),
            label: None,
        })
        .collect();
    let constraints_alloc = global_remaining;
    if let Some(section) = fill_section(
        "constraints",
        constraint_items,
        constraints_alloc,
        &mut global_remaining,
    ) {
        sections.push(section);
    }

    // Active tasks: todo and task artifacts newest first, falling back to
    // the state's task list when no artifacts exist.
    let mut task_items = artifact_items(store, &[SourceType::Todo, SourceType::Task])?;
    if task_items.is_empty() {
        task_items = state
            .active_tasks
            .iter()
            .map(|t| SectionItem {
                id: t.id.clone(),
                source_type: "task".to_string(),
                session: if t.session_id.is_empty() {
                    "state".to_string()
                } else {
                    t.session_id.clone()
                },
                body: t.text.clone(),
                label: Some(t.status.clone()),
            })
            .filter(|item| !item.body.is_empty() || item.label.as_deref() != Some(""))
            .collect();
    }
    if let Some(section) = fill_section(
        "active-tasks",
        task_items,
        alloc(profile.active_tasks),
        &mut global_remaining,
    ) {
        sections.push(section);
    }

    // Plans.
    let plan_items = artifact_items(store, &[SourceType::Plan])?;
    if let Some(section) = fill_section(
        "plans",
        plan_items,
        alloc(profile.plans),
        &mut global_remaining,
    ) {
        sections.push(section);
    }

    // Recent context: episode-filtered when requested, else recency order.
    // The retriever's heap is bounded by the count that could possibly fit.
    let recent_alloc = alloc(profile.recent_context);
    let max_excerpts = ((recent_alloc / 48).max(1) as usize).min(200);
    let recent = match request.episode {
        Some(episode) => chunks_by_episode(store, episode, max_excerpts)?,
        None => recent_chunks(
            store,
            RecencyLimits {
                max_excerpts,
                ..RecencyLimits::default()
            },
        )?,
    };
    let recent_items: Vec<SectionItem> = recent.iter().map(chunk_item).collect();
    if let Some(section) = fill_section(
        "recent-context",
        recent_items,
        recent_alloc,
        &mut global_remaining,
    ) {
        sections.push(section);
    }

    let doc = PackDocument {
        generated_at,
        mode,
        session_count,
        summary: state.summary,
        sections,
        instructions,
    };

    Ok(match request.format {
        PackFormat::Xml => render::render_xml(&doc),
        PackFormat::Json => render::render_json(&doc),
        PackFormat::Markdown => render::render_markdown(&doc),
    })
}

fn chunk_item(chunk: &Chunk) -> SectionItem {
    SectionItem {
        id: format!("{}:{}", chunk.session_id, chunk.chunk_index),
        source_type: chunk.source_type.as_str().to_string(),
        session: chunk.session_id.clone(),
        body: chunk.text.clone(),
        label: None,
    }
}

/// Artifact chunks of the given types, newest first.
fn artifact_items(store: &Store, types: &[SourceType]) -> Result<Vec<SectionItem>> {
    let mut chunks: Vec<Chunk> = store
        .read_artifact_chunks()?
        .into_iter()
        .filter(|chunk| types.contains(&chunk.source_type))
        .collect();
    chunks.sort_by(|a, b| {
        b.end_ts
            .total_cmp(&a.end_ts)
            .then_with(|| a.session_id.cmp(&b.session_id))
            .then(a.chunk_index.cmp(&b.chunk_index))
    });
    Ok(chunks.iter().map(chunk_item).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionSource;
    use crate::models::quality_score;
    use crate::oracle::testing::FakeOracle;
    use crate::storage::CreateSession;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const STATE_JSON: &str = r#"{
        "summary": "Project captures agent sessions into a local store.",
        "decisions": [{"id": "D1", "statement": "Flat index", "rationale": "simplicity"}],
        "constraints": ["no server process"],
        "active_tasks": [],
        "recent_topics": ["retrieval"]
    }"#;

    fn store_with_one_session() -> (TempDir, Store) {
        let dir = TempDir::new().expect("create temp dir");
        let (_, store) = Store::init(&dir.path().join(".memory-bank")).expect("init store");
        let meta = store
            .create_session(CreateSession::new(
                vec!["claude".to_string()],
                "/tmp",
                SessionSource::Hook,
            ))
            .expect("create session");
        let text = "User: how does retrieval work?\n\nAssistant: cosine over a flat index.";
        store
            .write_chunks(
                &meta.id,
                &[Chunk {
                    session_id: meta.id.clone(),
                    chunk_index: 0,
                    source_type: SourceType::Session,
                    text: text.to_string(),
                    token_count: estimate_tokens(text),
                    quality: quality_score(text),
                    start_ts: 100.0,
                    end_ts: 100.0,
                    speaker_role: None,
                }],
            )
            .expect("write chunks");
        store
            .finalize_session(&meta.id, Some(0), None)
            .expect("finalize");
        (dir, store)
    }

    #[tokio::test]
    async fn small_budget_pack_has_state_and_instructions_within_budget() {
        let (_dir, store) = store_with_one_session();
        let oracle = FakeOracle::new(4).with_chat_response(STATE_JSON);

        let request = PackRequest::new(500);
        let xml = build_pack(&store, &oracle, &request).await.expect("build pack");

        assert!(xml.contains("<project-state"));
        assert!(xml.contains("<instructions>"));
        assert!(!xml.contains("<active-tasks"));
        assert!(!xml.contains("<plans"));
        assert!(estimate_tokens(&xml) <= 500, "pack exceeded its budget");
    }

    #[tokio::test]
    async fn zero_budget_is_rejected() {
        let (_dir, store) = store_with_one_session();
        let oracle = FakeOracle::new(4);
        let err = build_pack(&store, &oracle, &PackRequest::new(0))
            .await
            .expect_err("expect invalid budget");
        assert!(matches!(err, MemoryBankError::InvalidBudget(0)));
    }

    #[tokio::test]
    async fn oracle_failure_still_produces_a_pack() {
        let (_dir, store) = store_with_one_session();
        // No canned responses: every chat call fails.
        let oracle = FakeOracle::new(4);

        let xml = build_pack(&store, &oracle, &PackRequest::new(2000))
            .await
            .expect("build degraded pack");
        assert!(xml.contains("<context-pack"));
        assert!(xml.contains("<instructions>"));
    }

    #[tokio::test]
    async fn artifacts_fill_tasks_and_plans_sections() {
        let (_dir, store) = store_with_one_session();
        let oracle = FakeOracle::new(4).with_chat_response(STATE_JSON);

        let todo = crate::artifacts::TodoList {
            agent_session_id: "agent-1".to_string(),
            items: vec![crate::artifacts::TodoItem {
                content: "ship the retriever".to_string(),
                status: "pending".to_string(),
                priority: "high".to_string(),
            }],
            mtime: 50.0,
        };
        store
            .append_artifact_chunks(&crate::artifacts::chunk_todo_list(&todo))
            .expect("append todo chunk");
        store
            .append_artifact_chunks(&crate::artifacts::chunk_plan(
                "rework",
                "## Goal\nrefit the pack assembler",
                60.0,
            ))
            .expect("append plan chunk");

        let xml = build_pack(&store, &oracle, &PackRequest::new(4000))
            .await
            .expect("build pack");
        assert!(xml.contains("<active-tasks count=\"1\">"));
        assert!(xml.contains("<plans count=\"1\">"));
        assert!(xml.contains("[TODO] pending (high): ship the retriever"));
    }

    #[tokio::test]
    async fn json_and_markdown_formats_render() {
        let (_dir, store) = store_with_one_session();
        let oracle = FakeOracle::new(4)
            .with_chat_response(STATE_JSON)
            .with_chat_response(STATE_JSON);

        let mut request = PackRequest::new(2000);
        request.format = PackFormat::Json;
        let json = build_pack(&store, &oracle, &request).await.expect("json pack");
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
        assert_eq!(value["version"], "1.0");

        request.format = PackFormat::Markdown;
        let md = build_pack(&store, &oracle, &request).await.expect("md pack");
        assert!(md.contains("# Context Pack"));
    }

    #[test]
    fn auto_mode_profile_matches_episode() {
        let (_dir, store) = store_with_one_session();
        // The lone session's content mentions retrieval questions, which the
        // lexicon classifies as explore.
        let mode = infer_mode(&store).expect("infer mode");
        assert_eq!(mode, PackMode::Explore);
    }

    #[test]
    fn profile_overrides_merge_and_normalize() {
        let config: MemoryBankConfig = serde_json::from_str(
            r#"{"pack_modes": {"debug": {"recent_context": 0.80, "project_state": 0.05}}}"#,
        )
        .expect("parse config");
        let profile = load_profile(&config, PackMode::Debug);
        let total = profile.project_state
            + profile.decisions
            + profile.active_tasks
            + profile.plans
            + profile.recent_context;
        assert!((total - 1.0).abs() < 1e-9);
        assert!(profile.recent_context > 0.7);
    }
}
