//! Cached project-state generation.
//!
//! The state is a single chat call over a quality-weighted sample of
//! chunks, cached under `state/state.json` and keyed by a fingerprint of
//! the chunk set. A matching fingerprint short-circuits the oracle
//! entirely; an oracle failure degrades to the cached (or empty) state and
//! never fails the caller.

use std::collections::BTreeMap;

use serde::Deserialize;
use sha1::Digest;
use sha1::Sha1;
use tracing::warn;

use crate::error::Result;
use crate::models::Chunk;
use crate::models::ChunkFingerprint;
use crate::models::Decision;
use crate::models::ProjectState;
use crate::models::TaskEntry;
use crate::oracle::ChatRequest;
use crate::oracle::Oracle;
use crate::storage::Store;
use crate::storage::now_ts;

/// Chunks sampled into the summarization prompt.
const MAX_SAMPLE_CHUNKS: usize = 120;
/// Additive weight floor so zero-quality chunks can still be drawn last.
const QUALITY_WEIGHT_FLOOR: f64 = 0.05;
/// Keys hashed into the fingerprint tail.
const FINGERPRINT_TAIL: usize = 32;

const SYSTEM_PROMPT: &str = "You are a project analyst. Given a transcript of developer sessions \
with an LLM assistant, produce a structured JSON summary with these exact fields:\n\
- \"summary\": A 2-3 sentence overview of the project and its current state.\n\
- \"decisions\": A list of key decisions, each with \"id\" (D1, D2, ...), \"statement\", and \"rationale\".\n\
- \"constraints\": A list of identified constraints (strings).\n\
- \"active_tasks\": A list of active tasks, each with \"id\" (T1, T2, ...) and \"status\" (one of: pending, in_progress, done).\n\
- \"recent_topics\": A list of short topic labels covering recent work.\n\
Output ONLY valid JSON, no markdown, no explanations.";

#[derive(Debug, Default, Deserialize)]
struct StateResponse {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    decisions: Vec<Decision>,
    #[serde(default)]
    constraints: Vec<String>,
    #[serde(default)]
    active_tasks: Vec<TaskEntry>,
    #[serde(default)]
    recent_topics: Vec<String>,
}

/// Fingerprint of the current chunk set: total count, newest start
/// timestamp, and a digest over the last [`FINGERPRINT_TAIL`] chunk keys.
pub fn chunk_fingerprint(store: &Store) -> Result<ChunkFingerprint> {
    let mut count = 0u64;
    let mut max_start_ts = 0.0f64;
    let mut tail: Vec<String> = Vec::new();

    store.for_each_chunk(|chunk| {
        count += 1;
        if chunk.start_ts > max_start_ts {
            max_start_ts = chunk.start_ts;
        }
        tail.push(chunk.key().to_string());
        if tail.len() > FINGERPRINT_TAIL {
            tail.remove(0);
        }
    })?;

    let mut hasher = Sha1::new();
    for key in &tail {
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();

    Ok(ChunkFingerprint {
        chunk_count: count,
        max_start_ts,
        tail_digest: format!("{digest:x}"),
    })
}

/// Return the current project state, regenerating it through the oracle
/// only when the chunk fingerprint changed. Oracle failures fall back to
/// the cached state (or an empty one); this function never fails the pack.
pub async fn current_state<O: Oracle>(store: &Store, oracle: &O) -> Result<ProjectState> {
    let fingerprint = chunk_fingerprint(store)?;

    let cached = store.load_state();
    if let Some(state) = &cached
        && state.fingerprint == fingerprint
    {
        return Ok(state.clone());
    }

    let sample = sample_chunks(store)?;
    let prompt = if sample.is_empty() {
        "(No session data available)".to_string()
    } else {
        sample
            .iter()
            .map(|chunk| chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    let request = ChatRequest::new(prompt).with_system(SYSTEM_PROMPT).as_json();
    let response = match oracle.chat(request).await {
        Ok(raw) => raw,
        Err(err) => {
            warn!("state generation failed, using cached state: {err}");
            return Ok(cached.unwrap_or_default());
        }
    };

    let parsed: StateResponse = match serde_json::from_str(&response) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("state response was not valid JSON, using cached state: {err}");
            return Ok(cached.unwrap_or_default());
        }
    };

    let state = ProjectState {
        summary: parsed.summary,
        decisions: parsed.decisions,
        constraints: parsed.constraints,
        active_tasks: parsed.active_tasks,
        recent_topics: parsed.recent_topics,
        generated_at: now_ts(),
        fingerprint,
    };
    store.save_state(&state)?;
    Ok(state)
}

/// Sample up to [`MAX_SAMPLE_CHUNKS`] chunks for the summarization prompt.
///
/// Draws round-robin across sessions so one chatty session cannot
/// monopolize the prompt; within a session, chunks are ordered by weight
/// (`quality + 0.05`) with recency breaking ties. The final sample is
/// chronological for prompt coherence.
fn sample_chunks(store: &Store) -> Result<Vec<Chunk>> {
    let mut per_session: BTreeMap<String, Vec<Chunk>> = BTreeMap::new();
    store.for_each_chunk(|chunk| {
        if chunk.text.trim().is_empty() {
            return;
        }
        per_session
            .entry(chunk.session_id.clone())
            .or_default()
            .push(chunk);
    })?;

    for chunks in per_session.values_mut() {
        chunks.sort_by(|a, b| {
            let wa = a.quality + QUALITY_WEIGHT_FLOOR;
            let wb = b.quality + QUALITY_WEIGHT_FLOOR;
            wb.total_cmp(&wa)
                .then_with(|| b.end_ts.total_cmp(&a.end_ts))
                .then(a.chunk_index.cmp(&b.chunk_index))
        });
    }

    let mut sample: Vec<Chunk> = Vec::new();
    let mut round = 0usize;
    while sample.len() < MAX_SAMPLE_CHUNKS {
        let mut drew_any = false;
        for chunks in per_session.values() {
            if sample.len() >= MAX_SAMPLE_CHUNKS {
                break;
            }
            if let Some(chunk) = chunks.get(round) {
                sample.push(chunk.clone());
                drew_any = true;
            }
        }
        if !drew_any {
            break;
        }
        round += 1;
    }

    sample.sort_by(|a, b| {
        a.start_ts
            .total_cmp(&b.start_ts)
            .then_with(|| a.session_id.cmp(&b.session_id))
            .then(a.chunk_index.cmp(&b.chunk_index))
    });
    Ok(sample)
}
