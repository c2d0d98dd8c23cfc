//! Retrieval: cosine search with type filtering, temporal decay, optional
//! LLM reranking, and episode-aware selection. Also home to the recency
//! retriever used by the pack assembler.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::episode::Episode;
use crate::episode::classify_episode;
use crate::error::Result;
use crate::index::build_index;
use crate::models::Chunk;
use crate::models::SearchResult;
use crate::models::SourceType;
use crate::models::quality_score;
use crate::oracle::Oracle;
use crate::oracle::with_retry;
use crate::registry::Registry;
use crate::rerank::rerank;
use crate::storage::Store;
use crate::storage::now_ts;

const SECS_PER_DAY: f64 = 86_400.0;
/// Candidate multiplier handed to the reranker.
const RERANK_POOL_FACTOR: usize = 3;

/// One retrieval request. Filters compose; everything unset means "all".
#[derive(Debug, Clone, Default)]
pub struct RetrievalRequest {
    pub query: String,
    pub top_k: usize,
    pub source_type: Option<SourceType>,
    pub episode: Option<Episode>,
    pub session_ids: Option<HashSet<String>>,
    /// Overrides the store's decay config when set.
    pub decay: Option<bool>,
    pub rerank: bool,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>, top_k: usize) -> Self {
        Self {
            query: query.into(),
            top_k,
            ..Default::default()
        }
    }
}

/// Exponential temporal decay: `2^(-age_days / half_life_days)`.
/// Chunks without a timestamp (`start_ts == 0`) are exempt.
pub fn decay_factor(start_ts: f64, half_life_days: f64, now: f64) -> f64 {
    if start_ts == 0.0 || half_life_days <= 0.0 {
        return 1.0;
    }
    let age_days = ((now - start_ts) / SECS_PER_DAY).max(0.0);
    (-age_days / half_life_days).exp2()
}

/// Run the full scoring pipeline against one store: ensure the index is
/// current, embed the query, score every row (cosine, then decay, then
/// source-type boost), apply filters, and return the strict top-K.
pub async fn retrieve<O: Oracle>(
    store: &Store,
    oracle: &O,
    request: &RetrievalRequest,
    cancel: &CancellationToken,
) -> Result<Vec<SearchResult>> {
    let config = store.read_config()?;

    let index = {
        let _guard = store.lock_exclusive()?;
        build_index(store, oracle, cancel).await?
    };

    let _guard = store.lock_shared()?;
    let total = index.len()?;
    if total == 0 || request.top_k == 0 {
        return Ok(Vec::new());
    }

    let query_texts = vec![request.query.clone()];
    let vectors = with_retry(|| oracle.embed(&query_texts)).await?;
    let Some(query_vector) = vectors.first() else {
        return Ok(Vec::new());
    };

    // Decay and boosts can reorder past any cosine cutoff, so score the
    // whole (flat, memory-mapped) matrix and cut afterwards.
    let hits = index.search(query_vector, total)?;

    let allowed_sessions = match (&request.session_ids, request.episode) {
        (ids, Some(episode)) => {
            let mut matching = sessions_matching_episode(store, episode)?;
            if let Some(ids) = ids {
                matching.retain(|id| ids.contains(id));
            }
            Some(matching)
        }
        (Some(ids), None) => Some(ids.clone()),
        (None, None) => None,
    };

    let half_life = match request.decay {
        Some(true) => Some(
            config
                .decay
                .effective_half_life()
                .unwrap_or(crate::config::DEFAULT_HALF_LIFE_DAYS),
        ),
        Some(false) => None,
        None => config.decay.effective_half_life(),
    };
    let now = now_ts();

    let mut results: Vec<SearchResult> = hits
        .into_iter()
        .filter(|hit| {
            request
                .source_type
                .is_none_or(|ty| hit.record.source_type == ty)
        })
        .filter(|hit| {
            allowed_sessions
                .as_ref()
                .is_none_or(|allowed| allowed.contains(&hit.record.session_id))
        })
        .map(|hit| {
            let mut score = hit.score as f64;
            if let Some(half_life) = half_life {
                score *= decay_factor(hit.record.start_ts, half_life, now);
            }
            score *= config.source_boost(hit.record.source_type);
            SearchResult {
                key: hit.record.key(),
                text: hit.record.text,
                token_count: hit.record.token_count,
                quality: hit.record.quality,
                start_ts: hit.record.start_ts,
                score,
            }
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.key.to_string().cmp(&b.key.to_string()))
    });

    if request.rerank {
        results.truncate(request.top_k * RERANK_POOL_FACTOR);
        Ok(rerank(&request.query, results, oracle, request.top_k).await)
    } else {
        results.truncate(request.top_k);
        Ok(results)
    }
}

/// Session ids whose classified episode matches.
fn sessions_matching_episode(store: &Store, episode: Episode) -> Result<HashSet<String>> {
    let mut matching = HashSet::new();
    for meta in store.list_sessions()? {
        let chunks = store.read_chunks(&meta.id)?;
        if classify_episode(&meta, &chunks) == episode {
            matching.insert(meta.id);
        }
    }
    Ok(matching)
}

/// Search every registered project root and merge the per-store top-K by
/// score. Unreachable roots are skipped with a warning.
pub async fn global_search<O: Oracle>(
    registry: &Registry,
    oracle: &O,
    request: &RetrievalRequest,
    cancel: &CancellationToken,
) -> Result<Vec<(String, SearchResult)>> {
    let mut merged: Vec<(String, SearchResult)> = Vec::new();

    for entry in registry.list()? {
        let store_root = std::path::Path::new(&entry.root).join(crate::storage::MEMORY_BANK_DIR);
        let store = match Store::open(&store_root) {
            Ok(store) => store,
            Err(err) => {
                warn!("skipping unreachable project {}: {err}", entry.root);
                continue;
            }
        };
        match retrieve(&store, oracle, request, cancel).await {
            Ok(results) => {
                merged.extend(results.into_iter().map(|r| (entry.root.clone(), r)));
            }
            Err(err) => {
                warn!("search failed for project {}: {err}", entry.root);
            }
        }
    }

    merged.sort_by(|a, b| {
        b.1.score
            .total_cmp(&a.1.score)
            .then_with(|| a.0.cmp(&b.0))
    });
    merged.truncate(request.top_k);
    Ok(merged)
}

/// Bounds for the recency retriever.
#[derive(Debug, Clone, Copy)]
pub struct RecencyLimits {
    pub min_quality: f64,
    pub min_length: usize,
    pub max_excerpts: usize,
}

impl Default for RecencyLimits {
    fn default() -> Self {
        Self {
            min_quality: 0.30,
            min_length: 30,
            max_excerpts: 200,
        }
    }
}

#[derive(PartialEq)]
struct ByEndTs(f64, usize, Chunk);

impl Eq for ByEndTs {}

impl Ord for ByEndTs {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0).then(self.1.cmp(&other.1))
    }
}

impl PartialOrd for ByEndTs {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Most recent high-quality chunks, newest first.
///
/// Streams the chunk logs through a bounded min-heap keyed by `end_ts`, so
/// at most `max_excerpts` chunks are in memory at a time.
pub fn recent_chunks(store: &Store, limits: RecencyLimits) -> Result<Vec<Chunk>> {
    let mut heap: BinaryHeap<Reverse<ByEndTs>> = BinaryHeap::with_capacity(limits.max_excerpts + 1);
    let mut counter = 0usize;

    store.for_each_chunk(|chunk| {
        if chunk.text.trim().chars().count() < limits.min_length {
            return;
        }
        let quality = if chunk.quality > 0.0 {
            chunk.quality
        } else {
            quality_score(&chunk.text)
        };
        if quality < limits.min_quality {
            return;
        }
        heap.push(Reverse(ByEndTs(chunk.end_ts, counter, chunk)));
        counter += 1;
        if heap.len() > limits.max_excerpts {
            heap.pop();
        }
    })?;

    let mut chunks: Vec<Chunk> = heap.into_iter().map(|Reverse(entry)| entry.2).collect();
    chunks.sort_by(|a, b| {
        b.end_ts
            .total_cmp(&a.end_ts)
            .then_with(|| a.session_id.cmp(&b.session_id))
            .then(a.chunk_index.cmp(&b.chunk_index))
    });
    Ok(chunks)
}

/// Chunks from sessions classified as `episode`, newest first, bounded by
/// `max_chunks`.
pub fn chunks_by_episode(store: &Store, episode: Episode, max_chunks: usize) -> Result<Vec<Chunk>> {
    let matching = sessions_matching_episode(store, episode)?;
    let mut chunks: Vec<Chunk> = Vec::new();
    for session_id in &matching {
        chunks.extend(store.read_chunks(session_id)?);
    }
    chunks.sort_by(|a, b| {
        b.end_ts
            .total_cmp(&a.end_ts)
            .then_with(|| a.session_id.cmp(&b.session_id))
            .then(a.chunk_index.cmp(&b.chunk_index))
    });
    chunks.truncate(max_chunks);
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionSource;
    use crate::oracle::testing::FakeOracle;
    use crate::storage::CreateSession;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store_with_session(texts_and_ts: &[(&str, f64)]) -> (TempDir, Store, String) {
        let dir = TempDir::new().expect("create temp dir");
        let (_, store) = Store::init(&dir.path().join(".memory-bank")).expect("init store");
        let meta = store
            .create_session(CreateSession::new(
                vec!["claude".to_string()],
                "/tmp",
                SessionSource::Hook,
            ))
            .expect("create session");
        let chunks: Vec<Chunk> = texts_and_ts
            .iter()
            .enumerate()
            .map(|(i, (text, ts))| Chunk {
                session_id: meta.id.clone(),
                chunk_index: i as u32,
                source_type: SourceType::Session,
                text: text.to_string(),
                token_count: 2,
                quality: quality_score(text),
                start_ts: *ts,
                end_ts: *ts,
                speaker_role: None,
            })
            .collect();
        store.write_chunks(&meta.id, &chunks).expect("write chunks");
        let id = meta.id.clone();
        (dir, store, id)
    }

    #[test]
    fn decay_factor_halves_per_half_life() {
        let now = 100.0 * SECS_PER_DAY;
        let fresh = decay_factor(now, 14.0, now);
        assert!((fresh - 1.0).abs() < 1e-9);

        let old = decay_factor(now - 28.0 * SECS_PER_DAY, 14.0, now);
        assert!((old - 0.25).abs() < 1e-9);

        // Missing timestamps are exempt from decay.
        assert_eq!(decay_factor(0.0, 14.0, now), 1.0);
        // Future timestamps do not get boosted.
        assert_eq!(decay_factor(now + SECS_PER_DAY, 14.0, now), 1.0);
    }

    #[tokio::test]
    async fn retrieve_ranks_by_cosine_and_respects_top_k() {
        let (_dir, store, _) = store_with_session(&[
            ("alpha alpha content here", 0.0),
            ("beta something else", 0.0),
            ("gamma third thing", 0.0),
        ]);
        let oracle = FakeOracle::new(16);
        let cancel = CancellationToken::new();

        let request = RetrievalRequest::new("alpha alpha content here", 2);
        let results = retrieve(&store, &oracle, &request, &cancel)
            .await
            .expect("retrieve");
        assert_eq!(results.len(), 2);
        assert!(results[0].score >= results[1].score);
        assert!(results[0].text.contains("alpha"));
    }

    #[tokio::test]
    async fn decay_prefers_recent_among_identical_chunks() {
        let now = now_ts();
        let month_ago = now - 30.0 * SECS_PER_DAY;
        let (_dir, store, _) = store_with_session(&[
            ("identical text body", month_ago),
            ("identical text body", now),
        ]);
        let oracle = FakeOracle::new(16);
        let cancel = CancellationToken::new();

        let request = RetrievalRequest::new("identical text body", 2);
        let results = retrieve(&store, &oracle, &request, &cancel)
            .await
            .expect("retrieve");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].key.chunk_index, 1, "recent chunk should win");
        assert!(results[0].score > results[1].score);

        // With decay disabled both score identically by cosine.
        let mut request = RetrievalRequest::new("identical text body", 2);
        request.decay = Some(false);
        let results = retrieve(&store, &oracle, &request, &cancel)
            .await
            .expect("retrieve without decay");
        assert!((results[0].score - results[1].score).abs() < 1e-6);
    }

    #[tokio::test]
    async fn source_type_filter_excludes_other_types() {
        let (_dir, store, _) = store_with_session(&[("session text body here", 0.0)]);
        store
            .append_artifact_chunks(&[Chunk {
                session_id: "agent-1".to_string(),
                chunk_index: 0,
                source_type: SourceType::Plan,
                text: "plan text body here".to_string(),
                token_count: 2,
                quality: 1.0,
                start_ts: 0.0,
                end_ts: 0.0,
                speaker_role: None,
            }])
            .expect("append artifact chunk");

        let oracle = FakeOracle::new(16);
        let cancel = CancellationToken::new();

        let mut request = RetrievalRequest::new("text body here", 10);
        request.source_type = Some(SourceType::Plan);
        let results = retrieve(&store, &oracle, &request, &cancel)
            .await
            .expect("retrieve");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key.source_type, SourceType::Plan);
    }

    #[test]
    fn recent_chunks_keeps_newest_within_bound() {
        let (_dir, store, _) = store_with_session(&[
            ("oldest chunk with plenty of text in it", 10.0),
            ("middle chunk with plenty of text in it", 20.0),
            ("newest chunk with plenty of text in it", 30.0),
        ]);
        let chunks = recent_chunks(
            &store,
            RecencyLimits {
                max_excerpts: 2,
                ..RecencyLimits::default()
            },
        )
        .expect("recent chunks");
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.starts_with("newest"));
        assert!(chunks[1].text.starts_with("middle"));
    }

    #[test]
    fn recent_chunks_filters_low_quality_and_short_text() {
        let (_dir, store, _) = store_with_session(&[
            ("short", 10.0),
            ("!!! ??? ### $$$ %%% ^^^ &&& *** ((( )))", 20.0),
            ("a perfectly ordinary sentence with enough length", 30.0),
        ]);
        let chunks = recent_chunks(&store, RecencyLimits::default()).expect("recent chunks");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.starts_with("a perfectly"));
    }
}
