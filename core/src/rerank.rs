//! Second-pass LLM reranking of search candidates.
//!
//! The oracle is asked to rate each snippet's relevance 0..10; scores are
//! normalized to [0, 1] and replace the vector scores. Any failure falls
//! back to the unreranked ordering.

use serde::Deserialize;
use tracing::warn;

use crate::models::SearchResult;
use crate::oracle::ChatRequest;
use crate::oracle::Oracle;

const SYSTEM_PROMPT: &str = "You are a relevance judge. Given a search query and a list of text \
snippets, rate each snippet's relevance to the query on a scale of 0 to 10.\n\
0 = completely irrelevant, 10 = perfectly relevant.\n\
Respond ONLY with JSON: {\"scores\": [<int>, ...]}\n\
The scores array must have exactly one integer per snippet, in order.";

#[derive(Deserialize)]
struct ScoresResponse {
    scores: Vec<f64>,
}

fn build_prompt(query: &str, candidates: &[SearchResult]) -> String {
    let mut lines = vec![format!("Query: {query}"), String::new(), "Snippets:".to_string()];
    for (i, candidate) in candidates.iter().enumerate() {
        let snippet: String = candidate
            .text
            .chars()
            .take(300)
            .map(|c| if c == '\n' { ' ' } else { c })
            .collect();
        lines.push(format!("[{i}] {snippet}"));
    }
    lines.join("\n")
}

fn parse_scores(raw: &str, expected: usize) -> Option<Vec<f64>> {
    let response: ScoresResponse = serde_json::from_str(raw).ok()?;
    if response.scores.len() != expected {
        return None;
    }
    Some(
        response
            .scores
            .into_iter()
            .map(|s| s.clamp(0.0, 10.0) / 10.0)
            .collect(),
    )
}

/// Rerank `candidates` by LLM relevance, returning the top `top_k`.
/// On any oracle or parse failure the vector ordering is returned unchanged.
pub async fn rerank<O: Oracle>(
    query: &str,
    mut candidates: Vec<SearchResult>,
    oracle: &O,
    top_k: usize,
) -> Vec<SearchResult> {
    if candidates.is_empty() {
        return candidates;
    }

    let request = ChatRequest::new(build_prompt(query, &candidates))
        .with_system(SYSTEM_PROMPT)
        .as_json();

    let scores = match oracle.chat(request).await {
        Ok(raw) => parse_scores(&raw, candidates.len()),
        Err(err) => {
            warn!("reranker chat failed, falling back to vector scores: {err}");
            None
        }
    };

    let Some(scores) = scores else {
        candidates.truncate(top_k);
        return candidates;
    };

    for (candidate, score) in candidates.iter_mut().zip(scores) {
        candidate.score = score;
    }
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.key.to_string().cmp(&b.key.to_string()))
    });
    candidates.truncate(top_k);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkKey;
    use crate::models::SourceType;
    use crate::oracle::testing::FakeOracle;
    use pretty_assertions::assert_eq;

    fn result(session: &str, idx: u32, text: &str, score: f64) -> SearchResult {
        SearchResult {
            key: ChunkKey {
                session_id: session.to_string(),
                chunk_index: idx,
                source_type: SourceType::Session,
            },
            text: text.to_string(),
            token_count: 1,
            quality: 1.0,
            start_ts: 0.0,
            score,
        }
    }

    #[tokio::test]
    async fn reorders_by_llm_scores() {
        let oracle = FakeOracle::new(4).with_chat_response(r#"{"scores": [2, 9, 5]}"#);
        let candidates = vec![
            result("s", 0, "first", 0.9),
            result("s", 1, "second", 0.8),
            result("s", 2, "third", 0.7),
        ];
        let reranked = rerank("query", candidates, &oracle, 2).await;
        assert_eq!(reranked.len(), 2);
        assert_eq!(reranked[0].text, "second");
        assert_eq!(reranked[0].score, 0.9);
        assert_eq!(reranked[1].text, "third");
    }

    #[tokio::test]
    async fn oracle_failure_falls_back_to_vector_order() {
        let oracle = FakeOracle::new(4);
        let candidates = vec![
            result("s", 0, "first", 0.9),
            result("s", 1, "second", 0.8),
            result("s", 2, "third", 0.7),
        ];
        let reranked = rerank("query", candidates, &oracle, 2).await;
        assert_eq!(reranked.len(), 2);
        assert_eq!(reranked[0].text, "first");
        assert_eq!(reranked[1].text, "second");
    }

    #[tokio::test]
    async fn wrong_score_count_falls_back() {
        let oracle = FakeOracle::new(4).with_chat_response(r#"{"scores": [1]}"#);
        let candidates = vec![result("s", 0, "first", 0.9), result("s", 1, "second", 0.8)];
        let reranked = rerank("query", candidates, &oracle, 2).await;
        assert_eq!(reranked[0].text, "first");
    }

    #[test]
    fn scores_are_clamped_and_normalized() {
        let scores = parse_scores(r#"{"scores": [15, -3, 5]}"#, 3).expect("parse scores");
        assert_eq!(scores, vec![1.0, 0.0, 0.5]);
    }
}
