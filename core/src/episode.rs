//! Episode classification, error detection, and related-session linking.
//!
//! PTY sessions running an ordinary command are classified from the command
//! line; agent sessions (hook/import, or a PTY running the agent binary) are
//! classified from chunk content with a small weighted lexicon.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::models::Chunk;
use crate::models::SessionMeta;
use crate::models::SessionSource;

/// Sessions whose start/end fall within this many seconds are "related".
const MAX_NEIGHBOR_GAP_SECS: f64 = 600.0;

/// Minimum weighted lexicon score; below it the content path returns
/// [`Episode::Explore`].
const CONTENT_SCORE_FLOOR: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Episode {
    Build,
    Test,
    Deploy,
    Debug,
    Refactor,
    Explore,
    Config,
    Docs,
    Review,
}

impl Episode {
    pub const ALL: [Episode; 9] = [
        Episode::Build,
        Episode::Test,
        Episode::Deploy,
        Episode::Debug,
        Episode::Refactor,
        Episode::Explore,
        Episode::Config,
        Episode::Docs,
        Episode::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Episode::Build => "build",
            Episode::Test => "test",
            Episode::Deploy => "deploy",
            Episode::Debug => "debug",
            Episode::Refactor => "refactor",
            Episode::Explore => "explore",
            Episode::Config => "config",
            Episode::Docs => "docs",
            Episode::Review => "review",
        }
    }

    pub fn parse(s: &str) -> Option<Episode> {
        Episode::ALL.iter().copied().find(|e| e.as_str() == s)
    }
}

impl std::fmt::Display for Episode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One session with its classification, linked into the session graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionNode {
    pub meta: SessionMeta,
    pub episode: Episode,
    pub has_error: bool,
    pub error_summary: Option<String>,
    pub related_sessions: Vec<String>,
}

/// First-token rules, checked after the two-token pairs.
const COMMAND_RULES: &[(&str, Episode)] = &[
    ("pytest", Episode::Test),
    ("jest", Episode::Test),
    ("make", Episode::Build),
    ("cmake", Episode::Build),
    ("ninja", Episode::Build),
    ("gdb", Episode::Debug),
    ("lldb", Episode::Debug),
    ("docker", Episode::Deploy),
    ("kubectl", Episode::Deploy),
    ("terraform", Episode::Deploy),
    ("ansible", Episode::Deploy),
    ("ansible-playbook", Episode::Deploy),
];

/// Two-token rules; first match wins over everything else.
const COMMAND_PAIR_RULES: &[(&str, &str, Episode)] = &[
    ("cargo", "build", Episode::Build),
    ("cargo", "test", Episode::Test),
    ("go", "build", Episode::Build),
    ("go", "test", Episode::Test),
    ("npm", "test", Episode::Test),
    ("npm", "run", Episode::Build),
    ("docker", "build", Episode::Build),
    ("docker", "push", Episode::Deploy),
    ("make", "test", Episode::Test),
    ("git", "log", Episode::Review),
    ("git", "diff", Episode::Review),
    ("git", "blame", Episode::Review),
];

/// Weighted content lexicon for agent sessions.
const CONTENT_LEXICON: &[(Episode, &[(&str, f64)])] = &[
    (
        Episode::Test,
        &[
            ("pytest", 2.0),
            ("test_", 1.0),
            ("passed", 1.0),
            ("failed", 1.0),
            ("assert", 1.0),
            ("coverage", 1.0),
        ],
    ),
    (
        Episode::Build,
        &[
            ("compile", 2.0),
            ("cargo build", 2.0),
            ("linking", 1.0),
            ("webpack", 1.0),
            ("build", 1.0),
        ],
    ),
    (
        Episode::Deploy,
        &[
            ("deploy", 2.0),
            ("kubectl", 2.0),
            ("terraform", 2.0),
            ("production", 1.0),
            ("staging", 1.0),
        ],
    ),
    (
        Episode::Debug,
        &[
            ("traceback", 2.0),
            ("breakpoint", 2.0),
            ("debugger", 2.0),
            ("stack trace", 2.0),
            ("panic", 1.0),
        ],
    ),
    (
        Episode::Refactor,
        &[
            ("refactor", 2.0),
            ("rename", 1.0),
            ("extract", 1.0),
            ("restructure", 2.0),
            ("simplify", 1.0),
        ],
    ),
    (
        Episode::Explore,
        &[
            ("how does", 2.0),
            ("what is", 2.0),
            ("explain", 1.0),
            ("architecture", 1.0),
            ("understand", 1.0),
        ],
    ),
    (
        Episode::Config,
        &[
            ("config", 1.0),
            (".env", 2.0),
            ("settings", 1.0),
            ("dependency", 1.0),
            ("install", 1.0),
        ],
    ),
    (
        Episode::Docs,
        &[
            ("readme", 2.0),
            ("documentation", 2.0),
            ("docstring", 2.0),
            ("changelog", 2.0),
            ("markdown", 1.0),
        ],
    ),
    (
        Episode::Review,
        &[
            ("pull request", 2.0),
            ("code review", 2.0),
            ("review", 1.0),
            ("lgtm", 2.0),
            ("audit", 1.0),
        ],
    ),
];

/// Case-sensitive, whole-word error markers in chunk text.
static ERROR_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bTraceback\b|\bpanic:|\bFAIL\b|\berror:")
        .unwrap_or_else(|_| std::process::abort())
});

/// The agent binary; sessions running it are classified from content.
const AGENT_COMMAND: &str = "claude";

fn command_basename(command: &str) -> &str {
    command.rsplit('/').next().unwrap_or(command)
}

fn is_agent_session(meta: &SessionMeta) -> bool {
    if meta.source != SessionSource::Pty {
        return true;
    }
    meta.command
        .first()
        .map(|cmd| command_basename(cmd) == AGENT_COMMAND)
        .unwrap_or(false)
}

/// Classify a session. Agent sessions use the content heuristic over their
/// chunks; everything else matches the command rule tables, first match
/// wins, unmatched commands fall back to [`Episode::Explore`].
pub fn classify_episode(meta: &SessionMeta, chunks: &[Chunk]) -> Episode {
    if is_agent_session(meta) {
        return classify_from_content(chunks);
    }

    let Some(first) = meta.command.first() else {
        return Episode::Explore;
    };
    let cmd0 = command_basename(first);

    if let Some(second) = meta.command.get(1)
        && let Some((_, _, episode)) = COMMAND_PAIR_RULES
            .iter()
            .find(|(a, b, _)| *a == cmd0 && *b == second.as_str())
    {
        return *episode;
    }

    // `python -m pytest` / `python -m pdb` style invocations.
    if cmd0 == "python"
        && meta.command.get(1).map(String::as_str) == Some("-m")
        && let Some(module) = meta.command.get(2)
    {
        match module.as_str() {
            "pytest" => return Episode::Test,
            "pdb" => return Episode::Debug,
            _ => {}
        }
    }

    if let Some((_, episode)) = COMMAND_RULES.iter().find(|(name, _)| *name == cmd0) {
        return *episode;
    }

    if meta.command.iter().skip(1).any(|arg| {
        arg.split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| word.eq_ignore_ascii_case("test"))
    }) {
        return Episode::Test;
    }

    Episode::Explore
}

/// Count weighted keyword hits per category over concatenated chunk text.
fn classify_from_content(chunks: &[Chunk]) -> Episode {
    if chunks.is_empty() {
        return Episode::Explore;
    }
    let text: String = chunks
        .iter()
        .map(|chunk| chunk.text.to_lowercase())
        .collect::<Vec<_>>()
        .join("\n");

    let mut best = Episode::Explore;
    let mut best_score = 0.0f64;
    for (episode, keywords) in CONTENT_LEXICON {
        let mut score = 0.0;
        for (keyword, weight) in *keywords {
            score += text.matches(keyword).count() as f64 * weight;
        }
        if score > best_score {
            best_score = score;
            best = *episode;
        }
    }

    if best_score < CONTENT_SCORE_FLOOR {
        Episode::Explore
    } else {
        best
    }
}

/// A session is in error state when it exited non-zero or its chunk text
/// carries a whole-word error marker.
pub fn detect_error(meta: &SessionMeta, chunks: &[Chunk]) -> bool {
    if matches!(meta.exit_code, Some(code) if code != 0) {
        return true;
    }
    chunks
        .iter()
        .any(|chunk| ERROR_MARKERS.is_match(&chunk.text))
}

/// Up to three one-line fragments describing the detected errors.
pub fn error_summary(meta: &SessionMeta, chunks: &[Chunk]) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();

    if let Some(code) = meta.exit_code
        && code != 0
    {
        parts.push(format!("Exit code {code}"));
    }

    for chunk in chunks {
        if parts.len() >= 3 {
            break;
        }
        if let Some(found) = ERROR_MARKERS.find(&chunk.text) {
            let start = chunk.text[..found.start()]
                .rfind('\n')
                .map(|pos| pos + 1)
                .unwrap_or(0);
            let end = chunk.text[found.start()..]
                .find('\n')
                .map(|pos| found.start() + pos)
                .unwrap_or(chunk.text.len());
            let line = chunk.text[start..end].trim().to_string();
            if !line.is_empty() && !parts.contains(&line) {
                parts.push(line);
            }
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

/// Session ids whose time window falls within ten minutes of the target's.
pub fn find_related_sessions(session_id: &str, all_metas: &[SessionMeta]) -> Vec<String> {
    let Some(target) = all_metas.iter().find(|m| m.id == session_id) else {
        return Vec::new();
    };
    let t_start = target.started_at;
    let t_end = target.ended_at.unwrap_or(target.started_at);

    all_metas
        .iter()
        .filter(|m| m.id != session_id)
        .filter(|m| {
            let m_start = m.started_at;
            let m_end = m.ended_at.unwrap_or(m.started_at);
            let gap = (t_start - m_end)
                .abs()
                .min((m_start - t_end).abs())
                .min((t_start - m_start).abs());
            gap <= MAX_NEIGHBOR_GAP_SECS
        })
        .map(|m| m.id.clone())
        .collect()
}

/// Classify every session in the store and link temporal neighbors.
pub fn build_graph(store: &crate::storage::Store) -> crate::error::Result<Vec<SessionNode>> {
    let all_metas = store.list_sessions()?;
    let mut nodes = Vec::with_capacity(all_metas.len());

    for meta in &all_metas {
        let chunks = store.read_chunks(&meta.id)?;
        let episode = classify_episode(meta, &chunks);
        let has_error = detect_error(meta, &chunks);
        let summary = has_error.then(|| error_summary(meta, &chunks)).flatten();
        let related = find_related_sessions(&meta.id, &all_metas);
        nodes.push(SessionNode {
            meta: meta.clone(),
            episode,
            has_error,
            error_summary: summary,
            related_sessions: related,
        });
    }

    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;
    use pretty_assertions::assert_eq;

    fn meta(command: &[&str], source: SessionSource, exit_code: Option<i32>) -> SessionMeta {
        SessionMeta {
            id: "20250101-000000-aaaa".to_string(),
            source,
            command: command.iter().map(ToString::to_string).collect(),
            cwd: "/tmp".to_string(),
            started_at: 1000.0,
            ended_at: Some(1100.0),
            exit_code,
            agent_session_id: None,
        }
    }

    fn chunk_with(text: &str) -> Chunk {
        Chunk {
            session_id: "20250101-000000-aaaa".to_string(),
            chunk_index: 0,
            source_type: SourceType::Session,
            text: text.to_string(),
            token_count: 1,
            quality: 1.0,
            start_ts: 0.0,
            end_ts: 0.0,
            speaker_role: None,
        }
    }

    #[test]
    fn pytest_command_classifies_as_test() {
        let meta = meta(&["pytest", "-v"], SessionSource::Pty, Some(0));
        assert_eq!(classify_episode(&meta, &[]), Episode::Test);
    }

    #[test]
    fn command_pairs_win_over_single_tokens() {
        let build = meta(&["cargo", "build"], SessionSource::Pty, None);
        assert_eq!(classify_episode(&build, &[]), Episode::Build);
        let test = meta(&["cargo", "test"], SessionSource::Pty, None);
        assert_eq!(classify_episode(&test, &[]), Episode::Test);
        let push = meta(&["docker", "push"], SessionSource::Pty, None);
        assert_eq!(classify_episode(&push, &[]), Episode::Deploy);
        let review = meta(&["git", "diff"], SessionSource::Pty, None);
        assert_eq!(classify_episode(&review, &[]), Episode::Review);
    }

    #[test]
    fn unmatched_command_falls_back_to_explore() {
        let meta = meta(&["ls", "-la"], SessionSource::Pty, Some(0));
        assert_eq!(classify_episode(&meta, &[]), Episode::Explore);
    }

    #[test]
    fn hook_session_with_tracebacks_is_debug_with_error() {
        let meta = meta(&["claude"], SessionSource::Hook, None);
        let chunks = vec![
            chunk_with("Traceback (most recent call last):\n  File \"app.py\""),
            chunk_with("another Traceback appeared in the debugger output"),
        ];
        assert_eq!(classify_episode(&meta, &chunks), Episode::Debug);
        assert!(detect_error(&meta, &chunks));
    }

    #[test]
    fn content_floor_falls_back_to_explore() {
        let meta = meta(&["claude"], SessionSource::Hook, None);
        let chunks = vec![chunk_with("nothing of note here")];
        assert_eq!(classify_episode(&meta, &chunks), Episode::Explore);
    }

    #[test]
    fn error_markers_are_whole_word_and_case_sensitive() {
        let meta = meta(&["bash"], SessionSource::Pty, Some(0));
        assert!(detect_error(&meta, &[chunk_with("thread panic: index out of bounds")]));
        assert!(detect_error(&meta, &[chunk_with("1 test FAIL")]));
        assert!(detect_error(&meta, &[chunk_with("compile error: expected `;`")]));
        // Lowercase "traceback" and embedded "FAILURE" do not count.
        assert!(!detect_error(&meta, &[chunk_with("traceback lowercase")]));
        assert!(!detect_error(&meta, &[chunk_with("FAILURES happen")]));
        assert!(!detect_error(&meta, &[chunk_with("Error: capitalized differently")]));
    }

    #[test]
    fn nonzero_exit_code_is_an_error() {
        let meta = meta(&["make"], SessionSource::Pty, Some(2));
        assert!(detect_error(&meta, &[]));
        let summary = error_summary(&meta, &[]).expect("summary");
        assert_eq!(summary, "Exit code 2");
    }

    #[test]
    fn error_summary_extracts_marker_lines() {
        let meta = meta(&["bash"], SessionSource::Pty, Some(1));
        let chunks = vec![chunk_with("building...\nerror: linker failed\ndone")];
        let summary = error_summary(&meta, &chunks).expect("summary");
        assert_eq!(summary, "Exit code 1; error: linker failed");
    }

    #[test]
    fn related_sessions_respect_the_gap() {
        let mut near = meta(&["make"], SessionSource::Pty, None);
        near.id = "near".to_string();
        near.started_at = 1200.0;
        near.ended_at = Some(1300.0);

        let mut far = meta(&["make"], SessionSource::Pty, None);
        far.id = "far".to_string();
        far.started_at = 90000.0;
        far.ended_at = Some(90100.0);

        let target = meta(&["make"], SessionSource::Pty, None);
        let all = vec![target.clone(), near, far];
        let related = find_related_sessions(&target.id, &all);
        assert_eq!(related, vec!["near".to_string()]);
    }
}
