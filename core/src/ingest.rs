//! Ingestion sources: the Stop-hook path, retroactive import of historical
//! agent sessions, and artifact import (todos, plans, tasks).

use std::path::Path;
use std::path::PathBuf;

use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::artifacts::TaskItem;
use crate::artifacts::TodoItem;
use crate::artifacts::TodoList;
use crate::artifacts::chunk_plan;
use crate::artifacts::chunk_task;
use crate::artifacts::chunk_todo_list;
use crate::chunker::chunks_from_entries;
use crate::chunker::chunks_from_events;
use crate::error::MemoryBankError;
use crate::error::Result;
use crate::models::SessionSource;
use crate::models::SourceType;
use crate::storage::CreateSession;
use crate::storage::HookSessionState;
use crate::storage::Store;
use crate::storage::artifact_key;
use crate::storage::now_ts;
use crate::transcript::extract_entries;

/// Encode a project path the way the host agent names its per-project
/// directories: `/home/user/my_project` becomes `-home-user-my-project`
/// (both `/` and `_` map to `-`).
pub fn encode_project_dir(cwd: &str) -> String {
    let trimmed = cwd.trim_end_matches('/').trim_start_matches('/');
    format!("-{}", trimmed.replace(['/', '_'], "-"))
}

/// Chunk every session that still needs it. PTY sessions are chunked from
/// their event logs; hook and import sessions receive chunks at ingest time
/// (the hook path re-chunks on its own when the transcript grows).
///
/// Takes the store's exclusive lock itself, so callers need no lock of
/// their own; holding one across this call would deadlock.
pub fn chunk_all_sessions(store: &Store, force: bool) -> Result<()> {
    let settings = store.read_config()?.chunking;
    let _guard = store.lock_exclusive()?;
    for meta in store.list_sessions()? {
        if store.has_chunks(&meta.id) && !force {
            continue;
        }
        if !store.has_events(&meta.id) {
            continue;
        }
        let events = store.read_events(&meta.id)?;
        let chunks = chunks_from_events(&events, &meta.id, settings);
        if !chunks.is_empty() {
            store.write_chunks(&meta.id, &chunks)?;
        }
    }
    Ok(())
}

/// Process one Stop-hook invocation: map the agent session to ours, skip
/// when the transcript has not grown, otherwise (re-)chunk it wholesale.
/// Returns the ids of sessions that were updated.
pub fn ingest_hook(
    store: &Store,
    transcript_path: &Path,
    cwd: &str,
    agent_session_id: &str,
) -> Result<Vec<String>> {
    let Ok(meta) = transcript_path.metadata() else {
        return Ok(Vec::new());
    };
    let transcript_size = meta.len();
    if transcript_size == 0 {
        return Ok(Vec::new());
    }

    let _guard = store.lock_exclusive()?;
    let mut state = store.load_hooks_state();

    let session_id = match state.sessions.get(agent_session_id) {
        Some(existing) if existing.transcript_size == transcript_size => {
            return Ok(Vec::new());
        }
        Some(existing) => existing.mb_session_id.clone(),
        None => {
            let mut params = CreateSession::new(
                vec!["claude".to_string()],
                cwd,
                SessionSource::Hook,
            );
            params.agent_session_id = Some(agent_session_id.to_string());
            store.create_session(params)?.id
        }
    };

    let entries = extract_entries(transcript_path)?;
    if entries.is_empty() {
        state.sessions.insert(
            agent_session_id.to_string(),
            HookSessionState {
                mb_session_id: session_id,
                transcript_path: transcript_path.display().to_string(),
                transcript_size,
                last_processed: now_ts(),
            },
        );
        store.save_hooks_state(&state)?;
        return Ok(Vec::new());
    }

    let settings = store.read_config()?.chunking;
    let chunks = chunks_from_entries(&entries, &session_id, settings);
    store.write_chunks(&session_id, &chunks)?;
    store.finalize_session(&session_id, None, entries.last().map(|e| e.timestamp))?;

    state.sessions.insert(
        agent_session_id.to_string(),
        HookSessionState {
            mb_session_id: session_id.clone(),
            transcript_path: transcript_path.display().to_string(),
            transcript_size,
            last_processed: now_ts(),
        },
    );
    store.save_hooks_state(&state)?;

    Ok(vec![session_id])
}

/// Counters reported by an import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    pub imported: usize,
    pub skipped: usize,
    pub todos: usize,
    pub plans: usize,
    pub tasks: usize,
}

/// Import historical agent sessions and artifacts for this project from
/// `agent_home` (conventionally `~/.claude`). Malformed transcripts are
/// skipped per file; already-imported sessions and artifacts are
/// deduplicated through `import_state.json`.
pub fn import_agent_history(
    store: &Store,
    agent_home: &Path,
    dry_run: bool,
) -> Result<ImportOutcome> {
    let mut outcome = ImportOutcome::default();
    let cwd = store
        .root()
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    let _guard = store.lock_exclusive()?;
    let mut state = store.load_import_state();
    let settings = store.read_config()?.chunking;

    let project_dir = agent_home.join("projects").join(encode_project_dir(&cwd));
    for transcript in list_files_with_extension(&project_dir, "jsonl") {
        let Some(stem) = transcript.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.starts_with("agent-") {
            continue;
        }
        if state.imported.contains_key(stem) {
            outcome.skipped += 1;
            continue;
        }

        let entries = match extract_entries(&transcript) {
            Ok(entries) => entries,
            Err(MemoryBankError::TranscriptMalformed { path, detail }) => {
                warn!("skipping malformed transcript {}: {detail}", path.display());
                outcome.skipped += 1;
                continue;
            }
            Err(err) => return Err(err),
        };
        if entries.is_empty() {
            outcome.skipped += 1;
            continue;
        }

        if dry_run {
            outcome.imported += 1;
            continue;
        }

        let started_at = entries.first().map(|e| e.timestamp).unwrap_or(0.0);
        let ended_at = entries.last().map(|e| e.timestamp).unwrap_or(0.0);

        let mut params =
            CreateSession::new(vec!["claude".to_string()], cwd.clone(), SessionSource::Import);
        params.started_at = Some(started_at);
        params.agent_session_id = Some(stem.to_string());
        let meta = store.create_session(params)?;

        let chunks = chunks_from_entries(&entries, &meta.id, settings);
        store.write_chunks(&meta.id, &chunks)?;
        store.finalize_session(&meta.id, None, Some(ended_at))?;

        state.imported.insert(stem.to_string(), meta.id.clone());
        store.save_import_state(&state)?;
        outcome.imported += 1;
    }

    import_artifacts(store, agent_home, &project_dir, dry_run, &mut state, &mut outcome)?;
    store.save_import_state(&state)?;
    Ok(outcome)
}

fn import_artifacts(
    store: &Store,
    agent_home: &Path,
    project_dir: &Path,
    dry_run: bool,
    state: &mut crate::storage::ImportState,
    outcome: &mut ImportOutcome,
) -> Result<()> {
    // Todos: one JSON list per agent session.
    for todo_file in list_files_with_extension(&agent_home.join("todos"), "json") {
        let Some(stem) = todo_file.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let agent_session = stem.split("-agent-").next().unwrap_or(stem).to_string();
        let key = artifact_key(SourceType::Todo, &agent_session, &agent_session);
        if state.artifacts.contains(&key) {
            continue;
        }

        let Some(raw) = read_json_file(&todo_file) else {
            continue;
        };
        let raw_items = match &raw {
            Value::Array(items) => items.clone(),
            Value::Object(map) => map
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        let items: Vec<TodoItem> = raw_items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect();
        if items.is_empty() {
            continue;
        }

        if dry_run {
            outcome.todos += 1;
            continue;
        }

        let mtime = file_mtime(&todo_file);
        let todo_list = TodoList {
            agent_session_id: agent_session.clone(),
            items,
            mtime,
        };
        store.write_todo(
            &agent_session,
            &serde_json::to_value(&todo_list)
                .map_err(|err| MemoryBankError::corrupt(&todo_file, err))?,
        )?;
        let chunks = chunk_todo_list(&todo_list);
        if !chunks.is_empty() {
            store.append_artifact_chunks(&chunks)?;
        }
        state.artifacts.insert(key);
        store.save_import_state(state)?;
        outcome.todos += 1;
    }

    // Plans: slugs referenced from transcripts, bodies under plans/.
    let discovered = discover_plan_slugs(project_dir);
    state.plan_slugs.extend(discovered);
    for slug in state.plan_slugs.clone() {
        let key = artifact_key(SourceType::Plan, "", &slug);
        if state.artifacts.contains(&key) {
            continue;
        }
        let plan_file = agent_home.join("plans").join(format!("{slug}.md"));
        let Ok(content) = std::fs::read_to_string(&plan_file) else {
            continue;
        };
        if content.trim().is_empty() {
            continue;
        }

        if dry_run {
            outcome.plans += 1;
            continue;
        }

        let mtime = file_mtime(&plan_file);
        let session_for_plan = find_session_for_slug(project_dir, &slug).unwrap_or_default();
        let meta = serde_json::json!({
            "slug": slug,
            "agent_session_id": session_for_plan,
            "file_path": plan_file.display().to_string(),
            "mtime": mtime,
        });
        store.write_plan(&slug, &content, &meta)?;
        let chunks = chunk_plan(&slug, &content, mtime);
        if !chunks.is_empty() {
            store.append_artifact_chunks(&chunks)?;
        }
        state.artifacts.insert(key);
        store.save_import_state(state)?;
        outcome.plans += 1;
    }

    // Tasks: one directory per agent session, one JSON per task.
    let tasks_dir = agent_home.join("tasks");
    if let Ok(entries) = std::fs::read_dir(&tasks_dir) {
        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        dirs.sort();
        for dir in dirs {
            let Some(agent_session) = dir.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            let mut imported_any = false;
            let mut chunks = Vec::new();
            let mut task_index = 0u32;

            for task_file in list_files_with_extension(&dir, "json") {
                let Some(task_id) = task_file.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if task_id.starts_with('.') {
                    continue;
                }
                let key = artifact_key(SourceType::Task, agent_session, task_id);
                if state.artifacts.contains(&key) {
                    continue;
                }
                let Some(mut raw) = read_json_file(&task_file) else {
                    continue;
                };
                if let Value::Object(map) = &mut raw {
                    map.insert(
                        "agent_session_id".to_string(),
                        Value::String(agent_session.to_string()),
                    );
                    map.entry("id")
                        .or_insert_with(|| Value::String(task_id.to_string()));
                }
                let Ok(task) = serde_json::from_value::<TaskItem>(raw) else {
                    continue;
                };

                if dry_run {
                    imported_any = true;
                    continue;
                }

                store.write_task(
                    agent_session,
                    &task.id,
                    &serde_json::to_value(&task)
                        .map_err(|err| MemoryBankError::corrupt(&task_file, err))?,
                )?;
                chunks.push(chunk_task(&task, task_index));
                task_index += 1;
                state.artifacts.insert(key);
                imported_any = true;
            }

            if !chunks.is_empty() {
                store.append_artifact_chunks(&chunks)?;
                store.save_import_state(state)?;
            }
            if imported_any {
                outcome.tasks += 1;
            }
        }
    }

    Ok(())
}

/// Slugs referenced by `"slug"` fields anywhere in the project transcripts.
fn discover_plan_slugs(project_dir: &Path) -> Vec<String> {
    let mut slugs = Vec::new();
    for transcript in list_files_with_extension(project_dir, "jsonl") {
        let Ok(content) = std::fs::read_to_string(&transcript) else {
            continue;
        };
        for line in content.lines() {
            let Ok(value) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            if let Some(slug) = value.get("slug").and_then(Value::as_str)
                && !slug.is_empty()
            {
                slugs.push(slug.to_string());
            }
        }
    }
    slugs
}

fn find_session_for_slug(project_dir: &Path, slug: &str) -> Option<String> {
    for transcript in list_files_with_extension(project_dir, "jsonl") {
        let stem = transcript.file_stem()?.to_str()?.to_string();
        let Ok(content) = std::fs::read_to_string(&transcript) else {
            continue;
        };
        for line in content.lines() {
            let Ok(value) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            if value.get("slug").and_then(Value::as_str) == Some(slug) {
                return Some(stem);
            }
        }
    }
    None
}

fn list_files_with_extension(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(extension))
        .collect();
    files.sort();
    files
}

fn read_json_file(path: &Path) -> Option<Value> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!("skipping malformed artifact {}: {err}", path.display());
            None
        }
    }
}

fn file_mtime(path: &Path) -> f64 {
    path.metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, Store) {
        let dir = TempDir::new().expect("create temp dir");
        let (_, store) =
            Store::init(&dir.path().join(crate::storage::MEMORY_BANK_DIR)).expect("init store");
        (dir, store)
    }

    fn write_transcript(path: &Path, lines: &[&str]) {
        let mut file = std::fs::File::create(path).expect("create transcript");
        for line in lines {
            writeln!(file, "{line}").expect("write line");
        }
    }

    const USER_LINE: &str = r#"{"type":"user","timestamp":"2025-06-01T10:00:00Z","message":{"content":"add retry logic to the client"}}"#;
    const ASSISTANT_LINE: &str = r#"{"type":"assistant","timestamp":"2025-06-01T10:00:30Z","message":{"content":[{"type":"text","text":"Done, wrapped in a backoff loop."}]}}"#;

    #[test]
    fn hook_ingest_creates_session_with_chunks() {
        let (dir, store) = test_store();
        let transcript = dir.path().join("transcript.jsonl");
        write_transcript(&transcript, &[USER_LINE, ASSISTANT_LINE]);

        let updated =
            ingest_hook(&store, &transcript, "/tmp/project", "agent-uuid-1").expect("ingest hook");
        assert_eq!(updated.len(), 1);

        let chunks = store.read_chunks(&updated[0]).expect("read chunks");
        assert!(!chunks.is_empty());
        assert!(chunks[0].text.contains("User: add retry logic"));

        let meta = store.read_meta(&updated[0]).expect("read meta");
        assert_eq!(meta.source, SessionSource::Hook);
        assert_eq!(meta.agent_session_id.as_deref(), Some("agent-uuid-1"));
        assert!(meta.ended_at.is_some());
    }

    #[test]
    fn hook_ingest_is_a_noop_when_transcript_unchanged() {
        let (dir, store) = test_store();
        let transcript = dir.path().join("transcript.jsonl");
        write_transcript(&transcript, &[USER_LINE, ASSISTANT_LINE]);

        let first = ingest_hook(&store, &transcript, "/tmp", "agent-1").expect("first ingest");
        assert_eq!(first.len(), 1);
        let second = ingest_hook(&store, &transcript, "/tmp", "agent-1").expect("second ingest");
        assert!(second.is_empty());
    }

    #[test]
    fn hook_ingest_rechunks_when_transcript_grows() {
        let (dir, store) = test_store();
        let transcript = dir.path().join("transcript.jsonl");
        write_transcript(&transcript, &[USER_LINE]);

        let first = ingest_hook(&store, &transcript, "/tmp", "agent-1").expect("first ingest");
        let session_id = first[0].clone();
        let before = store.read_chunks(&session_id).expect("chunks before");

        write_transcript(&transcript, &[USER_LINE, ASSISTANT_LINE]);
        let second = ingest_hook(&store, &transcript, "/tmp", "agent-1").expect("second ingest");
        assert_eq!(second, vec![session_id.clone()]);

        let after = store.read_chunks(&session_id).expect("chunks after");
        assert!(after[0].text.len() > before[0].text.len());
    }

    #[test]
    fn import_discovers_and_deduplicates_sessions() {
        let (project, store) = test_store();
        let agent_home = TempDir::new().expect("create agent home");
        let cwd = project.path().display().to_string();
        let project_dir = agent_home
            .path()
            .join("projects")
            .join(encode_project_dir(&cwd));
        std::fs::create_dir_all(&project_dir).expect("create project dir");

        write_transcript(&project_dir.join("uuid-1.jsonl"), &[USER_LINE, ASSISTANT_LINE]);
        write_transcript(&project_dir.join("agent-sub.jsonl"), &[USER_LINE]);

        let outcome =
            import_agent_history(&store, agent_home.path(), false).expect("import history");
        assert_eq!(outcome.imported, 1);

        let sessions = store.list_sessions().expect("list sessions");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].source, SessionSource::Import);
        // Timestamps come from the transcript, not from the import moment.
        assert!(sessions[0].started_at > 1.7e9 && sessions[0].started_at < 1.8e9);

        let again = import_agent_history(&store, agent_home.path(), false).expect("re-import");
        assert_eq!(again.imported, 0);
        assert_eq!(again.skipped, 1);
    }

    #[test]
    fn import_skips_malformed_transcripts() {
        let (project, store) = test_store();
        let agent_home = TempDir::new().expect("create agent home");
        let cwd = project.path().display().to_string();
        let project_dir = agent_home
            .path()
            .join("projects")
            .join(encode_project_dir(&cwd));
        std::fs::create_dir_all(&project_dir).expect("create project dir");

        write_transcript(
            &project_dir.join("broken.jsonl"),
            &[r#"{"type":"summary","noise":true}"#],
        );

        let outcome = import_agent_history(&store, agent_home.path(), false).expect("import");
        assert_eq!(outcome.imported, 0);
        assert_eq!(outcome.skipped, 1);
    }

    #[test]
    fn import_collects_todo_and_task_artifacts() {
        let (_project, store) = test_store();
        let agent_home = TempDir::new().expect("create agent home");

        let todos_dir = agent_home.path().join("todos");
        std::fs::create_dir_all(&todos_dir).expect("create todos dir");
        std::fs::write(
            todos_dir.join("sess-1.json"),
            r#"[{"content": "wire the index", "status": "pending", "priority": "high"}]"#,
        )
        .expect("write todo file");

        let task_dir = agent_home.path().join("tasks").join("sess-1");
        std::fs::create_dir_all(&task_dir).expect("create tasks dir");
        std::fs::write(
            task_dir.join("1.json"),
            r#"{"subject": "Build retriever", "status": "in_progress"}"#,
        )
        .expect("write task file");

        let outcome = import_agent_history(&store, agent_home.path(), false).expect("import");
        assert_eq!(outcome.todos, 1);
        assert_eq!(outcome.tasks, 1);

        let chunks = store.read_artifact_chunks().expect("artifact chunks");
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().any(|c| c.source_type == SourceType::Todo));
        assert!(chunks.iter().any(|c| c.source_type == SourceType::Task));

        // A second run imports nothing new.
        let again = import_agent_history(&store, agent_home.path(), false).expect("re-import");
        assert_eq!(again.todos, 0);
        assert_eq!(again.tasks, 0);
        assert_eq!(store.read_artifact_chunks().expect("chunks").len(), 2);
    }

    #[test]
    fn import_collects_plans_referenced_by_transcripts() {
        let (project, store) = test_store();
        let agent_home = TempDir::new().expect("create agent home");
        let cwd = project.path().display().to_string();
        let project_dir = agent_home
            .path()
            .join("projects")
            .join(encode_project_dir(&cwd));
        std::fs::create_dir_all(&project_dir).expect("create project dir");
        write_transcript(
            &project_dir.join("uuid-2.jsonl"),
            &[
                USER_LINE,
                r#"{"type":"assistant","slug":"index-rework","message":{"content":"planning"}}"#,
            ],
        );

        let plans_dir = agent_home.path().join("plans");
        std::fs::create_dir_all(&plans_dir).expect("create plans dir");
        std::fs::write(
            plans_dir.join("index-rework.md"),
            "## Goal\nswap to sibling-file rebuilds\n",
        )
        .expect("write plan");

        let outcome = import_agent_history(&store, agent_home.path(), false).expect("import");
        assert_eq!(outcome.plans, 1);

        let chunks = store.read_artifact_chunks().expect("artifact chunks");
        assert!(chunks.iter().any(|c| c.source_type == SourceType::Plan
            && c.text.contains("[PLAN: index-rework]")));
    }

    #[test]
    fn dry_run_counts_without_writing() {
        let (project, store) = test_store();
        let agent_home = TempDir::new().expect("create agent home");
        let cwd = project.path().display().to_string();
        let project_dir = agent_home
            .path()
            .join("projects")
            .join(encode_project_dir(&cwd));
        std::fs::create_dir_all(&project_dir).expect("create project dir");
        write_transcript(&project_dir.join("uuid-1.jsonl"), &[USER_LINE, ASSISTANT_LINE]);

        let outcome = import_agent_history(&store, agent_home.path(), true).expect("dry run");
        assert_eq!(outcome.imported, 1);
        assert!(store.list_sessions().expect("list").is_empty());
    }

    #[test]
    fn encode_project_dir_maps_separators() {
        assert_eq!(encode_project_dir("/home/user/my_project"), "-home-user-my-project");
        assert_eq!(encode_project_dir("/srv/app/"), "-srv-app");
    }

    #[test]
    fn chunk_all_sessions_skips_already_chunked() {
        let (_dir, store) = test_store();
        let meta = store
            .create_session(CreateSession::new(
                vec!["bash".to_string()],
                "/tmp",
                SessionSource::Pty,
            ))
            .expect("create session");
        store
            .append_event(
                &meta.id,
                &crate::models::SessionEvent {
                    ts: 0.0,
                    stream: crate::models::EventStream::Out,
                    text: "captured output worth keeping".to_string(),
                },
            )
            .expect("append event");

        chunk_all_sessions(&store, false).expect("chunk sessions");
        let first = store.read_chunks(&meta.id).expect("read chunks");
        assert_eq!(first.len(), 1);

        // Append another event; without force the session is skipped.
        store
            .append_event(
                &meta.id,
                &crate::models::SessionEvent {
                    ts: 1.0,
                    stream: crate::models::EventStream::Out,
                    text: "later output".to_string(),
                },
            )
            .expect("append event");
        chunk_all_sessions(&store, false).expect("chunk again");
        assert_eq!(store.read_chunks(&meta.id).expect("read").len(), 1);

        chunk_all_sessions(&store, true).expect("force chunk");
        let forced = store.read_chunks(&meta.id).expect("read forced");
        assert!(forced[0].text.contains("later output"));
    }
}
