//! Chunk builders for imported artifacts: todo lists, plan documents, and
//! task trees. Artifact chunks live in the shared artifacts chunk log and
//! carry a non-`session` source type.

use serde::Deserialize;
use serde::Serialize;

use crate::models::Chunk;
use crate::models::SourceType;
use crate::models::estimate_tokens;
use crate::models::quality_score;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub priority: String,
}

fn default_status() -> String {
    "pending".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TodoList {
    pub agent_session_id: String,
    #[serde(default)]
    pub items: Vec<TodoItem>,
    #[serde(default)]
    pub mtime: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    #[serde(default)]
    pub id: String,
    pub agent_session_id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
}

/// One chunk per todo list: `[TODO] status (priority): content` per item.
pub fn chunk_todo_list(todo_list: &TodoList) -> Vec<Chunk> {
    if todo_list.items.is_empty() {
        return Vec::new();
    }

    let text = todo_list
        .items
        .iter()
        .map(|item| format!("[TODO] {} ({}): {}", item.status, item.priority, item.content))
        .collect::<Vec<_>>()
        .join("\n");

    vec![Chunk {
        session_id: todo_list.agent_session_id.clone(),
        chunk_index: 0,
        source_type: SourceType::Todo,
        token_count: estimate_tokens(&text),
        quality: quality_score(&text),
        text,
        start_ts: todo_list.mtime,
        end_ts: todo_list.mtime,
        speaker_role: None,
    }]
}

/// Split a plan document on `##` headings; each section becomes one chunk
/// labelled `[PLAN: slug]`.
pub fn chunk_plan(slug: &str, content: &str, mtime: f64) -> Vec<Chunk> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    for (heading, body) in split_by_headings(content) {
        let text = if heading.is_empty() {
            format!("[PLAN: {slug}]\n{body}")
        } else {
            format!("[PLAN: {slug}] ## {heading}\n{body}")
        };
        if text.trim().is_empty() {
            continue;
        }
        chunks.push(Chunk {
            session_id: format!("plan-{slug}"),
            chunk_index: chunks.len() as u32,
            source_type: SourceType::Plan,
            token_count: estimate_tokens(&text),
            quality: quality_score(&text),
            text,
            start_ts: mtime,
            end_ts: mtime,
            speaker_role: None,
        });
    }
    chunks
}

/// One chunk per task: subject, status, description, and dependency edges.
pub fn chunk_task(task: &TaskItem, index: u32) -> Chunk {
    let mut parts = vec![format!("[TASK] {} ({})", task.subject, task.status)];
    if !task.description.is_empty() {
        parts.push(task.description.clone());
    }
    if !task.blocks.is_empty() {
        parts.push(format!("Blocks: {}", task.blocks.join(", ")));
    }
    if !task.blocked_by.is_empty() {
        parts.push(format!("Blocked by: {}", task.blocked_by.join(", ")));
    }
    let text = parts.join("\n");

    Chunk {
        session_id: task.agent_session_id.clone(),
        chunk_index: index,
        source_type: SourceType::Task,
        token_count: estimate_tokens(&text),
        quality: quality_score(&text),
        text,
        start_ts: 0.0,
        end_ts: 0.0,
        speaker_role: None,
    }
}

/// Split Markdown on `## ` headings. The first entry may carry an empty
/// heading when content precedes the first heading.
fn split_by_headings(content: &str) -> Vec<(String, String)> {
    let mut sections: Vec<(String, String)> = Vec::new();
    let mut heading = String::new();
    let mut lines: Vec<&str> = Vec::new();

    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("## ") {
            if !lines.is_empty() || !heading.is_empty() {
                sections.push((heading.clone(), lines.join("\n").trim().to_string()));
            }
            heading = rest.trim().to_string();
            lines.clear();
        } else {
            lines.push(line);
        }
    }
    if !lines.is_empty() || !heading.is_empty() {
        sections.push((heading, lines.join("\n").trim().to_string()));
    }

    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn todo_list_becomes_one_chunk() {
        let todo_list = TodoList {
            agent_session_id: "agent-1".to_string(),
            items: vec![
                TodoItem {
                    content: "write tests".to_string(),
                    status: "pending".to_string(),
                    priority: "high".to_string(),
                },
                TodoItem {
                    content: "fix chunker".to_string(),
                    status: "completed".to_string(),
                    priority: "low".to_string(),
                },
            ],
            mtime: 42.0,
        };

        let chunks = chunk_todo_list(&todo_list);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source_type, SourceType::Todo);
        assert_eq!(
            chunks[0].text,
            "[TODO] pending (high): write tests\n[TODO] completed (low): fix chunker"
        );
        assert_eq!(chunks[0].start_ts, 42.0);
    }

    #[test]
    fn empty_todo_list_yields_nothing() {
        let todo_list = TodoList {
            agent_session_id: "agent-1".to_string(),
            items: Vec::new(),
            mtime: 0.0,
        };
        assert!(chunk_todo_list(&todo_list).is_empty());
    }

    #[test]
    fn plan_splits_on_second_level_headings() {
        let content = "intro before headings\n\n## Approach\nuse a flat index\n\n## Risks\nnone";
        let chunks = chunk_plan("rework", content, 7.0);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "[PLAN: rework]\nintro before headings");
        assert_eq!(chunks[1].text, "[PLAN: rework] ## Approach\nuse a flat index");
        assert_eq!(chunks[2].text, "[PLAN: rework] ## Risks\nnone");
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as u32);
            assert_eq!(chunk.source_type, SourceType::Plan);
        }
    }

    #[test]
    fn task_chunk_includes_dependencies() {
        let task = TaskItem {
            id: "3".to_string(),
            agent_session_id: "agent-1".to_string(),
            subject: "Wire up retriever".to_string(),
            description: "Connect scoring to the index.".to_string(),
            status: "in_progress".to_string(),
            blocks: vec!["4".to_string()],
            blocked_by: vec!["1".to_string(), "2".to_string()],
        };

        let chunk = chunk_task(&task, 3);
        assert_eq!(
            chunk.text,
            "[TASK] Wire up retriever (in_progress)\nConnect scoring to the index.\nBlocks: 4\nBlocked by: 1, 2"
        );
        assert_eq!(chunk.source_type, SourceType::Task);
        assert_eq!(chunk.chunk_index, 3);
    }
}
