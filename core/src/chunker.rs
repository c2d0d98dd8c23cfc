//! Token-bounded chunking of transcript turns and PTY event logs.
//!
//! Both input shapes funnel into the same accumulate-and-cut loop: text is
//! gathered into a buffer, and whenever the buffer exceeds the token budget
//! a chunk is cut at the best available boundary (paragraph, then sentence,
//! then exact characters) with an overlap tail carried into the next chunk.
//! Every emitted chunk satisfies `token_count(text) <= max_tokens`.

use crate::config::ChunkingSettings;
use crate::models::Chunk;
use crate::models::EventStream;
use crate::models::SessionEvent;
use crate::models::SourceType;
use crate::models::SpeakerRole;
use crate::models::estimate_tokens;
use crate::models::quality_score;
use crate::sanitizer::strip_terminal_noise;
use crate::transcript::TranscriptEntry;

/// Idle gap between PTY events that starts a new episode.
const EPISODE_GAP_SECS: f64 = 30.0;

struct ChunkBuilder<'a> {
    session_id: &'a str,
    source_type: SourceType,
    settings: ChunkingSettings,
    max_chars: usize,
    overlap_chars: usize,
    chunks: Vec<Chunk>,
    buffer: String,
    start_ts: f64,
    end_ts: f64,
    saw_user: bool,
    saw_assistant: bool,
}

impl<'a> ChunkBuilder<'a> {
    fn new(session_id: &'a str, source_type: SourceType, settings: ChunkingSettings) -> Self {
        Self {
            session_id,
            source_type,
            settings,
            max_chars: settings.max_tokens as usize * 4,
            overlap_chars: settings.overlap_tokens as usize * 4,
            chunks: Vec::new(),
            buffer: String::new(),
            start_ts: 0.0,
            end_ts: 0.0,
            saw_user: false,
            saw_assistant: false,
        }
    }

    fn push(&mut self, text: &str, ts: f64, role: Option<SpeakerRole>) {
        if text.trim().is_empty() {
            return;
        }
        if self.buffer.is_empty() {
            self.start_ts = ts;
        } else {
            self.buffer.push_str("\n\n");
        }
        self.buffer.push_str(text);
        self.end_ts = ts;
        match role {
            Some(SpeakerRole::User) => self.saw_user = true,
            Some(SpeakerRole::Assistant) => self.saw_assistant = true,
            Some(SpeakerRole::Mixed) => {
                self.saw_user = true;
                self.saw_assistant = true;
            }
            None => {}
        }

        let before = self.chunks.len();
        while estimate_tokens(&self.buffer) > self.settings.max_tokens {
            let (head, sep, rest) = split_head(&self.buffer, self.max_chars);
            let tail = overlap_tail(&head, self.overlap_chars);
            self.emit(&head, ts);
            self.buffer.clear();
            if !tail.is_empty() && !rest.is_empty() {
                self.buffer.push_str(&tail);
                self.buffer.push_str(sep);
                self.buffer.push_str(&rest);
            } else {
                self.buffer.push_str(&tail);
                self.buffer.push_str(&rest);
            }
            self.start_ts = ts;
        }
        if self.chunks.len() > before {
            // The carried buffer belongs to the entry being pushed; earlier
            // speakers went out with the emitted chunks.
            self.saw_user = matches!(role, Some(SpeakerRole::User | SpeakerRole::Mixed));
            self.saw_assistant = matches!(role, Some(SpeakerRole::Assistant | SpeakerRole::Mixed));
        }
    }

    fn emit(&mut self, text: &str, ts: f64) {
        let role = match (self.saw_user, self.saw_assistant) {
            (true, true) => Some(SpeakerRole::Mixed),
            (true, false) => Some(SpeakerRole::User),
            (false, true) => Some(SpeakerRole::Assistant),
            (false, false) => None,
        };
        self.chunks.push(Chunk {
            session_id: self.session_id.to_string(),
            chunk_index: self.chunks.len() as u32,
            source_type: self.source_type,
            text: text.to_string(),
            token_count: estimate_tokens(text),
            quality: quality_score(text),
            start_ts: self.start_ts,
            end_ts: ts.max(self.end_ts),
            speaker_role: role,
        });
    }

    /// Flush the buffer as a final chunk and reset speaker tracking. Used
    /// at episode boundaries, where no overlap is carried across.
    fn barrier(&mut self) {
        if !self.buffer.trim().is_empty() {
            let text = std::mem::take(&mut self.buffer);
            let end_ts = self.end_ts;
            self.emit(&text, end_ts);
        }
        self.buffer.clear();
        self.saw_user = false;
        self.saw_assistant = false;
    }

    fn finish(mut self) -> Vec<Chunk> {
        self.barrier();
        self.chunks
    }
}

/// Chunk extracted transcript turns with role prefixes.
pub fn chunks_from_entries(
    entries: &[TranscriptEntry],
    session_id: &str,
    settings: ChunkingSettings,
) -> Vec<Chunk> {
    let mut builder = ChunkBuilder::new(session_id, SourceType::Session, settings);
    for entry in entries {
        let prefix = match entry.role {
            SpeakerRole::User => "User",
            SpeakerRole::Assistant => "Assistant",
            SpeakerRole::Mixed => "User",
        };
        let prefixed = format!("{prefix}: {}", entry.text);
        builder.push(&prefixed, entry.timestamp, Some(entry.role));
    }
    builder.finish()
}

/// Chunk a PTY event log. Output events are grouped into episodes at idle
/// gaps of 30 s or at a form feed, sanitized of TUI noise, and sized like
/// transcript turns.
pub fn chunks_from_events(
    events: &[SessionEvent],
    session_id: &str,
    settings: ChunkingSettings,
) -> Vec<Chunk> {
    let mut builder = ChunkBuilder::new(session_id, SourceType::Session, settings);

    let mut episode_text = String::new();
    let mut episode_start = 0.0f64;
    let mut episode_end = 0.0f64;
    let mut open = false;

    let flush = |builder: &mut ChunkBuilder<'_>, text: &mut String, start: f64, end: f64| {
        let cleaned = strip_terminal_noise(text);
        if !cleaned.trim().is_empty() {
            builder.push(&cleaned, start, None);
            builder.end_ts = end.max(start);
        }
        builder.barrier();
        text.clear();
    };

    for event in events {
        if event.stream != EventStream::Out {
            continue;
        }
        let breaks_episode =
            open && (event.ts - episode_end >= EPISODE_GAP_SECS || event.text.contains('\u{0C}'));
        if breaks_episode {
            flush(&mut builder, &mut episode_text, episode_start, episode_end);
            open = false;
        }
        if !open {
            episode_start = event.ts;
            open = true;
        }
        episode_text.push_str(&event.text.replace('\u{0C}', "\n"));
        episode_end = event.ts;
    }
    if open {
        flush(&mut builder, &mut episode_text, episode_start, episode_end);
    }

    builder.finish()
}

/// Cut `text` into `(head, separator, rest)` where the head holds at most
/// `max_chars` characters, preferring a paragraph boundary, then a sentence
/// boundary, then an exact character split.
fn split_head(text: &str, max_chars: usize) -> (String, &'static str, String) {
    let limit = byte_index_at_char(text, max_chars);
    if limit >= text.len() {
        return (text.to_string(), "", String::new());
    }
    let head_region = &text[..limit];
    // A boundary in the first half would cut a pathologically small head
    // (and an overlap tail could re-introduce it, stalling the cut loop), so
    // boundaries only count in the second half of the window.
    let min_head_chars = max_chars / 2;
    let long_enough = |pos: usize| text[..pos].chars().count() >= min_head_chars;

    if let Some(pos) = head_region.rfind("\n\n")
        && long_enough(pos)
    {
        return (text[..pos].to_string(), "\n\n", text[pos + 2..].to_string());
    }

    if let Some(pos) = last_sentence_boundary(head_region)
        && long_enough(pos)
    {
        return (
            text[..pos].to_string(),
            " ",
            text[pos..].trim_start().to_string(),
        );
    }

    (head_region.to_string(), "", text[limit..].to_string())
}

/// Overlap tail of an emitted chunk: the last `overlap_chars` characters,
/// re-cut at a paragraph boundary inside the tail if one exists, else a
/// sentence boundary, else taken verbatim.
fn overlap_tail(text: &str, overlap_chars: usize) -> String {
    if overlap_chars == 0 {
        return String::new();
    }
    let total_chars = text.chars().count();
    if total_chars <= overlap_chars {
        return text.to_string();
    }
    let start = byte_index_at_char(text, total_chars - overlap_chars);
    let tail = &text[start..];

    if let Some(pos) = tail.find("\n\n") {
        return tail[pos + 2..].to_string();
    }
    if let Some(pos) = first_sentence_boundary(tail) {
        return tail[pos..].trim_start().to_string();
    }
    tail.to_string()
}

fn byte_index_at_char(text: &str, char_pos: usize) -> usize {
    text.char_indices()
        .nth(char_pos)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len())
}

/// Byte offset just past the last `. `, `! `, or `? ` in `region`.
fn last_sentence_boundary(region: &str) -> Option<usize> {
    [". ", "! ", "? "]
        .iter()
        .filter_map(|pat| region.rfind(pat).map(|pos| pos + 1))
        .max()
        .filter(|&pos| pos > 1)
}

fn first_sentence_boundary(region: &str) -> Option<usize> {
    [". ", "! ", "? "]
        .iter()
        .filter_map(|pat| region.find(pat).map(|pos| pos + 1))
        .min()
}
