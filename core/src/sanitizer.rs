//! Streaming ANSI/TUI sanitizer.
//!
//! [`AnsiStripper`] consumes raw terminal bytes in arbitrary batches, strips
//! escape sequences and control characters, normalizes line endings, and
//! decodes UTF-8 incrementally (a trailing partial sequence is held until the
//! next batch). [`strip_terminal_noise`] is the second pass applied to
//! accumulated text blocks: it drops TUI chrome and collapses whitespace.
//!
//! Both passes are pure and idempotent on already-clean text.

use std::sync::LazyLock;

use regex::Regex;

/// Version of the chrome pattern list below. The patterns target a specific
/// agent's TUI and evolve independently of the code around them.
pub const NOISE_PATTERNS_VERSION: u32 = 1;

/// Anchored patterns for agent prompt-banner and hint-bar lines. A line
/// matching any of these is dropped wholesale.
const CHROME_PATTERNS: &[&str] = &[
    r"(?i)^\s*accept\s+edits?\s+on\b.*$",
    r"(?i)^.*shift\+tab\s+to\s+cycle.*$",
    r"(?i)^.*esc\s+to\s+cancel.*$",
    r"(?i)^.*tab\s+to\s+amend.*$",
    r"(?i)^.*ctrl\+[a-z]\s+to\s+\w+.*$",
    r"(?i)^\s*do\s+you\s+want\s+to\s+proceed\??\s*$",
    r"(?i)^\s*yes,?\s+and\s+always\s+allow.*$",
    r"(?i)^.*\bfor\s+bash\s+mode\b.*$",
    r"(?i)^\s*\S+ing…\s*(\([^)]*tokens?\))?\s*$",
    r"(?i)^\s*running…\s*$",
    r"(?i)^\s*reading\s+\d+\s+files?…\s*$",
    r"(?i)^\s*thought\s+for\s+\d+s\s*$",
    r"(?i)^\s*\d+[ms]\s+[\d.]+[km]?\s*tokens?\s*$",
];

static CHROME_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    CHROME_PATTERNS
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
});

static SPACE_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]{2,}").unwrap_or_else(|_| std::process::abort()));

/// Glyphs that count as spinner/ornament noise in addition to the block
/// ranges checked in [`is_noise_char`].
const SPINNER_GLYPHS: &str = "\u{00B7}\u{276F}\u{27E8}\u{27E9}\u{29C9}\u{23F5}\u{279C}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ground,
    /// Received ESC (0x1B).
    Esc,
    /// ESC followed by an intermediate byte (0x20..0x2F).
    EscIntermediate,
    /// Inside a CSI sequence (`ESC [` ...).
    CsiParam,
    /// Inside an OSC/SOS/PM/APC string sequence.
    OscString,
    /// Inside a DCS string sequence (`ESC P` ...).
    DcsString,
    /// ESC seen while inside a string sequence; `\` completes ST.
    StringEsc,
}

/// Streaming escape-sequence stripper.
///
/// ```
/// use memory_bank_core::sanitizer::AnsiStripper;
///
/// let mut stripper = AnsiStripper::new();
/// let mut text = stripper.process(b"\x1b[31mhello\x1b[0m\r\nworld\x07");
/// text.push_str(&stripper.flush());
/// assert_eq!(text, "hello\nworld");
/// ```
#[derive(Debug)]
pub struct AnsiStripper {
    state: State,
    /// Partial trailing UTF-8 sequence carried across batches.
    utf8_pending: Vec<u8>,
    /// Deferred `\r` for cross-batch `\r\n` handling.
    pending_cr: bool,
}

impl Default for AnsiStripper {
    fn default() -> Self {
        Self::new()
    }
}

impl AnsiStripper {
    pub fn new() -> Self {
        Self {
            state: State::Ground,
            utf8_pending: Vec::new(),
            pending_cr: false,
        }
    }

    /// Process one batch of raw bytes and return the sanitized text.
    pub fn process(&mut self, data: &[u8]) -> String {
        let decoded = self.decode(data, false);
        self.strip(&decoded)
    }

    /// Flush remaining state at end of stream.
    pub fn flush(&mut self) -> String {
        let decoded = self.decode(&[], true);
        let mut text = self.strip(&decoded);
        if self.pending_cr {
            self.pending_cr = false;
            text.insert(0, '\n');
        }
        text
    }

    /// Incremental UTF-8 decode: invalid sequences become U+FFFD; an
    /// incomplete trailing sequence is held unless `last` is set.
    fn decode(&mut self, data: &[u8], last: bool) -> String {
        let mut buf = std::mem::take(&mut self.utf8_pending);
        buf.extend_from_slice(data);

        let mut out = String::with_capacity(buf.len());
        let mut pos = 0;
        while pos < buf.len() {
            match std::str::from_utf8(&buf[pos..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    pos = buf.len();
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    if valid_up_to > 0 {
                        // Safe by construction: from_utf8 validated this prefix.
                        if let Ok(valid) = std::str::from_utf8(&buf[pos..pos + valid_up_to]) {
                            out.push_str(valid);
                        }
                        pos += valid_up_to;
                    }
                    match err.error_len() {
                        Some(invalid_len) => {
                            out.push('\u{FFFD}');
                            pos += invalid_len;
                        }
                        None => {
                            // Incomplete trailing sequence.
                            if last {
                                out.push('\u{FFFD}');
                                pos = buf.len();
                            } else {
                                self.utf8_pending = buf[pos..].to_vec();
                                pos = buf.len();
                                return out;
                            }
                        }
                    }
                }
            }
        }
        out
    }

    fn strip(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for ch in text.chars() {
            match self.state {
                State::Ground => self.ground(ch, &mut out),
                State::Esc => self.esc(ch, &mut out),
                State::EscIntermediate => {
                    let cp = ch as u32;
                    if (0x30..=0x7E).contains(&cp) {
                        self.state = State::Ground;
                    } else if !(0x20..=0x2F).contains(&cp) {
                        self.state = State::Ground;
                        self.ground(ch, &mut out);
                    }
                }
                State::CsiParam => {
                    // Parameter (0x30..0x3F) and intermediate (0x20..0x2F)
                    // bytes continue; a final byte (0x40..0x7E) terminates.
                    let cp = ch as u32;
                    if (0x40..=0x7E).contains(&cp) {
                        self.state = State::Ground;
                    }
                }
                State::OscString | State::DcsString => match ch {
                    '\u{1B}' => self.state = State::StringEsc,
                    '\u{07}' | '\u{9C}' => self.state = State::Ground,
                    _ => {}
                },
                State::StringEsc => {
                    self.state = State::Ground;
                    if ch != '\\' {
                        // Not a real ST; reprocess from ground.
                        self.ground(ch, &mut out);
                    }
                }
            }
        }
        out
    }

    fn ground(&mut self, ch: char, out: &mut String) {
        if self.pending_cr {
            self.pending_cr = false;
            out.push('\n');
            if ch == '\n' {
                return;
            }
        }

        match ch {
            '\u{1B}' => self.state = State::Esc,
            '\r' => self.pending_cr = true,
            '\n' | '\t' => out.push(ch),
            '\u{9B}' => self.state = State::CsiParam,
            '\u{9D}' | '\u{98}' | '\u{9E}' | '\u{9F}' => self.state = State::OscString,
            '\u{90}' => self.state = State::DcsString,
            ch if (ch as u32) < 0x20 => {}
            ch if (0x80..=0x9F).contains(&(ch as u32)) => {}
            ch => out.push(ch),
        }
    }

    fn esc(&mut self, ch: char, out: &mut String) {
        let cp = ch as u32;
        match ch {
            '[' => self.state = State::CsiParam,
            ']' | 'X' | '^' | '_' => self.state = State::OscString,
            'P' => self.state = State::DcsString,
            // SS2/SS3 affect only the next character; treat it normally.
            'N' | 'O' => self.state = State::Ground,
            _ if (0x20..=0x2F).contains(&cp) => self.state = State::EscIntermediate,
            _ if (0x30..=0x7E).contains(&cp) => self.state = State::Ground,
            _ => {
                self.state = State::Ground;
                self.ground(ch, out);
            }
        }
    }
}

/// One-shot convenience over [`AnsiStripper`].
pub fn sanitize(data: &[u8]) -> String {
    let mut stripper = AnsiStripper::new();
    let mut text = stripper.process(data);
    text.push_str(&stripper.flush());
    text
}

fn is_noise_char(ch: char) -> bool {
    matches!(ch as u32,
        0x2500..=0x257F      // box drawing
        | 0x2580..=0x259F    // block elements
        | 0x2800..=0x28FF    // braille spinners
        | 0x2700..=0x27BF    // dingbats
        | 0x2190..=0x21FF    // arrows
        | 0x23B0..=0x23FF    // misc technical
        | 0x2B50..=0x2B5F)   // stars
        || SPINNER_GLYPHS.contains(ch)
}

/// A non-blank line made entirely of box-drawing, braille, or spinner glyphs.
fn is_noise_line(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && trimmed.chars().all(is_noise_char)
}

fn is_chrome_line(line: &str) -> bool {
    CHROME_RES.iter().any(|re| re.is_match(line))
}

/// Remove TUI chrome from sanitized text.
///
/// Drops noise-only and chrome lines, collapses runs of two or more spaces
/// to one (outside fenced code blocks), and collapses three or more blank
/// lines to two.
pub fn strip_terminal_noise(text: &str) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut in_fence = false;

    for line in text.split('\n') {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            kept.push(line.to_string());
            continue;
        }
        if in_fence {
            kept.push(line.to_string());
            continue;
        }
        if is_noise_line(line) || is_chrome_line(line) {
            continue;
        }
        kept.push(SPACE_RUN_RE.replace_all(line, " ").into_owned());
    }

    // Collapse runs of >= 3 blank lines down to 2.
    let mut out: Vec<&str> = Vec::with_capacity(kept.len());
    let mut blanks = 0usize;
    for line in &kept {
        if line.trim().is_empty() {
            blanks += 1;
            if blanks > 2 {
                continue;
            }
        } else {
            blanks = 0;
        }
        out.push(line);
    }

    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn strips_sgr_and_bel_and_normalizes_crlf() {
        assert_eq!(sanitize(b"\x1B[31mhello\x1B[0m\r\nworld\x07"), "hello\nworld");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let cases: &[&[u8]] = &[
            b"plain text\nwith lines",
            b"\x1B[2Jcleared\x1B]0;title\x07rest",
            b"tabs\tand\nnewlines\r\n",
        ];
        for case in cases {
            let once = sanitize(case);
            let twice = sanitize(once.as_bytes());
            assert_eq!(twice, once);
        }
    }

    #[test]
    fn output_contains_no_control_bytes_except_tab_and_newline() {
        let noisy: Vec<u8> = (0u8..=255).collect();
        let cleaned = sanitize(&noisy);
        for ch in cleaned.chars() {
            let cp = ch as u32;
            assert!(
                cp >= 0x20 || ch == '\t' || ch == '\n',
                "unexpected control char {cp:#x}"
            );
        }
    }

    #[test]
    fn escape_sequence_split_across_batches() {
        let mut stripper = AnsiStripper::new();
        let mut text = stripper.process(b"\x1B[3");
        text.push_str(&stripper.process(b"1mred\x1B["));
        text.push_str(&stripper.process(b"0m"));
        text.push_str(&stripper.flush());
        assert_eq!(text, "red");
    }

    #[test]
    fn partial_utf8_held_across_batches() {
        // "é" is 0xC3 0xA9.
        let mut stripper = AnsiStripper::new();
        let mut text = stripper.process(b"caf\xC3");
        text.push_str(&stripper.process(b"\xA9"));
        text.push_str(&stripper.flush());
        assert_eq!(text, "café");
    }

    #[test]
    fn invalid_utf8_becomes_replacement_char() {
        assert_eq!(sanitize(b"ab\xFFcd"), "ab\u{FFFD}cd");
    }

    #[test]
    fn bare_cr_becomes_newline() {
        assert_eq!(sanitize(b"line1\rline2"), "line1\nline2");
        // Trailing CR flushes as a newline.
        assert_eq!(sanitize(b"line\r"), "line\n");
    }

    #[test]
    fn osc_title_sequence_is_dropped() {
        assert_eq!(sanitize(b"\x1B]0;window title\x07visible"), "visible");
        // ESC \ (ST) terminator form.
        assert_eq!(sanitize(b"\x1B]8;;uri\x1B\\visible"), "visible");
    }

    #[test]
    fn noise_lines_are_removed() {
        let text = "real output\n────────────\n⠋⠙⠹\nmore output";
        assert_eq!(strip_terminal_noise(text), "real output\nmore output");
    }

    #[test]
    fn chrome_lines_are_removed() {
        let text = "keep me\n  Esc to cancel\nThinking… (1.2k tokens)\nkeep me too";
        assert_eq!(strip_terminal_noise(text), "keep me\nkeep me too");
    }

    #[test]
    fn blank_runs_collapse_to_two() {
        let text = "a\n\n\n\n\nb";
        assert_eq!(strip_terminal_noise(text), "a\n\n\nb");
    }

    #[test]
    fn space_runs_collapse_outside_fences() {
        let text = "a    b\n```\nx    y\n```\nc  d";
        assert_eq!(strip_terminal_noise(text), "a b\n```\nx    y\n```\nc d");
    }

    #[test]
    fn noise_filter_is_idempotent() {
        let text = "a    b\n────\n\n\n\n\nend";
        let once = strip_terminal_noise(text);
        assert_eq!(strip_terminal_noise(&once), once);
    }
}
