//! Cleanup of raw terminal output.

use std::sync::LazyLock;

use regex::Regex;

const ANSI_PATTERN: &str = r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()#][0-9A-Za-z]|\x1b[0-Z\\-~]";

/// Longest escape sequence held back waiting for its terminator.
const MAX_PENDING_ESCAPE: usize = 256;

static ANSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(ANSI_PATTERN).expect("ANSI pattern is valid"));

static ANSI_AT_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^(?:{ANSI_PATTERN})")).expect("anchored ANSI pattern is valid")
});

/// Remove terminal escape sequences and normalise CRLF line endings.
pub fn strip_ansi(text: &str) -> String {
    ANSI.replace_all(text, "").replace("\r\n", "\n")
}

/// Streaming variant of [`strip_ansi`] that reassembles escape sequences
/// split across reads.
#[derive(Debug, Default)]
pub struct AnsiStripper {
    enabled: bool,
    pending: String,
}

impl AnsiStripper {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            pending: String::new(),
        }
    }

    /// Feed one raw chunk, returning the cleaned text that is safe to emit.
    pub fn push(&mut self, chunk: &str) -> String {
        if !self.enabled {
            return chunk.to_string();
        }

        let mut text = std::mem::take(&mut self.pending);
        text.push_str(chunk);

        let split = self.hold_back_point(&text);
        self.pending = text.split_off(split);
        strip_ansi(&text)
    }

    /// Emit whatever is still held back.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        if self.enabled { strip_ansi(&rest) } else { rest }
    }

    fn hold_back_point(&self, text: &str) -> usize {
        if let Some(esc) = text.rfind('\x1b') {
            let tail = &text[esc..];
            if !ANSI_AT_START.is_match(tail) && tail.len() < MAX_PENDING_ESCAPE {
                return esc;
            }
        }
        if text.ends_with('\r') {
            return text.len() - 1;
        }
        text.len()
    }
}
