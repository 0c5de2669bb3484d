//! Terminal control-sequence collapsing for streamed kernel text.
//!
//! Backspaces delete the previous visible character; ANSI escape sequences
//! are atomic tokens that a backspace skips over. Carriage returns let later
//! text on a line replace earlier text, so any line that ends in a bare `\r`
//! is dropped unless it is the final (still open) line.

use std::sync::OnceLock;

use regex::Regex;

const BACKSPACE: char = '\u{8}';

fn ansi_sequences() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(r"(?:\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~]))+")
            .unwrap_or_else(|error| panic!("ansi escape pattern must compile: {error}"))
    })
}

fn backspace_pairs() -> &'static Regex {
    static PAIRS: OnceLock<Regex> = OnceLock::new();
    PAIRS.get_or_init(|| {
        Regex::new(r"[^\x08]\x08")
            .unwrap_or_else(|error| panic!("backspace pattern must compile: {error}"))
    })
}

/// Applies backspaces inside one run of visible text until nothing changes.
fn collapse_backspaces(text: &str) -> String {
    let mut current = text.to_owned();
    loop {
        if !current.contains(BACKSPACE) {
            return current;
        }
        let next = backspace_pairs().replace_all(&current, "").into_owned();
        if next.len() == current.len() {
            return next;
        }
        current = next;
    }
}

/// Alternating text and escape segments; always starts and ends with text.
fn split_escapes(text: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut cursor = 0;
    for found in ansi_sequences().find_iter(text) {
        segments.push(&text[cursor..found.start()]);
        segments.push(found.as_str());
        cursor = found.end();
    }
    segments.push(&text[cursor..]);
    segments
}

/// Collapses backspaces against the preceding visible character.
pub fn normalize(text: &str) -> String {
    if !text.contains(BACKSPACE) {
        return text.to_owned();
    }

    let mut segments: Vec<String> = split_escapes(text)
        .into_iter()
        .map(str::to_owned)
        .collect();
    let mut carry = String::new();
    // Text segments sit at even positions; unconsumed leading backspaces
    // move left past the escape sequence into the previous text segment.
    for index in (0..segments.len()).rev().step_by(2) {
        let mut combined = std::mem::take(&mut segments[index]);
        combined.push_str(&carry);
        let collapsed = collapse_backspaces(&combined);
        let visible = collapsed.trim_start_matches(BACKSPACE);
        carry = collapsed[..collapsed.len() - visible.len()].to_owned();
        segments[index] = visible.to_owned();
    }

    segments.concat()
}

/// Splits after `\n`, `\r\n`, or a bare `\r`, keeping the terminators.
fn split_lines_keep_ends(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0;
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'\n' => {
                lines.push(&text[start..=index]);
                start = index + 1;
            }
            b'\r' => {
                if bytes.get(index + 1) == Some(&b'\n') {
                    index += 1;
                }
                lines.push(&text[start..=index]);
                start = index + 1;
            }
            _ => {}
        }
        index += 1;
    }
    if start < bytes.len() {
        lines.push(&text[start..]);
    }
    lines
}

/// Normalizes accumulated stream text: completed lines overwritten by a
/// carriage return are discarded and backspaces are applied per line.
pub fn fixlines(text: &str) -> String {
    let lines = split_lines_keep_ends(text);
    let Some((last, completed)) = lines.split_last() else {
        return String::new();
    };

    let mut fixed = String::with_capacity(text.len());
    for line in completed {
        if !line.ends_with('\r') {
            fixed.push_str(&normalize(line));
        }
    }
    fixed.push_str(&normalize(last));
    fixed
}

#[cfg(test)]
mod tests {
    use super::{fixlines, normalize, split_lines_keep_ends};

    #[test]
    fn normalize_keeps_escape_sequences_as_atomic_tokens() {
        let normalized = normalize("\x1b[?25h\x08 \x08canceled\r\n");
        assert_eq!(normalized, "\x1b[?25hcanceled\r\n");
    }

    #[test]
    fn normalize_deletes_previous_visible_character() {
        assert_eq!(normalize("abc\x08\x08d"), "ad");
        assert_eq!(normalize("ab\x1b[31m\x08c"), "a\x1b[31mc");
        assert_eq!(normalize("\x08\x08start"), "start");
    }

    #[test]
    fn normalize_is_idempotent() {
        let samples = [
            "plain text",
            "\x1b[?25h\x08 \x08canceled\r\n",
            "50%\x08\x08\x0875%\x1b[0m\x08\x08\x08100%",
            "x\x08\x08\x08\x1b[1m\x1b[2m\x08y",
            "",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "sample {sample:?}");
        }
    }

    #[test]
    fn fixlines_drops_lines_overwritten_by_carriage_return() {
        let text = "Downloading 10%\rDownloading 60%\rDownloading 100%\r\ndone\n";
        assert_eq!(fixlines(text), "Downloading 100%\r\ndone\n");
    }

    #[test]
    fn fixlines_keeps_open_last_line_even_with_carriage_return() {
        assert_eq!(fixlines("first\nprogress 10%\r"), "first\nprogress 10%\r");
        assert_eq!(
            fixlines("first\nprogress 10%\rprogress 20%"),
            "first\nprogress 20%"
        );
    }

    #[test]
    fn fixlines_is_idempotent_and_handles_empty_input() {
        assert_eq!(fixlines(""), "");
        let once = fixlines("a\rb\r\nc\x08d\ne\r");
        assert_eq!(once, "b\r\nd\ne\r");
        assert_eq!(fixlines(&once), once);
    }

    #[test]
    fn line_split_treats_crlf_as_one_terminator() {
        assert_eq!(
            split_lines_keep_ends("a\r\nb\rc\nd"),
            vec!["a\r\n", "b\r", "c\n", "d"]
        );
    }
}
