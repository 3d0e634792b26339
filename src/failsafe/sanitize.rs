use once_cell::sync::Lazy;
use regex::Regex;

static STACK_FRAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(at|\d+:)\s+.*$").expect("stack frame pattern compiles"));
static FILE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[A-Za-z]:)?(?:[/\\][\w.\-]+)+(?:\.\w+)?").expect("path pattern compiles")
});
static LINE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":\d+(?::\d+)?").expect("line number pattern compiles"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern compiles"));

/// Strip stack frames, file paths and line numbers, then truncate on a
/// character boundary.
pub fn sanitize_error_message(message: &str, max_length: usize) -> String {
    let text = STACK_FRAME.replace_all(message, "");
    let text = FILE_PATH.replace_all(&text, "[path]");
    let text = LINE_NUMBER.replace_all(&text, "");
    let text = WHITESPACE.replace_all(&text, " ");
    let text = text.trim();

    if text.chars().count() <= max_length {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_length).collect();
    truncated.push_str("...");
    truncated
}
