use murmur_storage::DEFAULT_SESSION_TITLE;

/// Number of characters kept from the first user message.
pub const TITLE_MAX_CHARS: usize = 20;
const TITLE_ELLIPSIS: &str = "...";

/// Derives a session title from the first user message.
///
/// Counts Unicode scalar values, so multi-byte text is never split mid-character.
pub fn synthesize_title(first_message: &str) -> String {
    let single_line = first_message.replace(['\r', '\n'], " ");
    let trimmed = single_line.trim();
    if trimmed.is_empty() {
        return DEFAULT_SESSION_TITLE.to_string();
    }

    let mut chars = trimmed.chars();
    let head = chars.by_ref().take(TITLE_MAX_CHARS).collect::<String>();
    if chars.next().is_some() {
        format!("{head}{TITLE_ELLIPSIS}")
    } else {
        head
    }
}
