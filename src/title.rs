//! Task title derivation.
//!
//! Tasks created without an explicit title get one from the first user
//! message: first line, control characters stripped, truncated on a char
//! boundary with an ellipsis.

const MAX_TITLE_CHARS: usize = 60;
const FALLBACK_TITLE: &str = "New chat";

pub fn derive_title(message: &str) -> String {
    let first_line = message
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");

    let cleaned: String = first_line
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if cleaned.is_empty() {
        return FALLBACK_TITLE.to_string();
    }
    if cleaned.chars().count() <= MAX_TITLE_CHARS {
        return cleaned;
    }
    let truncated: String = cleaned.chars().take(MAX_TITLE_CHARS).collect();
    format!("{}…", truncated.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_first_non_empty_line() {
        assert_eq!(derive_title("\n\n  fix the bug  \nmore"), "fix the bug");
    }

    #[test]
    fn collapses_whitespace() {
        assert_eq!(derive_title("fix   the\t bug"), "fix the bug");
    }

    #[test]
    fn truncates_long_messages_on_char_boundary() {
        let long = "a".repeat(200);
        let title = derive_title(&long);
        assert!(title.chars().count() <= MAX_TITLE_CHARS + 1);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn multibyte_input_is_safe() {
        let message = "日本語のタイトル".repeat(20);
        let title = derive_title(&message);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn empty_message_falls_back() {
        assert_eq!(derive_title("   \n\t"), FALLBACK_TITLE);
    }
}
