//! Cleaning of free-text fields taken from foreign files.
//!
//! Display fields lose every control character and every bidirectional
//! formatting character, so an imported title cannot reorder what the user
//! sees around it. Secrets are only stripped of NUL and clamped; any other
//! byte may be part of a real password.

/// Bidirectional formatting characters removed from display text.
fn is_bidi_control(c: char) -> bool {
    matches!(
        c,
        '\u{061C}' | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}'
    )
}

fn clamp(mut value: String, max_chars: usize) -> String {
    if let Some((cut, _)) = value.char_indices().nth(max_chars) {
        value.truncate(cut);
    }
    value
}

/// Single-line display text: titles, usernames, URLs, tags.
pub fn single_line(input: &str, max_chars: usize) -> String {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_control() && !is_bidi_control(*c))
        .collect();
    clamp(cleaned.trim().to_string(), max_chars)
}

/// Multi-line text such as notes. Newlines and tabs survive; CRLF becomes LF.
pub fn multi_line(input: &str, max_chars: usize) -> String {
    let cleaned: String = input
        .replace("\r\n", "\n")
        .chars()
        .filter(|c| (*c == '\n' || *c == '\t' || !c.is_control()) && !is_bidi_control(*c))
        .collect();
    clamp(cleaned, max_chars)
}

/// Secret material: only NUL is removed.
pub fn secret(input: &str, max_chars: usize) -> String {
    clamp(input.chars().filter(|c| *c != '\0').collect(), max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line_strips_controls_and_bidi() {
        let title = "Bank\u{202E}lanigiro\u{0007}\n";
        assert_eq!(single_line(title, 100), "Banklanigiro");
        assert_eq!(single_line("  padded  ", 100), "padded");
        assert_eq!(single_line("a\u{2066}b\u{2069}c\u{200F}", 100), "abc");
    }

    #[test]
    fn test_multi_line_keeps_layout() {
        assert_eq!(multi_line("line 1\r\nline\t2\u{0000}", 100), "line 1\nline\t2");
    }

    #[test]
    fn test_secret_keeps_everything_but_nul() {
        assert_eq!(secret(" p\u{202E}w\u{0000}\t ", 100), " p\u{202E}w\t ");
    }

    #[test]
    fn test_clamp_counts_characters() {
        assert_eq!(single_line("ééééé", 3), "ééé");
        assert_eq!(secret("abcdef", 4), "abcd");
        assert_eq!(multi_line("ab", 10), "ab");
    }
}
