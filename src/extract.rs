//! Text extraction and cleaning for collected papers.
//!
//! Sources hand over either PDF bytes (full-text download) or plain text
//! (abstracts, directory records). Both pass through [`clean_text`] before
//! chunking so the index never sees markup or contact details.

/// Extraction error. Callers fall back to the abstract; nothing panics.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("PDF contained no extractable text")]
    Empty,
}

/// Extracts plain text from PDF bytes, truncated to `max_chars` characters.
pub fn extract_pdf(bytes: &[u8], max_chars: usize) -> Result<String, ExtractError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let text = clean_text(&text);
    if text.is_empty() {
        return Err(ExtractError::Empty);
    }
    Ok(truncate_chars(&text, max_chars).to_string())
}

/// Strips HTML tags, redacts e-mail addresses and phone numbers, and
/// collapses whitespace while keeping paragraph breaks.
pub fn clean_text(text: &str) -> String {
    let without_tags = strip_tags(text);
    let mut paragraphs = Vec::new();
    for para in without_tags.split("\n\n") {
        let words: Vec<String> = para.split_whitespace().map(redact_word).collect();
        if !words.is_empty() {
            paragraphs.push(words.join(" "));
        }
    }
    paragraphs.join("\n\n")
}

/// Returns the prefix of `text` holding at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}

fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        // Only treat `<` as a tag opener when followed by a tag-like char,
        // so inequalities such as "a < b" survive.
        if c == '<' && matches!(chars.peek(), Some(n) if n.is_ascii_alphabetic() || *n == '/' || *n == '!') {
            for inner in chars.by_ref() {
                if inner == '>' {
                    break;
                }
            }
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    out
}

fn redact_word(word: &str) -> String {
    let core = word.trim_matches(|c: char| matches!(c, ',' | ';' | ':' | '(' | ')' | '.' | '"'));
    if is_email(core) {
        return word.replace(core, "[EMAIL]");
    }
    if is_phone(core) {
        return word.replace(core, "[PHONE]");
    }
    word.to_string()
}

fn is_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && domain
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        }
        None => false,
    }
}

fn is_phone(s: &str) -> bool {
    let digits = s.chars().filter(|c| c.is_ascii_digit()).count();
    digits >= 10
        && digits <= 15
        && s.chars().any(|c| matches!(c, '-' | '+' | '(' | ')'))
        && s
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '(' | ')'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_bytes_report_pdf_error() {
        let err = extract_pdf(b"not a pdf at all", 1000).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
        assert!(err.to_string().starts_with("PDF extraction failed: "));
        assert_eq!(
            ExtractError::Empty.to_string(),
            "PDF contained no extractable text"
        );
    }

    #[test]
    fn test_strips_html_and_collapses_whitespace() {
        let cleaned = clean_text("<p>Hello   <b>world</b></p>\n\n\n  Next\tpara  ");
        assert_eq!(cleaned, "Hello world\n\nNext para");
    }

    #[test]
    fn test_keeps_inequalities() {
        assert_eq!(clean_text("we require a < b for all cases"), "we require a < b for all cases");
    }

    #[test]
    fn test_redacts_contact_details() {
        let cleaned = clean_text("Contact jane.doe@uni.edu, or call 555-123-4567.");
        assert_eq!(cleaned, "Contact [EMAIL], or call [PHONE].");
    }

    #[test]
    fn test_arxiv_ids_are_not_phone_numbers() {
        assert_eq!(clean_text("See 2301.00001 and 1706.03762."), "See 2301.00001 and 1706.03762.");
    }

    #[test]
    fn test_truncate_chars_on_boundaries() {
        assert_eq!(truncate_chars("ééé", 2), "éé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_invalid_pdf_returns_error() {
        let err = extract_pdf(b"not a pdf", 1000).unwrap_err();
        assert!(err.to_string().contains("PDF"));
    }
}
