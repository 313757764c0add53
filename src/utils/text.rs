pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

// Trailing text without a terminator counts as one more sentence.
pub fn sentence_count(text: &str) -> usize {
    text.split(['.', '!', '?', '…'])
        .filter(|s| s.chars().any(|c| c.is_alphanumeric()))
        .count()
}

pub fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(limit).collect();
    cut.push('…');
    cut
}

pub fn cyrillic_ratio(text: &str) -> f32 {
    let mut letters = 0usize;
    let mut cyrillic = 0usize;
    for c in text.chars().filter(|c| c.is_alphabetic()) {
        letters += 1;
        if ('\u{0400}'..='\u{04FF}').contains(&c) {
            cyrillic += 1;
        }
    }
    if letters == 0 {
        0.0
    } else {
        cyrillic as f32 / letters as f32
    }
}

pub fn quoted_spans(text: &str) -> Vec<String> {
    let pairs = [('«', '»'), ('"', '"'), ('„', '“'), ('“', '”')];
    let mut spans = Vec::new();
    for (open, close) in pairs {
        let mut rest = text;
        while let Some(start) = rest.find(open) {
            let after = &rest[start + open.len_utf8()..];
            match after.find(close) {
                Some(end) => {
                    let span = after[..end].trim();
                    if !span.is_empty() {
                        spans.push(span.to_string());
                    }
                    rest = &after[end + close.len_utf8()..];
                }
                None => break,
            }
        }
    }
    spans
}
