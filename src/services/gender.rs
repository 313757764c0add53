use crate::core::state::Gender;
use crate::utils::text::cyrillic_ratio;
use regex::Regex;
use std::sync::LazyLock;

const MIN_CYRILLIC_RATIO: f32 = 0.6;

static FIRST_PERSON: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?:^|[^\p{L}])я(?:[^\p{L}]|$)").unwrap());
static FEMININE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+(?:лась|ла)\b").unwrap());
static MASCULINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+(?:лся|л)\b").unwrap());

pub fn detect_gender(text: &str) -> Option<Gender> {
    if cyrillic_ratio(text) < MIN_CYRILLIC_RATIO {
        return None;
    }

    let lower = text.to_lowercase();
    let mut feminine = 0;
    let mut masculine = 0;
    for sentence in lower.split(['.', '!', '?', '\n']) {
        if !FIRST_PERSON.is_match(sentence) {
            continue;
        }
        if FEMININE.is_match(sentence) {
            feminine += 1;
        } else if MASCULINE.is_match(sentence) {
            masculine += 1;
        }
    }

    match feminine.cmp(&masculine) {
        std::cmp::Ordering::Greater => Some(Gender::Female),
        std::cmp::Ordering::Less => Some(Gender::Male),
        std::cmp::Ordering::Equal => None,
    }
}
