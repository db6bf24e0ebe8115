//! Cleanup of recognized speech before it reaches the language model.
//!
//! Transcribers annotate non-speech as `[BLANK_AUDIO]`, `(music)` and similar,
//! and occasionally emit several lines or stray symbols. [`normalize_heard`]
//! reduces a raw transcript to one plain line, [`WakeGate`] checks for an
//! optional wake phrase, and [`contains_stop`] spots the stop command.

/// Similarity a heard prefix needs to count as the wake phrase.
pub const WAKE_SIMILARITY: f32 = 0.7;

/// Remove `[...]` and `(...)` spans in one left-to-right pass.
///
/// Spans do not nest: a span ends at the first closer of its own kind, and
/// brackets of the other kind inside it are dropped with it. An opener with no
/// closer after it is kept as text.
pub fn strip_brackets(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    // Once a search for a closer fails, no later opener of that kind can match.
    let mut square_open = true;
    let mut round_open = true;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let closer = match c {
            '[' if square_open => Some(']'),
            '(' if round_open => Some(')'),
            _ => None,
        };
        if let Some(closer) = closer {
            match chars[i + 1..].iter().position(|&x| x == closer) {
                Some(offset) => {
                    i += offset + 2;
                    continue;
                }
                None => {
                    if closer == ']' {
                        square_open = false;
                    } else {
                        round_open = false;
                    }
                }
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Characters that survive normalization.
pub fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c.is_whitespace() || matches!(c, '.' | ',' | '?' | '!' | ':' | '\'' | '-')
}

/// Reduce a raw transcript to the plain line handed to the model.
pub fn normalize_heard(raw: &str) -> String {
    let filtered: String = strip_brackets(raw).chars().filter(|&c| is_allowed(c)).collect();
    let first_line = filtered.split('\n').next().unwrap_or("");
    first_line.trim().to_string()
}

/// Whitespace-separated words.
pub fn words(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

/// True when `text` has at least one alphabetic character.
pub fn has_alpha(text: &str) -> bool {
    text.chars().any(char::is_alphabetic)
}

/// The stop command: the literal "stop" anywhere in the text, any case.
pub fn contains_stop(text: &str) -> bool {
    text.to_lowercase().contains("stop")
}

/// Levenshtein distance over chars.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j + 1] + 1).min(cur[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// 1.0 for identical strings, falling towards 0.0 with edit distance.
pub fn similarity(a: &str, b: &str) -> f32 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - edit_distance(a, b) as f32 / max_len as f32
}

/// Optional wake phrase that must open every command.
#[derive(Debug, Clone)]
pub struct WakeGate {
    phrase: String,
    n_words: usize,
}

impl WakeGate {
    /// `None` when no wake phrase is configured.
    pub fn new(phrase: &str) -> Option<Self> {
        let phrase = normalize_heard(phrase).to_lowercase();
        let n_words = words(&phrase).len();
        if n_words == 0 {
            return None;
        }
        Some(Self { phrase, n_words })
    }

    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    /// Check the leading words of `heard` against the wake phrase.
    /// Returns the command that follows it, or `None` when the phrase does not
    /// match or nothing follows it.
    pub fn accept(&self, heard: &str) -> Option<String> {
        let heard_words = words(heard);
        let prefix = heard_words
            .iter()
            .take(self.n_words)
            .copied()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        let sim = similarity(&prefix, &self.phrase);
        tracing::debug!("wake check: heard '{}' vs '{}' -> {:.2}", prefix, self.phrase, sim);
        if sim < WAKE_SIMILARITY {
            return None;
        }

        let rest = heard_words
            .iter()
            .skip(self.n_words)
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}
