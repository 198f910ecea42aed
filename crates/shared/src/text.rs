//! Language-agnostic text helpers used by the clusterer, resolver, classifier and
//! extractor.
//!
//! Latin-script text is split into lowercase words; CJK runs are split into
//! character bigrams so that Chinese/Japanese/Korean headlines can be compared with
//! the same set-overlap measures as English ones.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::ops::Range;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "in", "on", "at", "to", "for", "of", "and",
    "or", "with", "as", "by", "from", "its", "it", "this", "that", "be", "has", "have", "had",
    "will", "after", "over", "into", "about", "than", "but", "not", "new", "says", "said",
    "more", "their", "they", "his", "her", "he", "she", "we", "you", "up", "out", "amid",
];

const CJK_STOP_CHARS: &[char] = &['的', '了', '与', '及'];

pub fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4e00}'..='\u{9fff}'
        | '\u{3400}'..='\u{4dbf}'
        | '\u{3040}'..='\u{309f}'
        | '\u{30a0}'..='\u{30ff}'
        | '\u{ac00}'..='\u{d7af}'
    )
}

/// Tokenize into a set of comparable terms.
pub fn tokens(text: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let mut word = String::new();
    let mut run: Vec<char> = Vec::new();

    for c in text.chars() {
        if is_cjk(c) {
            flush_word(&mut word, &mut out);
            if CJK_STOP_CHARS.contains(&c) {
                flush_cjk(&mut run, &mut out);
            } else {
                run.push(c);
            }
        } else if c.is_alphanumeric() {
            flush_cjk(&mut run, &mut out);
            word.extend(c.to_lowercase());
        } else {
            flush_word(&mut word, &mut out);
            flush_cjk(&mut run, &mut out);
        }
    }
    flush_word(&mut word, &mut out);
    flush_cjk(&mut run, &mut out);
    out
}

fn flush_word(word: &mut String, out: &mut BTreeSet<String>) {
    if word.chars().count() > 1 && !STOP_WORDS.contains(&word.as_str()) {
        out.insert(std::mem::take(word));
    }
    word.clear();
}

fn flush_cjk(run: &mut Vec<char>, out: &mut BTreeSet<String>) {
    match run.len() {
        0 => {}
        1 => {
            out.insert(run[0].to_string());
        }
        _ => {
            for pair in run.windows(2) {
                out.insert(pair.iter().collect());
            }
        }
    }
    run.clear();
}

pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// |A ∩ B| / min(|A|, |B|)
pub fn overlap_coefficient(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    intersection as f64 / a.len().min(b.len()) as f64
}

/// Share of `candidate` terms that do not appear in `reference`.
pub fn novelty(candidate: &BTreeSet<String>, reference: &BTreeSet<String>) -> f64 {
    if candidate.is_empty() {
        return 0.0;
    }
    let fresh = candidate.difference(reference).count();
    fresh as f64 / candidate.len() as f64
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '。' | '！' | '？' | '\n')
}

fn quote_pair(c: char) -> Option<char> {
    match c {
        '"' => Some('"'),
        '“' => Some('”'),
        '「' => Some('」'),
        '『' => Some('』'),
        _ => None,
    }
}

/// Split into sentences. Terminators inside quotation marks and decimal points do
/// not end a sentence.
pub fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut closing: Option<char> = None;
    let chars: Vec<(usize, char)> = text.char_indices().collect();

    for (i, &(pos, c)) in chars.iter().enumerate() {
        if let Some(close) = closing {
            if c == close {
                closing = None;
            }
            continue;
        }
        if let Some(close) = quote_pair(c) {
            closing = Some(close);
            continue;
        }
        if !is_terminator(c) {
            continue;
        }
        if c == '.' {
            let next = chars.get(i + 1).map(|&(_, n)| n);
            let prev = i.checked_sub(1).map(|p| chars[p].1);
            let decimal = matches!((prev, next), (Some(p), Some(n)) if p.is_ascii_digit() && n.is_ascii_digit());
            if decimal || matches!(next, Some(n) if !n.is_whitespace()) {
                continue;
            }
        }
        let end = pos + c.len_utf8();
        let sentence = text[start..end].trim();
        if !sentence.is_empty() {
            out.push(sentence);
        }
        start = end;
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Text inside quotation marks, in order of appearance.
pub fn quoted_spans(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut open: Option<(char, usize)> = None;
    for (pos, c) in text.char_indices() {
        match open {
            Some((close, start)) if c == close => {
                let inner = text[start..pos].trim();
                if !inner.is_empty() {
                    out.push(inner);
                }
                open = None;
            }
            Some(_) => {}
            None => {
                if let Some(close) = quote_pair(c) {
                    open = Some((close, pos + c.len_utf8()));
                }
            }
        }
    }
    out
}

pub fn lead_sentence(text: &str) -> &str {
    sentences(text).into_iter().next().unwrap_or("")
}

/// Truncate to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hex SHA-256 over the parts, separated so that ("ab", "c") != ("a", "bc").
pub fn content_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for b in digest {
        let _ = write!(hex, "{:02x}", b);
    }
    hex
}

const UNITS: &[(&str, &str)] = &[
    ("%", "%"),
    ("％", "%"),
    ("percent", "%"),
    ("per cent", "%"),
    ("billion", "b"),
    ("bn", "b"),
    ("million", "m"),
    ("mn", "m"),
    ("trillion", "t"),
    ("watts", "w"),
    ("watt", "w"),
    ("w", "w"),
    ("gb", "gb"),
    ("tb", "tb"),
    ("nm", "nm"),
    ("ghz", "ghz"),
    ("km", "km"),
    ("亿", "亿"),
    ("万", "万"),
    ("倍", "x"),
    ("x", "x"),
];

/// Quantitative details ("15W", "$2 billion", "30%") normalised as `value unit`.
///
/// Bare four-digit years and digits glued to letters (model names such as
/// "H100" or "GPT-5") are not figures.
pub fn figures(text: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let glued = i > 0 && (chars[i - 1].is_alphabetic() && !is_cjk(chars[i - 1]) || chars[i - 1] == '-');
        let start = i;
        let mut number = String::new();
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == ',') {
            if chars[i] != ',' {
                number.push(chars[i]);
            }
            i += 1;
        }
        let number = number.trim_end_matches('.').to_string();
        if glued || number.is_empty() {
            continue;
        }
        let number = match number.split_once('.') {
            Some((whole, frac)) if frac.chars().all(|c| c == '0') => whole.to_string(),
            _ => number,
        };

        let rest: String = chars[i..].iter().take(12).collect::<String>().to_lowercase();
        let rest_trimmed = rest.trim_start();
        let unit = UNITS.iter().find_map(|(suffix, canonical)| {
            let after = rest_trimmed.strip_prefix(suffix)?;
            let boundary = after
                .chars()
                .next()
                .map(|c| !c.is_ascii_alphanumeric())
                .unwrap_or(true);
            boundary.then_some(*canonical)
        });

        let is_year = unit.is_none() && number.len() == 4 && matches!(number.get(..2), Some("19") | Some("20"));
        let followed_by_letter = unit.is_none()
            && chars.get(i).map(|c| c.is_ascii_alphabetic()).unwrap_or(false);
        if is_year || followed_by_letter {
            continue;
        }

        let currency = start > 0 && matches!(chars[start - 1], '$' | '¥' | '€' | '£');
        let key = match (currency, unit) {
            (true, Some(u)) => format!("{} {}", number, u),
            (true, None) => format!("{} cur", number),
            (false, Some(u)) => format!("{} {}", number, u),
            (false, None) => number,
        };
        out.insert(key);
    }
    out
}

/// Case-insensitive match of `needle` in `haystack`. Latin needles must sit on
/// word boundaries; CJK needles match as substrings.
pub fn contains_term(haystack: &str, needle: &str) -> bool {
    find_term(haystack, needle).is_some()
}

/// Byte offset in `haystack` of the first boundary-respecting match of
/// `needle`, ignoring case.
pub fn find_term(haystack: &str, needle: &str) -> Option<usize> {
    find_term_range(haystack, needle).map(|r| r.start)
}

/// Byte range in `haystack` of the first boundary-respecting match of
/// `needle`, ignoring case. CJK needles match anywhere.
pub fn find_term_range(haystack: &str, needle: &str) -> Option<Range<usize>> {
    let needle = needle.trim();
    if needle.is_empty() {
        return None;
    }
    let cjk = needle.chars().any(is_cjk);
    let boundary = |c: char| !c.is_alphanumeric() || is_cjk(c);
    for (at, _) in haystack.char_indices() {
        let Some(len) = folded_prefix_len(&haystack[at..], needle) else {
            continue;
        };
        let end = at + len;
        let before_ok = haystack[..at].chars().next_back().map(boundary).unwrap_or(true);
        let after_ok = haystack[end..].chars().next().map(boundary).unwrap_or(true);
        if cjk || (before_ok && after_ok) {
            return Some(at..end);
        }
    }
    None
}

/// `text` without a leading `prefix`, ignoring case.
pub fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    folded_prefix_len(text, prefix).map(|len| &text[len..])
}

/// Bytes of `text` matching `needle` char by char under lowercasing.
fn folded_prefix_len(text: &str, needle: &str) -> Option<usize> {
    let mut chars = text.char_indices();
    let mut len = 0;
    for n in needle.chars() {
        let (i, c) = chars.next()?;
        if !c.to_lowercase().eq(n.to_lowercase()) {
            return None;
        }
        len = i + c.len_utf8();
    }
    Some(len)
}

const NAME_STOP: &[&str] = &[
    "how", "why", "what", "when", "where", "who", "report", "reports", "exclusive", "breaking",
    "update", "live", "opinion", "analysis", "today", "here", "there", "these", "those", "our",
    "my", "your", "can", "could", "should", "would", "may", "might", "just", "now", "first",
];

/// Capitalised or alphanumeric Latin words ("Nvidia", "H100", "iPhone"),
/// lowercased. A cheap stand-in for named-entity recognition.
pub fn named_terms(text: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for word in text.split(|c: char| !(c.is_alphanumeric() || c == '-') || is_cjk(c)) {
        let word = word.trim_matches('-');
        if word.chars().count() < 2 || !word.is_ascii() {
            continue;
        }
        let has_upper = word.chars().any(|c| c.is_ascii_uppercase());
        let has_digit = word.chars().any(|c| c.is_ascii_digit());
        let has_alpha = word.chars().any(|c| c.is_ascii_alphabetic());
        if !(has_upper || (has_digit && has_alpha)) {
            continue;
        }
        let lower = word.to_lowercase();
        if NAME_STOP.contains(&lower.as_str()) || tokens(&lower).is_empty() {
            continue;
        }
        out.insert(lower);
    }
    out
}
