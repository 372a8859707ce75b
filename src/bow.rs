//! Bag-of-words construction for definitions and user queries.
//!
//! The full-text engine only matches whole tokens, so identifiers are broken up
//! here (`parseHTTPRequest` → `parse http request`) before they reach the index.
//! Queries go through the same splitter so both sides agree on token boundaries.

use crate::types::{Def, DefDoc};

/// Split an identifier or free text into lowercase word tokens.
///
/// Boundaries: any non-alphanumeric character (`_ . / - :` and whitespace included),
/// lower→upper transitions, the end of an acronym run (`HTTPServer` → `http server`),
/// and letter↔digit transitions.
pub fn split_words(s: &str) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_alphanumeric() {
            flush(&mut current, &mut words);
            continue;
        }

        if let Some(prev) = current.chars().last() {
            let boundary = if c.is_numeric() {
                !prev.is_numeric()
            } else if prev.is_numeric() {
                true
            } else if c.is_uppercase() {
                let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
                !prev.is_uppercase() || next_is_lower
            } else {
                false
            };
            if boundary {
                flush(&mut current, &mut words);
            }
        }
        current.push(c);
    }
    flush(&mut current, &mut words);
    words
}

fn flush(current: &mut String, words: &mut Vec<String>) {
    if !current.is_empty() {
        words.push(current.to_lowercase());
        current.clear();
    }
}

/// Pick the docstring to index.
///
/// A single doc is used whatever its format. Otherwise the first doc whose
/// format is empty or `text/plain` (case-insensitive) wins.
pub fn choose_docstring(docs: &[DefDoc]) -> Option<&DefDoc> {
    if let [only] = docs {
        return Some(only);
    }
    docs.iter()
        .find(|d| d.format.is_empty() || d.format.eq_ignore_ascii_case("text/plain"))
}

/// Whether a doc format carries markup tags (`text/html`, `application/xhtml+xml`, ...).
fn is_markup(format: &str) -> bool {
    let format = format.to_ascii_lowercase();
    format.contains("html") || format.contains("xml")
}

/// Reduce a docstring to single-spaced text.
///
/// Markup formats have their tags dropped and common entities decoded first.
/// Plain and unlabelled docs keep every character, `<` included.
pub fn plain_text(doc: &DefDoc) -> String {
    let text = if is_markup(&doc.format) {
        strip_markup(&doc.data)
    } else {
        doc.data.clone()
    };
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_markup(doc: &str) -> String {
    let mut stripped = String::with_capacity(doc.len());
    let mut in_tag = false;
    for c in doc.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                stripped.push(' ');
            }
            _ if !in_tag => stripped.push(c),
            _ => {}
        }
    }

    stripped
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Terminal `/`-separated segment of a path-like string.
fn last_segment(s: &str) -> &str {
    s.rsplit('/').next().unwrap_or(s)
}

/// Build the bag-of-words string for a definition.
///
/// `doc` should already be normalized (see [`plain_text`]). Tokens are not
/// deduplicated: repeated words weigh more in the engine's ranking.
pub fn bag_of_words(def: &Def, doc: &str) -> String {
    let mut tokens: Vec<String> = Vec::new();

    let name_parts = split_words(&def.name);
    if name_parts.len() > 1 {
        tokens.push(name_parts.concat());
    }
    tokens.extend(name_parts);
    tokens.extend(split_words(&def.kind));
    tokens.extend(split_words(last_segment(&def.path)));
    tokens.extend(split_words(last_segment(&def.unit)));
    tokens.extend(split_words(&def.unit_type));
    tokens.extend(split_words(doc));

    tokens.join(" ")
}

/// Convert user query tokens into an FTS5 match expression.
///
/// Every word must match (implicit AND); the final word is a prefix match so
/// partially typed names still find candidates. Returns "" when the tokens carry
/// no word characters, which callers treat as "no text filter".
pub fn user_query_to_fts(toks: &[String]) -> String {
    let words: Vec<String> = toks.iter().flat_map(|t| split_words(t)).collect();
    let last = words.len().saturating_sub(1);
    words
        .iter()
        .enumerate()
        .map(|(i, w)| {
            let quoted = format!("\"{}\"", w.replace('"', "\"\""));
            if i == last {
                quoted + "*"
            } else {
                quoted
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}
