//! Best-effort repair of malformed JSON from model output.
//!
//! Strategies run in a fixed order and stop as soon as the text parses:
//! trailing commas, unescaped quotes in comment text, unclosed
//! strings/objects/arrays, JS-style comments, unquoted keys, single
//! quotes. If the text still does not parse, it goes through the `json5`
//! parser as a last resort and is re-serialized as strict JSON.
//! Statistics are produced for every call, repaired or not.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

static TRAILING_COMMA_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*\}").expect("static regex is valid"));
static TRAILING_COMMA_ARRAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*\]").expect("static regex is valid"));
static QUOTED_COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"("comment":\s*")([^"]*)"([^"]*)"([^"]*)("[\s,}])"#)
        .expect("static regex is valid")
});
static UNQUOTED_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([{,]\s*)([a-zA-Z_][a-zA-Z0-9_]*)(\s*:)").expect("static regex is valid")
});
static SINGLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'([^']*)'").expect("static regex is valid"));

/// What a repair pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepairStats {
    pub original_bytes: usize,
    pub repaired_bytes: usize,
    pub comments_lost: usize,
    pub fields_recovered: usize,
    pub errors_fixed: usize,
    pub repair_time: Duration,
    pub strategies: Vec<&'static str>,
    pub was_repaired: bool,
}

/// The text is still not valid JSON after every strategy ran.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("JSON repair failed after {} strategies", .stats.strategies.len())]
pub struct RepairError {
    /// Text as it stood after the last strategy.
    pub partial: String,
    pub stats: RepairStats,
}

/// Successfully repaired (or already valid) JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct Repaired {
    pub json: String,
    pub stats: RepairStats,
}

fn is_valid(text: &str) -> bool {
    serde_json::from_str::<serde::de::IgnoredAny>(text).is_ok()
}

type Strategy = fn(&str, &mut RepairStats) -> Option<String>;

const STRATEGIES: &[(&str, Strategy)] = &[
    ("trailing_commas", remove_trailing_commas),
    ("unescaped_quotes", escape_comment_quotes),
    ("completion", complete_structures),
    ("comments_removed", remove_comments),
    ("key_quotes", quote_keys),
    ("single_quotes", convert_single_quotes),
];

/// Repairs `raw` into parseable JSON.
pub fn repair_json(raw: &str) -> Result<Repaired, RepairError> {
    let started = Instant::now();
    let mut stats = RepairStats {
        original_bytes: raw.len(),
        ..Default::default()
    };

    if is_valid(raw) {
        stats.repaired_bytes = raw.len();
        stats.repair_time = started.elapsed();
        return Ok(Repaired {
            json: raw.to_string(),
            stats,
        });
    }

    stats.was_repaired = true;
    let mut text = raw.to_string();
    for (name, strategy) in STRATEGIES {
        if let Some(fixed) = strategy(&text, &mut stats)
            && fixed != text
        {
            text = fixed;
            stats.strategies.push(*name);
            stats.errors_fixed += 1;
            if is_valid(&text) {
                break;
            }
        }
    }

    if !is_valid(&text)
        && let Some(fixed) = lenient_parse(raw).or_else(|| lenient_parse(&text))
    {
        text = fixed;
        stats.strategies.push(LENIENT_STRATEGY);
        stats.errors_fixed += 1;
    }

    stats.repaired_bytes = text.len();
    stats.repair_time = started.elapsed();
    if is_valid(&text) {
        Ok(Repaired { json: text, stats })
    } else {
        Err(RepairError {
            partial: text,
            stats,
        })
    }
}

const LENIENT_STRATEGY: &str = "json5";

/// Parses `text` as JSON5 (hex numbers, leading `+` or `.`, mixed quoting
/// and the rest) and prints it back as strict JSON.
fn lenient_parse(text: &str) -> Option<String> {
    let value: serde_json::Value = json5::from_str(text).ok()?;
    serde_json::to_string(&value).ok()
}

fn remove_trailing_commas(text: &str, _: &mut RepairStats) -> Option<String> {
    if !TRAILING_COMMA_OBJECT.is_match(text) && !TRAILING_COMMA_ARRAY.is_match(text) {
        return None;
    }
    let text = TRAILING_COMMA_OBJECT.replace_all(text, "}");
    Some(TRAILING_COMMA_ARRAY.replace_all(&text, "]").into_owned())
}

/// Escapes one level of bare quotes inside `"comment"` values, the field
/// models most often quote code in.
fn escape_comment_quotes(text: &str, _: &mut RepairStats) -> Option<String> {
    QUOTED_COMMENT.is_match(text).then(|| {
        QUOTED_COMMENT
            .replace_all(text, r#"${1}${2}\"${3}\"${4}${5}"#)
            .into_owned()
    })
}

/// Closes an unterminated string, then every open object and array in
/// reverse order of opening.
fn complete_structures(text: &str, _: &mut RepairStats) -> Option<String> {
    let mut closers = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                if closers.last() == Some(&c) {
                    closers.pop();
                }
            }
            _ => {}
        }
    }

    if !in_string && closers.is_empty() {
        return None;
    }
    let mut out = text.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    out.extend(closers.iter().rev());
    Some(out)
}

/// Drops `// line` and `/* block */` comments outside string literals.
fn remove_comments(text: &str, stats: &mut RepairStats) -> Option<String> {
    if !text.contains("//") && !text.contains("/*") {
        return None;
    }

    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;
    let mut removed = 0;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                removed += 1;
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                removed += 1;
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }

    stats.comments_lost += removed;
    (removed > 0).then_some(out)
}

fn quote_keys(text: &str, stats: &mut RepairStats) -> Option<String> {
    let count = UNQUOTED_KEY.find_iter(text).count();
    if count == 0 {
        return None;
    }
    stats.fields_recovered += count;
    Some(
        UNQUOTED_KEY
            .replace_all(text, r#"${1}"${2}"${3}"#)
            .into_owned(),
    )
}

fn convert_single_quotes(text: &str, _: &mut RepairStats) -> Option<String> {
    SINGLE_QUOTED
        .is_match(text)
        .then(|| SINGLE_QUOTED.replace_all(text, r#""${1}""#).into_owned())
}
