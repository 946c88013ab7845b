//! Locating a JSON payload inside free-form model output.

const FENCE: &str = "```";

/// Extracts the JSON part of a model response.
///
/// In order: the whole text if it already starts with `{` or `[`; the body
/// of the first fenced code block; the span from the first `{` or `[` to
/// its matching closer. An unbalanced span runs to the end of the text, so
/// the repair step can complete it. Returns `None` when there is no
/// candidate at all.
pub fn extract_json(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    if raw.starts_with('{') || raw.starts_with('[') {
        return Some(raw);
    }

    if let Some(block) = first_fenced_block(raw)
        && !block.trim().is_empty()
    {
        return Some(block);
    }

    let start = raw.find(['{', '['])?;
    let (open, close) = match raw.as_bytes()[start] {
        b'{' => (b'{', b'}'),
        _ => (b'[', b']'),
    };

    let mut depth = 0usize;
    for (offset, byte) in raw.as_bytes()[start..].iter().enumerate() {
        if *byte == open {
            depth += 1;
        } else if *byte == close {
            depth -= 1;
            if depth == 0 {
                return Some(&raw[start..start + offset + 1]);
            }
        }
    }
    Some(&raw[start..])
}

/// Lines strictly between the first fence line and the next one.
fn first_fenced_block(raw: &str) -> Option<&str> {
    let mut offset = 0;
    let mut body_start = None;
    for line in raw.split_inclusive('\n') {
        if line.trim_start().starts_with(FENCE) {
            match body_start {
                None => body_start = Some(offset + line.len()),
                Some(start) => return Some(raw[start..offset].trim_end_matches(['\n', '\r'])),
            }
        }
        offset += line.len();
    }
    body_start.map(|start| &raw[start.min(raw.len())..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_json_is_returned_trimmed() {
        assert_eq!(extract_json("  {\"a\":1}\n"), Some("{\"a\":1}"));
        assert_eq!(extract_json("[1,2]"), Some("[1,2]"));
    }

    #[test]
    fn first_fenced_block_wins() {
        let raw = "Here you go:\n```json\n{\"a\": 1}\n```\nand also\n```\n{\"b\": 2}\n```";
        assert_eq!(extract_json(raw), Some("{\"a\": 1}"));
    }

    #[test]
    fn unterminated_fence_runs_to_end() {
        let raw = "Result:\n```json\n{\"a\": [1, 2";
        assert_eq!(extract_json(raw), Some("{\"a\": [1, 2"));
    }

    #[test]
    fn scans_for_balanced_object() {
        let raw = "The review is {\"summary\": \"ok\", \"nested\": {\"x\": 1}} as requested.";
        assert_eq!(
            extract_json(raw),
            Some("{\"summary\": \"ok\", \"nested\": {\"x\": 1}}")
        );
    }

    #[test]
    fn array_before_object_is_taken() {
        assert_eq!(extract_json("list: [1, {\"a\": 2}] done"), Some("[1, {\"a\": 2}]"));
    }

    #[test]
    fn unbalanced_returns_remainder() {
        assert_eq!(
            extract_json("prefix {\"a\": {\"b\": 1}"),
            Some("{\"a\": {\"b\": 1}")
        );
    }

    #[test]
    fn no_candidate() {
        assert_eq!(extract_json("I could not review this change."), None);
        assert_eq!(extract_json(""), None);
    }
}
