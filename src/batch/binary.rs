//! Binary-file detection for diff inputs.

use std::path::Path;

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "tif", "tiff", "webp", "svg", "exe", "dll", "so",
    "dylib", "a", "lib", "zip", "tar", "gz", "bz2", "xz", "7z", "rar", "jar", "war", "ear",
    "class", "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "bin", "dat", "o", "mp3", "mp4",
    "avi", "mov", "wmv", "flv", "webm", "ttf", "woff", "woff2", "eot", "pyc", "pyd", "pyo",
];

/// Characters inspected by the printable-ratio check.
const SAMPLE_CHARS: usize = 512;

/// Share of non-printable characters above which content counts as binary.
const NON_PRINTABLE_RATIO: f64 = 0.3;

/// True when the path has a well-known binary extension.
pub fn has_binary_extension(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            BINARY_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Heuristic content check: any NUL byte, or more than 30% of the first 512
/// characters outside printable ASCII and tab/LF/CR.
pub fn looks_binary(content: &str) -> bool {
    if content.is_empty() {
        return false;
    }
    if content.contains('\0') {
        return true;
    }

    let mut sampled = 0usize;
    let mut non_printable = 0usize;
    for c in content.chars().take(SAMPLE_CHARS) {
        sampled += 1;
        let code = c as u32;
        if (code < 32 && !matches!(c, '\t' | '\n' | '\r')) || code >= 127 {
            non_printable += 1;
        }
    }
    non_printable as f64 / sampled as f64 > NON_PRINTABLE_RATIO
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_matching_is_case_insensitive() {
        assert!(has_binary_extension("assets/logo.PNG"));
        assert!(has_binary_extension("lib/libfoo.so"));
        assert!(!has_binary_extension("src/main.rs"));
        assert!(!has_binary_extension("Makefile"));
    }

    #[test]
    fn nul_byte_means_binary() {
        assert!(looks_binary("abc\0def"));
    }

    #[test]
    fn ratio_threshold() {
        assert!(!looks_binary(""));
        assert!(!looks_binary("fn main() {\n\tprintln!(\"hi\");\r\n}"));
        // 4 of 10 non-printable
        assert!(looks_binary("\u{1}\u{2}\u{3}\u{4}abcdef"));
        // 3 of 10 is not above the threshold
        assert!(!looks_binary("\u{1}\u{2}\u{3}abcdefg"));
    }
}
