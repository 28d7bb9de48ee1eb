//! Error signature normalization and fix hashing
//!
//! Two reports of the same error rarely match byte for byte: paths, line
//! numbers and quoted identifiers vary between machines. Normalization
//! strips that noise so lookups, grouping and hashing see the same text.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

fn path_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:[a-z]:)?(?:[\w.~-]*[/\\])+[\w.-]*").expect("valid regex"))
}

fn line_number_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bline\s+\d+\b|:\d+(?::\d+)?\b").expect("valid regex"))
}

fn quoted_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"'[^']*'|"[^"]*"|`[^`]*`"#).expect("valid regex"))
}

fn whitespace_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid regex"))
}

/// Dictionary key for an error signature.
///
/// Lowercases, removes file paths and line numbers, collapses whitespace.
pub fn signature_key(signature: &str) -> String {
    let lowered = signature.to_lowercase();
    let without_paths = path_pattern().replace_all(&lowered, "");
    let without_lines = line_number_pattern().replace_all(&without_paths, "");
    whitespace_pattern()
        .replace_all(&without_lines, " ")
        .trim()
        .to_string()
}

/// Coarser key used by the merge pass: also blanks quoted identifiers.
pub fn group_key(signature: &str) -> String {
    let key = signature_key(signature);
    let unquoted = quoted_pattern().replace_all(&key, "<q>");
    whitespace_pattern()
        .replace_all(&unquoted, " ")
        .trim()
        .to_string()
}

/// Solution text with trailing whitespace and blank edges removed.
pub fn normalize_solution(solution: &str) -> String {
    solution
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Content hash of a fix: identical content from any identity collapses
/// to the same value.
pub fn fix_hash(error_signature: &str, solution: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signature_key(error_signature).as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize_solution(solution).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Token set used by the similarity measure.
pub fn tokens(text: &str) -> BTreeSet<String> {
    signature_key(text)
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() > 1 && !t.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_key_strips_paths_and_lines() {
        let a = signature_key(r#"File "/home/alice/app/main.py", line 12, in <module>"#);
        let b = signature_key(r#"File "/srv/bob/main.py", line 873, in <module>"#);
        assert_eq!(a, b);
        assert!(!a.contains("12"));
        assert!(!a.contains("alice"));
    }

    #[test]
    fn test_signature_key_strips_column_suffixes() {
        assert_eq!(
            signature_key("src/lib.rs:10:5 error[E0425]: cannot find value `x`"),
            signature_key("src/main.rs:99:1 error[E0425]: cannot find value `x`"),
        );
    }

    #[test]
    fn test_group_key_blanks_quoted_identifiers() {
        let a = group_key("NameError: name 'os' is not defined");
        let b = group_key("NameError: name 'sys' is not defined");
        assert_eq!(a, b);
        assert_ne!(
            signature_key("NameError: name 'os' is not defined"),
            signature_key("NameError: name 'sys' is not defined")
        );
    }

    #[test]
    fn test_fix_hash_is_deterministic_and_normalized() {
        let h1 = fix_hash("NameError: name 'os' is not defined", "import os");
        let h2 = fix_hash("  nameerror:   name 'os' is not defined ", "import os   \n");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, fix_hash("NameError: name 'os' is not defined", "import sys"));
    }

    #[test]
    fn test_tokens_drop_numbers_and_single_chars() {
        let t = tokens("TypeError: x must be 3 ints, got 'str' at line 4");
        assert!(t.contains("typeerror"));
        assert!(t.contains("ints"));
        assert!(t.contains("str"));
        assert!(!t.contains("x"));
        assert!(!t.contains("3"));
        assert!(!t.contains("4"));
    }
}
