//! Worktree ignore rules
//!
//! A filename is excluded from staging and from untracked detection when it
//! matches one of the editor/Office temp-file patterns, contains a character
//! that is illegal in Windows filenames, contains a control byte, or ends
//! with a space. The rules are process-wide and immutable.
//!
//! Matching is case-sensitive; `*.tmp` and `*.TMP` are both listed on
//! purpose.

/// Filename patterns excluded from every worktree walk
pub const IGNORE_PATTERNS: [&str; 12] = [
    "*~",
    "*#",
    // windows tmp files
    "*.tmp",
    "*.TMP",
    // ms office tmp files
    "~$*.doc",
    "~$*.docx",
    "~$*.xls",
    "~$*.xlsx",
    "~$*.ppt",
    "~$*.pptx",
    // windows image cache
    "Thumbs.db",
    // for mac
    ".DS_Store",
];

// Illegal characters in filenames under Windows (in Linux, only '/' is
// disallowed): \ / : * ? " < > | \b \t, plus bytes 1-31.
const ILLEGAL_CHARS: [char; 11] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|', '\u{8}', '\t'];

/// Decide whether a single path component must be ignored
pub fn should_ignore(filename: &str) -> bool {
    if IGNORE_PATTERNS
        .iter()
        .any(|pattern| pattern_match(pattern.as_bytes(), filename.as_bytes()))
    {
        return true;
    }

    if filename.chars().any(|c| ILLEGAL_CHARS.contains(&c)) {
        return true;
    }

    if filename.bytes().any(|b| (0x01..=0x1f).contains(&b)) {
        return true;
    }

    filename.ends_with(' ')
}

/// Shell-style wildcard match: `*` matches any run, `?` matches one byte
fn pattern_match(pattern: &[u8], name: &[u8]) -> bool {
    match (pattern.first(), name.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            pattern_match(&pattern[1..], name)
                || (!name.is_empty() && pattern_match(pattern, &name[1..]))
        }
        (Some(b'?'), Some(_)) => pattern_match(&pattern[1..], &name[1..]),
        (Some(p), Some(n)) if p == n => pattern_match(&pattern[1..], &name[1..]),
        _ => false,
    }
}
