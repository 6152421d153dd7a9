//! Subject helpers: token access, wildcard matching, canonical identifiers.

/// Token that matches exactly one subject token.
pub const WILDCARD_ONE: &str = "*";
/// Token that matches the remaining tail of a subject.
pub const WILDCARD_TAIL: &str = ">";

const TOKEN_SEP: char = '.';

/// Returns the `n`-th dot-separated token of `subject` (0-indexed).
pub fn token_at(subject: &str, n: usize) -> Option<&str> {
    subject.split(TOKEN_SEP).nth(n)
}

/// Checks whether `name` is usable as a stream/consumer/template identifier:
/// non-empty and free of token separators and wildcards.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['.', '*', '>'])
}

/// Replaces all token separators with `_`, turning a literal subject into a
/// valid identifier. Idempotent.
pub fn canonical_name(subject: &str) -> String {
    subject.replace('.', "_")
}

/// A well-formed subject has no empty tokens and `>` only in tail position.
pub fn is_valid_subject(subject: &str) -> bool {
    if subject.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = subject.split(TOKEN_SEP).collect();
    for (i, tok) in tokens.iter().enumerate() {
        if tok.is_empty() {
            return false;
        }
        if *tok == WILDCARD_TAIL && i != tokens.len() - 1 {
            return false;
        }
    }
    true
}

/// Wildcard-aware match of a literal `subject` against `pattern`.
/// `*` consumes one token, `>` consumes the remaining tail.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pt = pattern.split(TOKEN_SEP);
    let mut st = subject.split(TOKEN_SEP);
    loop {
        match (pt.next(), st.next()) {
            (None, None) => return true,
            (Some(WILDCARD_TAIL), Some(_)) => return true,
            (Some(WILDCARD_ONE), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            _ => return false,
        }
    }
}
