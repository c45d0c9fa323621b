//! Synthetic nick validation.
//!
//! A relayed nick is looser than a real IRC nick (bridges want `/` and `~`
//! in there) but it must never contain characters the base protocol uses
//! for parsing prefixes, masks or channel names.

use std::fmt;

/// Characters that may never appear in a synthetic nick.
pub const FORBIDDEN_CHARS: &str = "!+%@&#$:'\"?*,.";

/// Byte-indexed presence table for [`FORBIDDEN_CHARS`].
///
/// Built once when the configuration is loaded; lookups are a single index.
#[derive(Clone)]
pub struct ForbiddenChars {
    table: [bool; 256],
}

impl ForbiddenChars {
    pub fn new() -> Self {
        Self::from_set(FORBIDDEN_CHARS)
    }

    pub fn from_set(chars: &str) -> Self {
        let mut table = [false; 256];
        for b in chars.bytes() {
            table[usize::from(b)] = true;
        }
        Self { table }
    }

    #[inline]
    pub fn contains(&self, byte: u8) -> bool {
        self.table[usize::from(byte)]
    }

    /// First forbidden character in `nick`, if any.
    pub fn find_in(&self, nick: &str) -> Option<char> {
        nick.bytes()
            .find(|b| self.contains(*b))
            .map(char::from)
    }
}

impl Default for ForbiddenChars {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ForbiddenChars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: String = (0u8..=255)
            .filter(|b| self.contains(*b))
            .map(char::from)
            .collect();
        f.debug_tuple("ForbiddenChars").field(&set).finish()
    }
}

/// Shape a synthetic nick must have, on top of the forbidden set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NickShape {
    /// The nick must contain this substring (e.g. `/`).
    RequiredSeparator(String),
    /// The nick must match this `*`/`?` wildcard pattern, case-insensitively.
    GlobPattern(String),
}

impl NickShape {
    pub fn matches(&self, nick: &str) -> bool {
        match self {
            Self::RequiredSeparator(sep) => nick.contains(sep.as_str()),
            Self::GlobPattern(pattern) => glob_match(pattern, nick),
        }
    }

    /// Value advertised to clients so they can pre-validate nicks.
    pub fn advertised(&self) -> &str {
        match self {
            Self::RequiredSeparator(sep) => sep,
            Self::GlobPattern(pattern) => pattern,
        }
    }
}

/// Why a synthetic nick was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NickError {
    #[error("spoofed nick is empty")]
    Empty,
    #[error("invalid character {0:?} in spoofed nick")]
    ForbiddenChar(char),
    #[error("spoofed nick must include separator {0}")]
    MissingSeparator(String),
    #[error("spoofed nick must match {0}")]
    PatternMismatch(String),
}

/// Stateless validator; owns the forbidden-character table.
#[derive(Debug, Clone, Default)]
pub struct NickValidator {
    forbidden: ForbiddenChars,
}

impl NickValidator {
    pub fn new(forbidden: ForbiddenChars) -> Self {
        Self { forbidden }
    }

    /// Syntax check only: non-empty, no forbidden characters, no whitespace.
    pub fn check_syntax(&self, nick: &str) -> Result<(), NickError> {
        if nick.is_empty() {
            return Err(NickError::Empty);
        }
        if let Some(c) = self.forbidden.find_in(nick) {
            return Err(NickError::ForbiddenChar(c));
        }
        // A space or control byte would split the prefix on the wire.
        if let Some(c) = nick.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(NickError::ForbiddenChar(c));
        }
        Ok(())
    }

    /// Full check: syntax, then the configured shape.
    pub fn validate(&self, nick: &str, shape: &NickShape) -> Result<(), NickError> {
        self.check_syntax(nick)?;
        if shape.matches(nick) {
            return Ok(());
        }
        Err(match shape {
            NickShape::RequiredSeparator(sep) => NickError::MissingSeparator(sep.clone()),
            NickShape::GlobPattern(pattern) => NickError::PatternMismatch(pattern.clone()),
        })
    }
}

/// Case-insensitive wildcard match over chars: `*` is zero or more, `?` exactly one.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    // Iterative with single-star backtracking; no recursion on long input.
    let mut pi = 0;
    let mut ti = 0;
    let mut star_pi = usize::MAX;
    let mut star_ti = 0;

    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || same_char(pattern[pi], text[ti])) {
            pi += 1;
            ti += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            star_pi = pi;
            star_ti = ti;
            pi += 1;
        } else if star_pi != usize::MAX {
            pi = star_pi + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }

    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }

    pi == pattern.len()
}

fn same_char(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}
