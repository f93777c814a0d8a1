//! Identifier sanitization
//!
//! Relation and column names arrive from the stream and end up in DDL. Every name is
//! mapped onto `[A-Za-z0-9_]+`, non-empty and not starting with a digit, before it gets
//! anywhere near SQL.
//!
//! The mapping is lossy: `"a b"` and `"a-b"` both become `a_b`. Aliased relation names
//! share one relation; aliased column names in one message produce a duplicate column
//! definition which the store rejects. Nothing here tries to deduplicate.

use serde::Serialize;
use std::fmt;

/// Substituted when nothing of the raw name survives
pub const FALLBACK_IDENTIFIER: &str = "t";

/// Prepended (with `_`) when the sanitized name starts with a digit
pub const DIGIT_PREFIX: &str = "t";

/// A storage-safe name
///
/// Only constructible through [`sanitize`], so holding one proves the invariant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SafeIdentifier(String);

impl SafeIdentifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for embedding in SQL
    ///
    /// The identifier alphabet excludes `"`, so no escaping is needed.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for SafeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SafeIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Map an arbitrary external string onto a [`SafeIdentifier`]
///
/// Pure and total: each non-`[A-Za-z0-9_]` character becomes `_`, an empty result
/// becomes [`FALLBACK_IDENTIFIER`], and a leading digit gets the `t_` prefix.
pub fn sanitize(raw: &str) -> SafeIdentifier {
    let mut safe: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if safe.is_empty() {
        safe.push_str(FALLBACK_IDENTIFIER);
    }

    if safe.starts_with(|c: char| c.is_ascii_digit()) {
        safe = format!("{}_{}", DIGIT_PREFIX, safe);
    }

    SafeIdentifier(safe)
}

/// Sanitize every name in `raw`, preserving order
pub fn sanitize_all<S: AsRef<str>>(raw: &[S]) -> Vec<SafeIdentifier> {
    raw.iter().map(|name| sanitize(name.as_ref())).collect()
}

/// `"a", "b", "c"` for a column list
pub(crate) fn quoted_list(identifiers: &[SafeIdentifier]) -> String {
    identifiers
        .iter()
        .map(SafeIdentifier::quoted)
        .collect::<Vec<_>>()
        .join(", ")
}
