//! Canonical query representation and fingerprinting.
//!
//! Every request entering the governor is turned into a [`NormalizedQuery`]
//! before admission. Normalization lower-cases the text, strips punctuation
//! and collapses whitespace so that trivially different phrasings collapse to
//! the same [`Fingerprint`]. The context key (persona, domain, system prompt
//! identity) is hashed together with the text, so the same question asked in
//! two contexts never shares a cache entry.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use uuid::Uuid;

/// Operation class assigned when the caller does not name one.
pub const DEFAULT_OPERATION: &str = "generate";

static PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}\s]").expect("valid punctuation pattern"));

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

/// Lower-case, strip punctuation and collapse whitespace.
pub fn normalize_text(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let stripped = PUNCTUATION.replace_all(&lowered, "");
    WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
}

/// Request priority. Ordering is `Low < Medium < High`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Unique identity of one submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(Uuid);

impl QueryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hex-encoded SHA-256 over the context key and normalized text.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(context_key: &str, normalized_text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(context_key.as_bytes());
        // Unit separator keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update([0x1f]);
        hasher.update(normalized_text.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A submission in canonical form. Immutable once built.
#[derive(Clone, Debug)]
pub struct NormalizedQuery {
    id: QueryId,
    raw_text: String,
    normalized_text: String,
    context_key: String,
    fingerprint: Fingerprint,
    priority: Priority,
    submitted_at: Instant,
    caller_id: String,
    operation: String,
}

impl NormalizedQuery {
    /// Normalize and fingerprint a raw request.
    ///
    /// Fails with [`crate::Error::InvalidQuery`] when nothing fingerprintable is
    /// left after normalization.
    pub fn new(
        raw_text: impl Into<String>,
        context_key: impl Into<String>,
        caller_id: impl Into<String>,
    ) -> crate::Result<Self> {
        let raw_text = raw_text.into();
        let normalized_text = normalize_text(&raw_text);
        if normalized_text.is_empty() {
            return Err(crate::Error::InvalidQuery(
                "query text is empty after normalization".into(),
            ));
        }

        // A blank key is a context of its own, never an alias for a named one.
        let context_key = context_key.into().trim().to_string();

        let fingerprint = Fingerprint::compute(&context_key, &normalized_text);

        Ok(Self {
            id: QueryId::new(),
            raw_text,
            normalized_text,
            context_key,
            fingerprint,
            priority: Priority::default(),
            submitted_at: Instant::now(),
            caller_id: caller_id.into(),
            operation: DEFAULT_OPERATION.to_string(),
        })
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn normalized_text(&self) -> &str {
        &self.normalized_text
    }

    pub fn context_key(&self) -> &str {
        &self.context_key
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Time spent since submission.
    pub fn waited(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.submitted_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  What IS   Rust?! "), "what is rust");
        assert_eq!(normalize_text("Hello,\tworld\n"), "hello world");
        assert_eq!(normalize_text("Ünïcode — Größe"), "ünïcode größe");
        assert_eq!(normalize_text("?!..."), "");
    }

    #[test]
    fn test_fingerprint_ignores_case_and_punctuation() {
        let a = NormalizedQuery::new("What is Rust?", "tutor", "u1").unwrap();
        let b = NormalizedQuery::new("what   is rust", "tutor", "u2").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_fingerprint_is_context_sensitive() {
        let a = NormalizedQuery::new("What is Rust?", "tutor", "u1").unwrap();
        let b = NormalizedQuery::new("What is Rust?", "pirate", "u1").unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_separator() {
        assert_ne!(
            Fingerprint::compute("ab", "c"),
            Fingerprint::compute("a", "bc")
        );
        assert_eq!(Fingerprint::compute("a", "b").as_str().len(), 64);
    }

    #[test]
    fn test_empty_query_rejected() {
        let err = NormalizedQuery::new("   ...  ", "tutor", "u1").unwrap_err();
        assert!(matches!(err, crate::Error::InvalidQuery(_)));
    }

    #[test]
    fn test_blank_context_is_distinct() {
        let q = NormalizedQuery::new("hello", "  ", "u1").unwrap();
        let named = NormalizedQuery::new("hello", "default", "u1").unwrap();
        assert_eq!(q.context_key(), "");
        assert_ne!(q.fingerprint(), named.fingerprint());
        assert_eq!(
            q.fingerprint(),
            NormalizedQuery::new("hello", "", "u2").unwrap().fingerprint()
        );
        assert_eq!(q.operation(), DEFAULT_OPERATION);
        assert_eq!(q.priority(), Priority::Medium);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }
}
