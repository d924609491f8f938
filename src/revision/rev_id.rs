//! RevisionId - `"<generation>-<hash>"` revision identity
//!
//! - Generation is the integer prefix before the first `-` and is >= 1
//! - Well-formed ids order by generation numerically, then by hash bytes
//! - Malformed ids fall back to case-insensitive ordinal comparison of the
//!   whole string; peers are known to emit such ids and they are tolerated
//! - Immutable once created

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::Properties;

/// An opaque, comparable revision identifier.
///
/// Equality and hashing are exact on the underlying string. Ordering
/// follows [`compare_rev_ids`], with an exact byte comparison as the final
/// tie-break so that `Ord` stays consistent with `Eq`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(String);

impl RevisionId {
    /// Wrap a revision id string. No validation is performed.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Build `"<generation>-<suffix>"`.
    pub fn from_parts(generation: u64, suffix: &str) -> Self {
        Self(format!("{}-{}", generation, suffix))
    }

    /// Revision id used for local (non-replicated) documents.
    pub fn local(generation: u64) -> Self {
        Self::from_parts(generation, "local")
    }

    /// Returns the raw string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into `(generation, hash)` if well-formed.
    pub fn parse(&self) -> Option<(u64, &str)> {
        parse_rev_id(&self.0)
    }

    /// Generation number, or 0 for a malformed id.
    pub fn generation(&self) -> u64 {
        self.parse().map(|(generation, _)| generation).unwrap_or(0)
    }

    /// The hash portion after the first `-`, if well-formed.
    pub fn suffix(&self) -> Option<&str> {
        self.parse().map(|(_, suffix)| suffix)
    }

    /// Returns true if the id has a numeric generation >= 1.
    pub fn is_well_formed(&self) -> bool {
        self.parse().is_some()
    }

    /// Derive the id of a new child revision.
    ///
    /// The hash covers the parent id, the deleted flag and the canonical
    /// JSON body, so equal edits of the same parent produce equal ids.
    /// Returns `None` if the parent id has no numeric generation or is
    /// longer than 255 bytes.
    pub fn generate(
        parent: Option<&RevisionId>,
        body: Option<&Properties>,
        deleted: bool,
    ) -> Option<RevisionId> {
        let mut hasher = Sha256::new();
        let generation = match parent {
            Some(parent) => {
                let parent_generation = parent.parse()?.0;
                let bytes = parent.as_str().as_bytes();
                let len = u8::try_from(bytes.len()).ok()?;
                hasher.update([len]);
                hasher.update(bytes);
                parent_generation + 1
            }
            None => {
                hasher.update([0u8]);
                1
            }
        };
        hasher.update([u8::from(deleted)]);
        // serde_json maps are key-ordered, so this encoding is canonical.
        let json = match body {
            Some(props) => serde_json::to_vec(props).ok()?,
            None => b"{}".to_vec(),
        };
        hasher.update(&json);

        let digest = hasher.finalize();
        let hex: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();
        Some(Self::from_parts(generation, &hex))
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RevisionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RevisionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for RevisionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_rev_ids(&self.0, &other.0).then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn parse_rev_id(value: &str) -> Option<(u64, &str)> {
    let (prefix, suffix) = value.split_once('-')?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let generation: u64 = prefix.parse().ok()?;
    if generation == 0 {
        return None;
    }
    Some((generation, suffix))
}

/// Compare two revision id strings.
///
/// Generation dominates; equal generations compare their hashes by ordinal
/// byte order. If either side is malformed, both whole strings are compared
/// ASCII-case-insensitively instead.
pub fn compare_rev_ids(a: &str, b: &str) -> Ordering {
    match (parse_rev_id(a), parse_rev_id(b)) {
        (Some((gen_a, hash_a)), Some((gen_b, hash_b))) => gen_a
            .cmp(&gen_b)
            .then_with(|| hash_a.as_bytes().cmp(hash_b.as_bytes())),
        _ => {
            let lower_a = a.bytes().map(|c| c.to_ascii_lowercase());
            let lower_b = b.bytes().map(|c| c.to_ascii_lowercase());
            lower_a.cmp(lower_b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_well_formed() {
        let rev = RevisionId::new("12-abcdef");
        assert_eq!(rev.parse(), Some((12, "abcdef")));
        assert_eq!(rev.generation(), 12);
        assert_eq!(rev.suffix(), Some("abcdef"));
    }

    #[test]
    fn test_hash_may_contain_dashes() {
        let rev = RevisionId::new("3-ab-cd");
        assert_eq!(rev.parse(), Some((3, "ab-cd")));
    }

    #[test]
    fn test_malformed_ids() {
        for raw in ["abc", "-abc", "x-abc", "0-abc", "1a-abc", ""] {
            let rev = RevisionId::new(raw);
            assert!(!rev.is_well_formed(), "{:?} should be malformed", raw);
            assert_eq!(rev.generation(), 0);
        }
    }

    #[test]
    fn test_generation_dominates_hash() {
        assert_eq!(compare_rev_ids("2-aaa", "10-000"), Ordering::Less);
        assert_eq!(compare_rev_ids("10-000", "9-zzz"), Ordering::Greater);
    }

    #[test]
    fn test_hash_compared_ordinally() {
        assert_eq!(compare_rev_ids("3-abc", "3-abd"), Ordering::Less);
        // Ordinal: uppercase sorts before lowercase.
        assert_eq!(compare_rev_ids("3-B", "3-a"), Ordering::Less);
        assert_eq!(compare_rev_ids("3-abc", "3-abc"), Ordering::Equal);
    }

    #[test]
    fn test_malformed_falls_back_to_case_insensitive() {
        assert_eq!(compare_rev_ids("ABC", "abd"), Ordering::Less);
        assert_eq!(compare_rev_ids("abc", "ABC"), Ordering::Equal);
        // One malformed side is enough to trigger the fallback.
        assert_eq!(compare_rev_ids("10-a", "9"), Ordering::Less);
    }

    #[test]
    fn test_ord_consistent_with_eq() {
        let upper = RevisionId::new("ABC");
        let lower = RevisionId::new("abc");
        assert_ne!(upper, lower);
        assert_ne!(upper.cmp(&lower), Ordering::Equal);
    }

    #[test]
    fn test_generate_root() {
        let mut props = Properties::new();
        props.insert("a".into(), 1.into());
        let rev = RevisionId::generate(None, Some(&props), false).unwrap();
        assert_eq!(rev.generation(), 1);
        assert_eq!(rev.suffix().unwrap().len(), 32);
    }

    #[test]
    fn test_generate_is_deterministic() {
        let mut props = Properties::new();
        props.insert("a".into(), 1.into());
        let parent = RevisionId::new("1-abc");
        let a = RevisionId::generate(Some(&parent), Some(&props), false).unwrap();
        let b = RevisionId::generate(Some(&parent), Some(&props), false).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.generation(), 2);
    }

    #[test]
    fn test_generate_depends_on_inputs() {
        let mut props = Properties::new();
        props.insert("a".into(), 1.into());
        let parent = RevisionId::new("1-abc");
        let live = RevisionId::generate(Some(&parent), Some(&props), false).unwrap();
        let dead = RevisionId::generate(Some(&parent), Some(&props), true).unwrap();
        let other_parent =
            RevisionId::generate(Some(&RevisionId::new("1-abd")), Some(&props), false).unwrap();
        assert_ne!(live, dead);
        assert_ne!(live, other_parent);
    }

    #[test]
    fn test_generate_rejects_malformed_parent() {
        assert!(RevisionId::generate(Some(&RevisionId::new("bogus")), None, false).is_none());
    }

    #[test]
    fn test_serde_transparent() {
        let rev = RevisionId::new("1-abc");
        assert_eq!(serde_json::to_string(&rev).unwrap(), "\"1-abc\"");
        let back: RevisionId = serde_json::from_str("\"1-abc\"").unwrap();
        assert_eq!(back, rev);
    }
}
