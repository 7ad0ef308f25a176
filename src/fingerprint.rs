//! Stable fingerprints for the analysis cache.
//!
//! A [`CacheKey`] combines the identity of one resume file with the hashes of
//! the scoring context (job description, weights, hard filters). Identical
//! inputs always give the same key and a change to any one component gives a
//! different key.
//!
//! # Hash function
//! BLAKE3, truncated to 128 bits and rendered as 32 lowercase hex characters.
//! Truncation keeps persisted keys short. Two distinct inputs collide with
//! probability about 2^-128 per pair, which for a store bounded to a few
//! hundred entries is negligible but not zero: a collision would serve a
//! cached analysis for the wrong context.
//!
//! # File identity
//! Files are identified by `(name, size, lastModified)` unless the caller
//! supplies a content hash. A renamed copy of an identical file is a miss; a
//! different file with the same name, size and timestamp is a false hit.

use crate::criteria::{HardFilters, WeightCriteria};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

const DIGEST_HEX_LEN: usize = 32;

/// Hex digest used as one component of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    fn from_hasher(hasher: blake3::Hasher) -> Self {
        let hex = hasher.finalize().to_hex();
        Digest(hex.as_str()[..DIGEST_HEX_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintError {
    EmptyName,
    InvalidTimestamp(i64),
    Serialize(String),
}

impl fmt::Display for FingerprintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FingerprintError::EmptyName => write!(f, "File name is empty"),
            FingerprintError::InvalidTimestamp(ts) => {
                write!(f, "Invalid last-modified timestamp: {}", ts)
            }
            FingerprintError::Serialize(msg) => {
                write!(f, "Cannot serialize configuration: {}", msg)
            }
        }
    }
}

impl std::error::Error for FingerprintError {}

/// What the cache knows about an uploaded resume. Content is never read here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    /// Epoch milliseconds, as `File.lastModified` reports it.
    pub last_modified: i64,
    /// Digest of the file bytes, when the caller already computed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size: u64, last_modified: i64) -> Self {
        Self { name: name.into(), size, last_modified, content_hash: None }
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }
}

/// Collapse every whitespace run to one space and trim the ends.
pub fn normalize_text(input: &str) -> String {
    WHITESPACE_RUN.replace_all(input.trim(), " ").into_owned()
}

/// Digest of normalised text; formatting-only edits keep the same hash.
pub fn hash_text(input: &str) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"text\0");
    hasher.update(normalize_text(input).as_bytes());
    Digest::from_hasher(hasher)
}

/// JSON with object keys sorted at every level.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, FingerprintError> {
    let value =
        serde_json::to_value(value).map_err(|e| FingerprintError::Serialize(e.to_string()))?;
    serde_json::to_string(&canonicalize(value))
        .map_err(|e| FingerprintError::Serialize(e.to_string()))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key, canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Digest of a configuration value's canonical serialization.
pub fn hash_structured<T: Serialize + ?Sized>(value: &T) -> Result<Digest, FingerprintError> {
    let canonical = canonical_json(value)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"json\0");
    hasher.update(canonical.as_bytes());
    Ok(Digest::from_hasher(hasher))
}

/// Identity digest of a resume file from its metadata (or its content hash).
pub fn fingerprint_file(file: &FileDescriptor) -> Result<Digest, FingerprintError> {
    if file.name.trim().is_empty() {
        return Err(FingerprintError::EmptyName);
    }
    if file.last_modified < 0 {
        return Err(FingerprintError::InvalidTimestamp(file.last_modified));
    }

    let mut hasher = blake3::Hasher::new();
    match &file.content_hash {
        Some(content) if !content.is_empty() => {
            hasher.update(b"content\0");
            hasher.update(content.as_bytes());
        }
        _ => {
            // Length-prefixed so no name can imitate another (name, size) split.
            hasher.update(b"meta\0");
            hasher.update(&(file.name.len() as u64).to_le_bytes());
            hasher.update(file.name.as_bytes());
            hasher.update(&file.size.to_le_bytes());
            hasher.update(&file.last_modified.to_le_bytes());
        }
    }
    Ok(Digest::from_hasher(hasher))
}

/// The scoring context shared by every file in one analysis run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisContext {
    pub jd_hash: Digest,
    pub weights_hash: Digest,
    pub filters_hash: Digest,
}

/// Hash the job description, weights and filters of one run.
pub fn generate_analysis_hashes(
    jd_text: &str,
    weights: &WeightCriteria,
    filters: &HardFilters,
) -> Result<AnalysisContext, FingerprintError> {
    Ok(AnalysisContext {
        jd_hash: hash_text(jd_text),
        weights_hash: hash_structured(weights)?,
        filters_hash: hash_structured(filters)?,
    })
}

/// Composite cache key: one file in one scoring context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKey {
    pub file_fingerprint: Digest,
    pub jd_hash: Digest,
    pub weights_hash: Digest,
    pub filters_hash: Digest,
}

impl CacheKey {
    pub fn new(file_fingerprint: Digest, context: &AnalysisContext) -> Self {
        Self {
            file_fingerprint,
            jd_hash: context.jd_hash.clone(),
            weights_hash: context.weights_hash.clone(),
            filters_hash: context.filters_hash.clone(),
        }
    }

    pub fn for_file(
        file: &FileDescriptor,
        context: &AnalysisContext,
    ) -> Result<Self, FingerprintError> {
        Ok(Self::new(fingerprint_file(file)?, context))
    }

    /// `fp:jd:weights:filters`. Hex digests contain no `:`, so this is injective.
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.file_fingerprint, self.jd_hash, self.weights_hash, self.filters_hash
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::MainCriterion;
    use serde_json::json;

    #[test]
    fn whitespace_is_normalized_before_hashing() {
        assert_eq!(normalize_text("  Rust \n\t engineer  "), "Rust engineer");
        assert_eq!(hash_text("Rust engineer"), hash_text("  Rust\n\nengineer "));
        assert_ne!(hash_text("Rust engineer"), hash_text("Rust  developer"));
    }

    #[test]
    fn digests_are_32_hex_chars() {
        let digest = hash_text("jd");
        assert_eq!(digest.as_str().len(), DIGEST_HEX_LEN);
        assert!(digest.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn structured_hash_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": true}});
        let b = json!({"a": {"x": true, "y": [1, 2]}, "b": 1});
        assert_eq!(hash_structured(&a).unwrap(), hash_structured(&b).unwrap());
        // Array order is meaningful.
        let c = json!({"a": {"x": true, "y": [2, 1]}, "b": 1});
        assert_ne!(hash_structured(&a).unwrap(), hash_structured(&c).unwrap());
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"z": {"b": 0, "a": 0}, "m": [{"d": 1, "c": 2}]});
        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"m":[{"c":2,"d":1}],"z":{"a":0,"b":0}}"#
        );
    }

    #[test]
    fn file_fingerprint_tracks_metadata() {
        let base = FileDescriptor::new("cv.pdf", 1024, 1_700_000_000_000);
        let same = fingerprint_file(&base).unwrap();
        assert_eq!(same, fingerprint_file(&base.clone()).unwrap());

        let renamed = FileDescriptor { name: "cv-final.pdf".into(), ..base.clone() };
        let resized = FileDescriptor { size: 2048, ..base.clone() };
        let touched = FileDescriptor { last_modified: 1_700_000_000_001, ..base.clone() };
        for other in [renamed, resized, touched] {
            assert_ne!(same, fingerprint_file(&other).unwrap());
        }
    }

    #[test]
    fn content_hash_overrides_metadata() {
        let a = FileDescriptor::new("a.pdf", 10, 1).with_content_hash("abc");
        let b = FileDescriptor::new("b.pdf", 99, 2).with_content_hash("abc");
        assert_eq!(fingerprint_file(&a).unwrap(), fingerprint_file(&b).unwrap());
    }

    #[test]
    fn malformed_metadata_is_rejected() {
        assert_eq!(
            fingerprint_file(&FileDescriptor::new("  ", 1, 1)),
            Err(FingerprintError::EmptyName)
        );
        assert_eq!(
            fingerprint_file(&FileDescriptor::new("cv.pdf", 1, -5)),
            Err(FingerprintError::InvalidTimestamp(-5))
        );
    }

    #[test]
    fn every_context_component_changes_the_key() {
        let file = FileDescriptor::new("cv.pdf", 10, 10);
        let mut weights = WeightCriteria::default();
        let skills = |weight| MainCriterion {
            name: "Skills".into(),
            weight: Some(weight),
            children: vec![],
        };
        weights.insert("skills", skills(50));
        let filters = HardFilters::default();
        let ctx = generate_analysis_hashes("Backend engineer", &weights, &filters).unwrap();
        let key = CacheKey::for_file(&file, &ctx).unwrap();

        let other_jd = generate_analysis_hashes("Frontend engineer", &weights, &filters).unwrap();
        let mut heavier = weights.clone();
        heavier.insert("skills", skills(60));
        let other_weights =
            generate_analysis_hashes("Backend engineer", &heavier, &filters).unwrap();
        let stricter = HardFilters { location: "Hanoi".into(), ..filters.clone() };
        let other_filters =
            generate_analysis_hashes("Backend engineer", &weights, &stricter).unwrap();

        for ctx in [other_jd, other_weights, other_filters] {
            assert_ne!(key, CacheKey::for_file(&file, &ctx).unwrap());
        }
    }

    #[test]
    fn encoded_key_has_four_parts() {
        let ctx = AnalysisContext {
            jd_hash: hash_text("a"),
            weights_hash: hash_text("b"),
            filters_hash: hash_text("c"),
        };
        let key = CacheKey::new(hash_text("file"), &ctx);
        let encoded = key.encode();
        assert_eq!(encoded.split(':').count(), 4);
        assert!(encoded.starts_with(key.file_fingerprint.as_str()));
    }
}
