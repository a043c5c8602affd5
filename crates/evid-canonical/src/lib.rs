//! Canonicalization of free-text conditions into stable search keys,
//! plus the content-hash identities used for cross-version claim
//! tracking. Everything here is pure and total.

use evid_types::CandidateClaim;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const DEFAULT_HASH_LENGTH: usize = 8;
const GROUP_ID_HASH_LENGTH: usize = 16;

/// Normalized identity for a subject of inquiry. Multiple surface
/// spellings of the same condition map to one key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    /// Builds a key from already-resolved MeSH terms.
    pub fn from_mesh_terms<S: AsRef<str>>(terms: &[S]) -> Self {
        Self(mesh_signature(terms))
    }

    /// Best-effort key for input that never resolved to MeSH terms.
    pub fn from_condition(condition: &str) -> Self {
        Self(normalize_condition(condition))
    }

    /// Wraps a signature string that was previously computed here.
    pub fn from_signature(signature: impl Into<String>) -> Self {
        Self(signature.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Terms recovered from the signature, title-cased for display.
    pub fn display_terms(&self) -> Vec<String> {
        self.0
            .split('|')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(title_case)
            .collect()
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<CanonicalKey> for String {
    fn from(key: CanonicalKey) -> Self {
        key.0
    }
}

/// Accent-folds to ASCII, lowercases, and collapses whitespace.
/// Garbage input yields a best-effort key rather than an error.
pub fn normalize_condition(raw: &str) -> String {
    let mut folded = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match fold_char(ch) {
            Some(mapped) => folded.push_str(mapped),
            None if ch.is_ascii() => folded.push(ch.to_ascii_lowercase()),
            // Non-ASCII without a fold mapping is dropped outright.
            None => {}
        }
    }
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deterministic signature over a set of MeSH terms: normalized,
/// deduplicated by normalization, sorted, joined with `|`.
pub fn mesh_signature<S: AsRef<str>>(terms: &[S]) -> String {
    let mut normalized: Vec<String> = terms
        .iter()
        .map(|term| normalize_condition(term.as_ref()))
        .filter(|term| !term.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized.join("|")
}

/// URL-safe slug: lowercase ASCII alphanumerics separated by `-`.
pub fn slugify(value: &str) -> String {
    let normalized = normalize_condition(value);
    let mut slug = String::with_capacity(normalized.len());
    let mut pending_dash = false;
    for ch in normalized.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Short hex digest over the joined values, clamped to [4, 64] chars.
pub fn short_hash<S: AsRef<str>>(values: &[S], length: usize) -> String {
    let joined = values
        .iter()
        .map(|value| value.as_ref())
        .collect::<Vec<_>>()
        .join("::");
    let digest = Sha256::digest(joined.as_bytes());
    let hex = format!("{digest:x}");
    let length = length.clamp(4, hex.len());
    hex[..length].to_string()
}

/// Human-readable alias for a claim-set version, stable per key.
pub fn claim_set_slug(condition_label: &str, signature: &str) -> String {
    let base = slugify(condition_label);
    let suffix_source = if signature.is_empty() {
        condition_label
    } else {
        signature
    };
    let suffix = short_hash(&[suffix_source], DEFAULT_HASH_LENGTH);
    let slug = if base.is_empty() {
        suffix
    } else {
        format!("{base}--{suffix}")
    };
    slug.chars().take(255).collect()
}

/// Content identity for a claim within one run: classification plus
/// the normalized drug sets and summary. Unique per version.
pub fn canonical_claim_hash(claim: &CandidateClaim) -> String {
    let mut drugs: Vec<String> = claim
        .drugs
        .iter()
        .map(|term| normalize_condition(term))
        .filter(|term| !term.is_empty())
        .collect();
    drugs.sort();
    drugs.dedup();

    let mut classes: Vec<String> = claim
        .drug_classes
        .iter()
        .map(|term| normalize_condition(term))
        .filter(|term| !term.is_empty())
        .collect();
    classes.sort();
    classes.dedup();

    let material = format!(
        "{}\n{}\n{}\n{}",
        claim.classification,
        drugs.join(","),
        classes.join(","),
        normalize_condition(&claim.summary),
    );
    format!("{:x}", Sha256::digest(material.as_bytes()))
}

/// Stable cross-version identity for a logically identical claim.
/// Derived purely from the key and content hash, so recommitting the
/// same claim never mints a second group id.
pub fn claim_group_id(key: &CanonicalKey, canonical_hash: &str) -> String {
    format!(
        "grp-{}",
        short_hash(&[key.as_str(), canonical_hash], GROUP_ID_HASH_LENGTH)
    )
}

fn title_case(value: &str) -> String {
    value
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Latin-script accent folding, enough to cover condition and drug
/// names as they appear in PubMed metadata.
fn fold_char(ch: char) -> Option<&'static str> {
    let mapped = match ch {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "a",
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => "e",
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => "i",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' => "o",
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => "u",
        'ý' | 'ÿ' | 'Ý' => "y",
        'ñ' | 'Ñ' => "n",
        'ç' | 'Ç' => "c",
        'ß' => "ss",
        'æ' | 'Æ' => "ae",
        'œ' | 'Œ' => "oe",
        'đ' | 'Đ' | 'ð' | 'Ð' => "d",
        'ł' | 'Ł' => "l",
        'š' | 'Š' => "s",
        'ž' | 'Ž' => "z",
        _ => return None,
    };
    Some(mapped)
}
