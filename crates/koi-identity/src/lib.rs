#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **koi-identity** - dual-identity primitives for the KOI processor node.
//!
//! An [`Rid`] names a logical resource independent of its content
//! (`orn:<namespace>.<type>:<id>`); a [`Cid`] names a byte sequence by its
//! SHA-256 digest (`cid:sha256:<hex64>`). Both are immutable, validated on
//! construction, and round-trip through their textual wire form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum encoded length of an RID, in bytes.
pub const MAX_RID_LEN: usize = 512;

/// Textual sentinel used as the `inputCid` of a retroactive receipt whose
/// true predecessor is unknown.
pub const SENTINEL_CID: &str = "cid:unknown:retroactive";

/// Errors raised by RID/CID construction and parsing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    /// `mintRID`'s `id` argument was empty or contained bytes the wire
    /// format does not allow.
    #[error("invalid id for RID: {0}")]
    InvalidId(String),
    /// A string did not parse as a well-formed RID.
    #[error("malformed RID: {0}")]
    MalformedRid(String),
    /// A string did not parse as a well-formed CID.
    #[error("malformed CID: {0}")]
    MalformedCid(String),
}

/// A stable semantic identifier: `orn:<namespace>.<type>:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rid {
    namespace: String,
    kind: String,
    id: String,
}

impl Rid {
    /// Mint a new RID from its three parts, validating `id`.
    ///
    /// `namespace` and `kind` are expected to already match
    /// `[a-z][a-z0-9-]*`; callers that source them from fixed string
    /// literals (the common case) can rely on that invariant instead of
    /// handling an error for it here. Only `id` is validated, matching the
    /// contract's edge policy: minting fails on the caller-provided `id`,
    /// never on the fixed namespace/type vocabulary.
    pub fn mint(namespace: &str, kind: &str, id: &str) -> Result<Self, IdentityError> {
        if !is_label(namespace) {
            return Err(IdentityError::InvalidId(format!(
                "namespace '{namespace}' must match [a-z][a-z0-9-]*"
            )));
        }
        if !is_label(kind) {
            return Err(IdentityError::InvalidId(format!(
                "type '{kind}' must match [a-z][a-z0-9-]*"
            )));
        }
        if id.is_empty() {
            return Err(IdentityError::InvalidId("id must not be empty".into()));
        }
        if !id.bytes().all(is_id_byte) {
            return Err(IdentityError::InvalidId(format!(
                "id '{id}' contains characters outside [A-Za-z0-9/._-]"
            )));
        }
        let candidate = Rid {
            namespace: namespace.to_ascii_lowercase(),
            kind: kind.to_ascii_lowercase(),
            id: id.to_string(),
        };
        if candidate.to_string().len() > MAX_RID_LEN {
            return Err(IdentityError::InvalidId(format!(
                "id '{id}' pushes RID past {MAX_RID_LEN} bytes"
            )));
        }
        Ok(candidate)
    }

    /// Parse an RID from its wire form `orn:<ns>.<type>:<id>`.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let s = s.trim();
        if s.len() > MAX_RID_LEN {
            return Err(IdentityError::MalformedRid(format!(
                "RID exceeds {MAX_RID_LEN} bytes"
            )));
        }
        let rest = s
            .strip_prefix("orn:")
            .ok_or_else(|| IdentityError::MalformedRid(format!("missing 'orn:' prefix: {s}")))?;
        let (head, id) = rest
            .split_once(':')
            .ok_or_else(|| IdentityError::MalformedRid(format!("missing id separator: {s}")))?;
        let (namespace, kind) = head
            .split_once('.')
            .ok_or_else(|| IdentityError::MalformedRid(format!("missing namespace.type: {s}")))?;
        if !is_label(namespace) || !is_label(kind) {
            return Err(IdentityError::MalformedRid(format!(
                "namespace/type must match [a-z][a-z0-9-]*: {s}"
            )));
        }
        if id.is_empty() || !id.bytes().all(is_id_byte) {
            return Err(IdentityError::MalformedRid(format!("invalid id: {s}")));
        }
        Ok(Rid {
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            id: id.to_string(),
        })
    }

    /// The `<namespace>` component.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The `<type>` component.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The `<id>` component.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Does this RID's string form start with the given glob-free prefix,
    /// up to and including a trailing `*`?
    ///
    /// Supports a single trailing `*` wildcard, matching the subscription
    /// pattern syntax (e.g. `orn:regen.governance:*`). A pattern without a
    /// `*` must match exactly.
    pub fn matches_glob(&self, pattern: &str) -> bool {
        let full = self.to_string();
        match pattern.strip_suffix('*') {
            Some(prefix) => full.starts_with(prefix),
            None => full == pattern,
        }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "orn:{}.{}:{}", self.namespace, self.kind, self.id)
    }
}

impl FromStr for Rid {
    type Err = IdentityError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Rid::parse(s)
    }
}

impl TryFrom<String> for Rid {
    type Error = IdentityError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Rid::parse(&value)
    }
}

impl From<Rid> for String {
    fn from(rid: Rid) -> Self {
        rid.to_string()
    }
}

fn is_label(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn is_id_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'/' | b'.' | b'-' | b'_')
}

/// A content-addressed identifier: `cid:sha256:<64 lower-hex>`, or the
/// retroactive sentinel [`SENTINEL_CID`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid(String);

impl Cid {
    /// Compute the CID of `bytes`: SHA-256, lower-hex.
    ///
    /// Pure and deterministic; whitespace-only or otherwise degenerate
    /// byte strings still hash normally - rejecting empty content is the
    /// Ingestion API's job, not this function's.
    pub fn hash_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Cid(format!("cid:sha256:{}", hex_lower(&digest)))
    }

    /// The sentinel CID used as the `inputCid` of a retroactive receipt.
    pub fn sentinel() -> Self {
        Cid(SENTINEL_CID.to_string())
    }

    /// Is this the retroactive sentinel?
    pub fn is_sentinel(&self) -> bool {
        self.0 == SENTINEL_CID
    }

    /// Parse a CID from its wire form. Accepts any case on the hex digits
    /// but always normalizes to lowercase.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let s = s.trim();
        if s == SENTINEL_CID {
            return Ok(Cid::sentinel());
        }
        let digest = s
            .strip_prefix("cid:sha256:")
            .ok_or_else(|| IdentityError::MalformedCid(format!("missing 'cid:sha256:' prefix: {s}")))?;
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IdentityError::MalformedCid(format!(
                "digest must be 64 hex characters: {s}"
            )));
        }
        Ok(Cid(format!("cid:sha256:{}", digest.to_ascii_lowercase())))
    }

    /// The lower-hex digest, without the `cid:sha256:` prefix. Panics if
    /// called on the sentinel; callers should check [`Cid::is_sentinel`]
    /// first.
    pub fn digest_hex(&self) -> &str {
        self.0
            .strip_prefix("cid:sha256:")
            .expect("digest_hex called on sentinel CID")
    }

    /// The full wire-form string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Cid {
    type Err = IdentityError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cid::parse(s)
    }
}

impl TryFrom<String> for Cid {
    type Error = IdentityError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Cid::parse(&value)
    }
}

impl From<Cid> for String {
    fn from(cid: Cid) -> Self {
        cid.0
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String cannot fail");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_and_displays_rid() {
        let rid = Rid::mint("regen", "raw", "notion/pageA").unwrap();
        assert_eq!(rid.to_string(), "orn:regen.raw:notion/pageA");
    }

    #[test]
    fn rejects_empty_id() {
        assert!(matches!(
            Rid::mint("regen", "raw", ""),
            Err(IdentityError::InvalidId(_))
        ));
    }

    #[test]
    fn rejects_disallowed_id_bytes() {
        assert!(matches!(
            Rid::mint("regen", "raw", "has space"),
            Err(IdentityError::InvalidId(_))
        ));
    }

    #[test]
    fn parse_round_trips_mint() {
        let rid = Rid::mint("regen", "raw", "twitter/99").unwrap();
        let parsed = Rid::parse(&rid.to_string()).unwrap();
        assert_eq!(rid, parsed);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Rid::parse("not-a-rid").is_err());
        assert!(Rid::parse("orn:Regen.raw:x").is_err());
        assert!(Rid::parse("orn:regen.raw:").is_err());
    }

    #[test]
    fn glob_matches_trailing_star() {
        let rid = Rid::parse("orn:regen.governance:proposal/12").unwrap();
        assert!(rid.matches_glob("orn:regen.governance:*"));
        assert!(!rid.matches_glob("orn:regen.raw:*"));
        assert!(rid.matches_glob("orn:regen.governance:proposal/12"));
    }

    #[test]
    fn hash_is_deterministic() {
        let a = Cid::hash_bytes(b"hello world");
        let b = Cid::hash_bytes(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, Cid::hash_bytes(b"hello world!"));
    }

    #[test]
    fn hash_matches_known_vector() {
        // Known SHA-256 of the empty byte string.
        let cid = Cid::hash_bytes(b"");
        assert_eq!(
            cid.digest_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn parse_is_case_insensitive_but_writes_lowercase() {
        let upper = format!("cid:sha256:{}", "A".repeat(64));
        let cid = Cid::parse(&upper).unwrap();
        assert_eq!(cid.as_str(), format!("cid:sha256:{}", "a".repeat(64)));
    }

    #[test]
    fn sentinel_round_trips() {
        let sentinel = Cid::sentinel();
        assert!(sentinel.is_sentinel());
        assert_eq!(Cid::parse(SENTINEL_CID).unwrap(), sentinel);
    }

    #[test]
    fn parse_rejects_wrong_length_digest() {
        assert!(Cid::parse("cid:sha256:abcd").is_err());
    }

    proptest::proptest! {
        #[test]
        fn rid_parse_display_round_trips(id in "[A-Za-z0-9_./-]{1,40}") {
            let rid = Rid::mint("regen", "raw", &id).unwrap();
            let parsed = Rid::parse(&rid.to_string()).unwrap();
            proptest::prop_assert_eq!(rid, parsed);
        }

        #[test]
        fn hash_cid_is_pure(bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..200)) {
            proptest::prop_assert_eq!(Cid::hash_bytes(&bytes), Cid::hash_bytes(&bytes));
        }
    }
}
