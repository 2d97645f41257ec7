//! Chain Block
//!
//! Wraps an [`AuditEvent`] with the metadata that links it into its
//! partition's hash chain.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::audit::codec;
use crate::audit::event::AuditEvent;

const HASH_PREFIX: &str = "sha256:";

/// SHA-256 digest of an event's canonical form
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// `previous_hash` of every genesis block
    pub const GENESIS: ContentHash = ContentHash([0u8; 32]);

    pub fn digest(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Hash of the event's canonical byte form
    pub fn of_event(event: &AuditEvent) -> Self {
        Self::digest(&codec::canonicalize(event))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_genesis(&self) -> bool {
        *self == Self::GENESIS
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", HASH_PREFIX, self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self)
    }
}

impl FromStr for ContentHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s.strip_prefix(HASH_PREFIX).unwrap_or(s);
        let raw = hex::decode(hex_part).map_err(|e| format!("Invalid hash hex: {}", e))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| format!("Invalid hash length: {} bytes", v.len()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Bytes covered by a block signature: `content_hash ‖ previous_hash ‖ position`
pub fn signing_payload(
    content_hash: &ContentHash,
    previous_hash: &ContentHash,
    chain_position: u64,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(72);
    payload.extend_from_slice(content_hash.as_bytes());
    payload.extend_from_slice(previous_hash.as_bytes());
    payload.extend_from_slice(&chain_position.to_be_bytes());
    payload
}

/// An event plus its chain metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainBlock {
    pub event: AuditEvent,
    pub content_hash: ContentHash,
    pub previous_hash: ContentHash,
    pub chain_position: u64,
    /// Compact secp256k1 ECDSA signature, hex encoded
    pub signature: String,
    pub signer_key_id: String,
}

impl ChainBlock {
    pub fn signing_payload(&self) -> Vec<u8> {
        signing_payload(&self.content_hash, &self.previous_hash, self.chain_position)
    }

    /// Whether the stored content hash still matches the event
    pub fn verify_content_hash(&self) -> bool {
        ContentHash::of_event(&self.event) == self.content_hash
    }

    /// Whether this block names `previous` as its predecessor
    pub fn follows(&self, previous: &ChainBlock) -> bool {
        self.chain_position == previous.chain_position + 1
            && self.previous_hash == ContentHash::of_event(&previous.event)
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "#{} {} [{}]",
            self.chain_position,
            self.event.event_id,
            self.content_hash
        )
    }
}

/// Current tip of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub position: u64,
    pub content_hash: ContentHash,
}

impl ChainTip {
    /// Position and predecessor hash for the next block appended after `tip`
    pub fn next(tip: Option<ChainTip>) -> (u64, ContentHash) {
        match tip {
            Some(t) => (t.position + 1, t.content_hash),
            None => (0, ContentHash::GENESIS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_display_and_parse() {
        let hash = ContentHash::digest(b"audit");
        let text = hash.to_string();
        assert!(text.starts_with("sha256:"));
        assert_eq!(text.len(), 71); // "sha256:" + 64 hex chars
        assert_eq!(text.parse::<ContentHash>().unwrap(), hash);
        assert_eq!(hash.to_hex().parse::<ContentHash>().unwrap(), hash);
    }

    #[test]
    fn test_hash_parse_rejects_bad_input() {
        assert!("sha256:zz".parse::<ContentHash>().is_err());
        assert!("sha256:abcd".parse::<ContentHash>().is_err());
    }

    #[test]
    fn test_genesis_sentinel() {
        assert!(ContentHash::GENESIS.is_genesis());
        assert_eq!(ContentHash::GENESIS.to_hex(), "0".repeat(64));
        assert!(!ContentHash::digest(b"").is_genesis());
    }

    #[test]
    fn test_signing_payload_layout() {
        let a = ContentHash::digest(b"a");
        let b = ContentHash::digest(b"b");
        let payload = signing_payload(&a, &b, 258);
        assert_eq!(payload.len(), 72);
        assert_eq!(&payload[..32], a.as_bytes());
        assert_eq!(&payload[32..64], b.as_bytes());
        assert_eq!(&payload[64..], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_ne!(payload, signing_payload(&a, &b, 259));
    }

    #[test]
    fn test_next_position() {
        assert_eq!(ChainTip::next(None), (0, ContentHash::GENESIS));
        let hash = ContentHash::digest(b"tip");
        let tip = ChainTip {
            position: 4,
            content_hash: hash,
        };
        assert_eq!(ChainTip::next(Some(tip)), (5, hash));
    }

    #[test]
    fn test_hash_serde() {
        let hash = ContentHash::digest(b"x");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash));
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
