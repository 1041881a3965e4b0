use std::fmt;

use blake2::digest::consts::U32;
use blake2::digest::Mac as _;
use blake2::Blake2bMac;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

type KeyedBlake2b256 = Blake2bMac<U32>;

/// A 32-byte content address (keyed BLAKE2b-256 of the addressed bytes).
///
/// Equality is byte equality. On the wire a MAC is always exactly 32
/// bytes; deserialization rejects any other length.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mac(pub [u8; 32]);

impl Mac {
    /// The all-zero MAC. Used as a sentinel ("no state file given").
    pub const ZERO: Mac = Mac([0u8; 32]);

    /// Compute a MAC using keyed BLAKE2b-256.
    pub fn compute(key: &[u8; 32], data: &[u8]) -> Self {
        let mut hasher =
            KeyedBlake2b256::new_from_slice(key).expect("valid 32-byte key for BLAKE2b");
        hasher.update(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize().into_bytes());
        Mac(out)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Hex-encode the full MAC for use as a storage key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode a full 64-char hex string. Any other length is rejected.
    pub fn from_hex(s: &str) -> Option<Mac> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; 32] = raw.try_into().ok()?;
        Some(Mac(bytes))
    }

    /// First byte as a two-char hex string, used for shard directories.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// First 4 bytes hex-encoded (8 chars), the short display form used
    /// for snapshot directory names.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for Mac {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// Serialized as raw bytes (msgpack bin) rather than an integer sequence,
// and length-checked on the way in: a non-32-byte MAC is a protocol error.
impl Serialize for Mac {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct MacVisitor;

impl<'de> Visitor<'de> for MacVisitor {
    type Value = Mac;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("exactly 32 bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Mac, E> {
        let bytes: [u8; 32] = v
            .try_into()
            .map_err(|_| E::invalid_length(v.len(), &self))?;
        Ok(Mac(bytes))
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Mac, A::Error>
    where
        A: de::SeqAccess<'de>,
    {
        let mut bytes = [0u8; 32];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        if seq.next_element::<u8>()?.is_some() {
            return Err(de::Error::invalid_length(33, &self));
        }
        Ok(Mac(bytes))
    }
}

impl<'de> Deserialize<'de> for Mac {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Mac, D::Error> {
        deserializer.deserialize_bytes(MacVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [0xAA; 32]
    }

    #[test]
    fn compute_deterministic() {
        let id1 = Mac::compute(&test_key(), b"hello world");
        let id2 = Mac::compute(&test_key(), b"hello world");
        assert_eq!(id1, id2);
    }

    #[test]
    fn compute_different_data_different_mac() {
        assert_ne!(
            Mac::compute(&test_key(), b"hello"),
            Mac::compute(&test_key(), b"world")
        );
    }

    #[test]
    fn compute_different_key_different_mac() {
        assert_ne!(
            Mac::compute(&[0xAA; 32], b"same data"),
            Mac::compute(&[0xBB; 32], b"same data")
        );
    }

    #[test]
    fn hex_round_trip() {
        let mac = Mac::compute(&test_key(), b"round trip");
        assert_eq!(mac.to_hex().len(), 64);
        assert_eq!(Mac::from_hex(&mac.to_hex()), Some(mac));
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert_eq!(Mac::from_hex("deadbeef"), None);
        assert_eq!(Mac::from_hex(""), None);
        let too_long = "ab".repeat(33);
        assert_eq!(Mac::from_hex(&too_long), None);
    }

    #[test]
    fn shard_prefix_is_first_byte() {
        let mac = Mac([0xAB; 32]);
        assert_eq!(mac.shard_prefix(), "ab");
    }

    #[test]
    fn short_hex_is_first_four_bytes() {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(Mac(bytes).short_hex(), "deadbeef");
    }

    #[test]
    fn zero_sentinel() {
        assert!(Mac::ZERO.is_zero());
        assert!(!Mac::compute(&test_key(), b"x").is_zero());
    }

    #[test]
    fn serde_round_trip() {
        let mac = Mac::compute(&test_key(), b"serde");
        let bytes = rmp_serde::to_vec(&mac).unwrap();
        let back: Mac = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(mac, back);
    }

    #[test]
    fn serde_encodes_as_bin32() {
        let mac = Mac([0x42; 32]);
        let bytes = rmp_serde::to_vec(&mac).unwrap();
        // bin8 marker + length + 32 payload bytes
        assert_eq!(bytes.len(), 2 + 32);
        assert_eq!(&bytes[2..], &[0x42; 32]);
    }

    #[test]
    fn serde_rejects_short_bin() {
        // bin8 of 4 bytes
        let bad = [0xC4, 0x04, 1, 2, 3, 4];
        assert!(rmp_serde::from_slice::<Mac>(&bad).is_err());
    }
}
