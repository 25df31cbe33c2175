//! Word-level primitives of the configuration wire format.
//!
//! The configuration travels as a base64-encoded array of 32-bit words in
//! network byte order: an 8-byte verification string, a key-value stream,
//! and a trailing XOR checksum word.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{IcError, IcResult};

/// Verification string prefixed to every configuration byte array.
pub const CONFIG_MAGIC: &[u8; 8] = b"NDBCONFV";

/// Base64 line width used on the wire.
pub const BASE64_LINE_LEN: usize = 76;

/// Key config-id carried by every section's parent reference.
pub const PARENT_ID_KEY: u32 = 16_382;

/// Key config-id carried by every section's node-type entry.
pub const NODE_TYPE_KEY: u32 = 999;

/// Section-0 key whose value is the system meta-section index.
pub const SECTION0_SYSTEM_KEY: u32 = 1000;

/// Section-0 key whose value is the node meta-section index (always 1).
pub const SECTION0_NODE_KEY: u32 = 2000;

/// Section-0 key whose value is the communication meta-section index.
pub const SECTION0_COMM_KEY: u32 = 3000;

/// The node meta section is always section 1.
pub const NODE_META_SECTION: u32 = 1;

const KEY_TYPE_SHIFT: u32 = 28;
const SECTION_SHIFT: u32 = 14;
const FIELD_MASK: u32 = 0x3FFF;

/// Value type nibble of a key word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Int32,
    Str,
    SectionRef,
    Int64,
}

impl KeyType {
    #[must_use]
    pub fn wire_value(self) -> u32 {
        match self {
            KeyType::Int32 => 1,
            KeyType::Str => 2,
            KeyType::SectionRef => 3,
            KeyType::Int64 => 4,
        }
    }

    #[must_use]
    pub fn from_wire_value(value: u32) -> Option<KeyType> {
        match value {
            1 => Some(KeyType::Int32),
            2 => Some(KeyType::Str),
            3 => Some(KeyType::SectionRef),
            4 => Some(KeyType::Int64),
            _ => None,
        }
    }
}

/// Packs a key word: `(type:4)(section_id:14)(config_id:14)`.
#[must_use]
pub fn pack_key(key_type: KeyType, section_id: u32, config_id: u32) -> u32 {
    debug_assert!(section_id <= FIELD_MASK);
    debug_assert!(config_id <= FIELD_MASK);
    (key_type.wire_value() << KEY_TYPE_SHIFT)
        | ((section_id & FIELD_MASK) << SECTION_SHIFT)
        | (config_id & FIELD_MASK)
}

/// Splits a key word into its type, section id, and config id.
pub fn unpack_key(word: u32, source_line: u32) -> IcResult<(KeyType, u32, u32)> {
    let key_type = KeyType::from_wire_value(word >> KEY_TYPE_SHIFT)
        .ok_or(IcError::ProtocolError { line: source_line })?;
    let section_id = (word >> SECTION_SHIFT) & FIELD_MASK;
    let config_id = word & FIELD_MASK;
    Ok((key_type, section_id, config_id))
}

/// Number of value words a string of `len` content bytes occupies, not
/// counting the key and length words. The terminating zero plus one byte
/// of historical padding are included before rounding up.
#[must_use]
pub fn string_word_count(len: usize) -> usize {
    (len + 2).div_ceil(4)
}

/// XOR of all 32-bit big-endian words of `bytes`.
///
/// A well-formed configuration array XORs to zero including its trailing
/// checksum word.
#[must_use]
pub fn xor_words(bytes: &[u8]) -> u32 {
    debug_assert!(bytes.len() % 4 == 0);
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .fold(0, |acc, w| acc ^ w)
}

/// Serialises words to network byte order.
#[must_use]
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    bytes
}

/// Reads words from network byte order.
pub fn bytes_to_words(bytes: &[u8], source_line: u32) -> IcResult<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(IcError::ProtocolError { line: source_line });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Base64-encodes a configuration byte array (no line wrapping; the wire
/// protocol layer chops the result into [`BASE64_LINE_LEN`] lines).
#[must_use]
pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decodes the base64 body of a configuration exchange.
pub fn decode_base64(text: &str) -> IcResult<Vec<u8>> {
    BASE64
        .decode(text.as_bytes())
        .map_err(|_| IcError::ProtocolError { line: line!() })
}
