//! Hashing used for bucketing, ID-list lookups and client initialize payloads.
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub trait Sharder {
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64;
}

/// The default (and only) sharder: first 8 bytes of SHA-256, big-endian.
pub struct Sha256Sharder;

impl Sharder for Sha256Sharder {
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64 {
        let hash = Sha256::digest(input);
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash[..8]);
        u64::from_be_bytes(prefix) % total_shards
    }
}

/// Base64 encoded SHA-256 of `input`.
pub fn sha256_base64(input: impl AsRef<[u8]>) -> String {
    STANDARD.encode(Sha256::digest(input))
}

/// Hashed form of an ID as it appears in ID lists.
pub(crate) fn id_list_hash(id: &str) -> String {
    let mut hash = sha256_base64(id);
    hash.truncate(8);
    hash
}

/// 32-bit djb2 of `input`, as a decimal string.
pub fn djb2(input: &str) -> String {
    let hash = input.chars().fold(0u32, |hash, c| {
        (hash << 5).wrapping_sub(hash).wrapping_add(c as u32)
    });
    hash.to_string()
}

/// How names are obfuscated in a client initialize payload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Djb2,
    Sha256,
    /// Names are sent as-is.
    None,
}

impl HashAlgorithm {
    pub fn hash(&self, input: &str) -> String {
        match self {
            HashAlgorithm::Djb2 => djb2(input),
            HashAlgorithm::Sha256 => sha256_base64(input),
            HashAlgorithm::None => input.to_owned(),
        }
    }
}
