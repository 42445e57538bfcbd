//! Digest algorithms understood by the blob store.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, Read},
    path::Path,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

/// Map of algorithm to lowercase hex digest.
pub type Hashes = BTreeMap<HashAlgorithm, String>;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Length of the hex encoding produced by this algorithm.
    #[must_use]
    pub fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }

    #[must_use]
    pub fn is_valid_digest(self, digest: &str) -> bool {
        digest.len() == self.hex_len()
            && digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

/// Dedupe and sort a requested algorithm set; sha512 is always present since
/// it names objects on disk.
#[must_use]
pub fn normalize_algorithms(requested: &[HashAlgorithm]) -> Vec<HashAlgorithm> {
    let mut algorithms: Vec<HashAlgorithm> = requested.to_vec();
    algorithms.push(HashAlgorithm::Sha512);
    algorithms.sort();
    algorithms.dedup();
    algorithms
}

/// Incremental hasher feeding every configured algorithm from one stream.
#[derive(Clone, Default)]
pub struct MultiHasher {
    sha256: Option<Sha256>,
    sha512: Option<Sha512>,
    size: u64,
}

impl MultiHasher {
    #[must_use]
    pub fn new(algorithms: &[HashAlgorithm]) -> Self {
        let mut hasher = Self::default();
        for algorithm in algorithms {
            match algorithm {
                HashAlgorithm::Sha256 => hasher.sha256 = Some(Sha256::new()),
                HashAlgorithm::Sha512 => hasher.sha512 = Some(Sha512::new()),
            }
        }
        hasher
    }

    pub fn update(&mut self, bytes: &[u8]) {
        if let Some(sha256) = self.sha256.as_mut() {
            sha256.update(bytes);
        }
        if let Some(sha512) = self.sha512.as_mut() {
            sha512.update(bytes);
        }
        self.size += bytes.len() as u64;
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn finalize(self) -> (Hashes, u64) {
        let mut hashes = Hashes::new();
        if let Some(sha256) = self.sha256 {
            hashes.insert(HashAlgorithm::Sha256, hex::encode(sha256.finalize()));
        }
        if let Some(sha512) = self.sha512 {
            hashes.insert(HashAlgorithm::Sha512, hex::encode(sha512.finalize()));
        }
        (hashes, self.size)
    }
}

/// Hash a file on disk with every algorithm in `algorithms`.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn hash_file(path: &Path, algorithms: &[HashAlgorithm]) -> io::Result<(Hashes, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = MultiHasher::new(algorithms);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn normalize_always_includes_sha512() {
        assert_eq!(
            normalize_algorithms(&[HashAlgorithm::Sha256, HashAlgorithm::Sha256]),
            vec![HashAlgorithm::Sha256, HashAlgorithm::Sha512]
        );
        assert_eq!(normalize_algorithms(&[]), vec![HashAlgorithm::Sha512]);
    }

    #[test]
    fn parses_algorithm_names_case_insensitively() {
        assert_eq!(HashAlgorithm::from_str("SHA512").ok(), Some(HashAlgorithm::Sha512));
        assert_eq!(HashAlgorithm::Sha256.to_string(), "sha256");
        assert!(HashAlgorithm::from_str("md5").is_err());
    }

    #[test]
    fn multi_hasher_matches_one_shot_digests() {
        let mut hasher = MultiHasher::new(&[HashAlgorithm::Sha256, HashAlgorithm::Sha512]);
        hasher.update(b"hello ");
        hasher.update(b"world");
        let (hashes, size) = hasher.finalize();
        assert_eq!(size, 11);
        assert_eq!(
            hashes[&HashAlgorithm::Sha256],
            hex::encode(Sha256::digest(b"hello world"))
        );
        assert_eq!(
            hashes[&HashAlgorithm::Sha512],
            hex::encode(Sha512::digest(b"hello world"))
        );
    }

    #[test]
    fn digest_validation_rejects_paths_and_uppercase() {
        let good = hex::encode(Sha512::digest(b"x"));
        assert!(HashAlgorithm::Sha512.is_valid_digest(&good));
        assert!(!HashAlgorithm::Sha512.is_valid_digest(&good.to_uppercase()));
        assert!(!HashAlgorithm::Sha512.is_valid_digest("../../etc/passwd"));
        assert!(!HashAlgorithm::Sha256.is_valid_digest(&good));
    }
}
