//! Content-addressed digests and streaming integrity verification.
//!
//! A [`Digest`] is an algorithm tag plus a hex-encoded value whose length is
//! exactly what that algorithm produces. Validation is total: a `Digest`
//! value that exists has already been checked, so downstream code never
//! re-validates the shape of a digest it already holds.

use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn hex_len(self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(DigestError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// `Canonical` from the spec: the algorithm used when a manifest or config is
/// addressed without an explicit caller-chosen algorithm.
pub const CANONICAL: Algorithm = Algorithm::Sha256;

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("unknown digest algorithm {0:?}")]
    UnknownAlgorithm(String),
    #[error("malformed digest {0:?}")]
    Malformed(String),
    #[error("digest {digest} has hex length {got}, expected {want} for {algorithm}")]
    WrongLength {
        digest: String,
        algorithm: Algorithm,
        got: usize,
        want: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    pub fn new(algorithm: Algorithm, hex: impl Into<String>) -> Result<Self, DigestError> {
        let hex = hex.into();
        if hex.len() != algorithm.hex_len() {
            let got = hex.len();
            return Err(DigestError::WrongLength {
                digest: hex,
                algorithm,
                got,
                want: algorithm.hex_len(),
            });
        }
        if !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(DigestError::Malformed(hex));
        }
        Ok(Digest { algorithm, hex })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Compute the canonical (sha256) digest of an in-memory buffer.
    pub fn of_bytes(algorithm: Algorithm, data: impl AsRef<[u8]>) -> Digest {
        let mut d = Digester::new(algorithm);
        d.update(data.as_ref());
        d.finalize()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| DigestError::Malformed(s.to_string()))?;
        let algorithm: Algorithm = algo.parse()?;
        Digest::new(algorithm, hex)
    }
}

impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Streaming hash state. Feeding bytes never allocates beyond the hasher's
/// own fixed-size internal buffer.
pub enum Digester {
    Sha256(Box<Sha256>),
    Sha512(Box<Sha512>),
}

impl Digester {
    pub fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => Digester::Sha256(Box::new(Sha256::new())),
            Algorithm::Sha512 => Digester::Sha512(Box::new(Sha512::new())),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Digester::Sha256(h) => h.update(bytes),
            Digester::Sha512(h) => h.update(bytes),
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            Digester::Sha256(h) => {
                Digest::new(Algorithm::Sha256, hex::encode(h.finalize())).expect("hasher output matches algorithm length")
            }
            Digester::Sha512(h) => {
                Digest::new(Algorithm::Sha512, hex::encode(h.finalize())).expect("hasher output matches algorithm length")
            }
        }
    }
}

/// Constant-time equality between an expected digest and one just computed.
/// Both have already validated their hex alphabet, so the comparison is a
/// simple `subtle`-free loop over paired bytes instead of extra parsing.
pub fn verify(expected: &Digest, computed: &Digest) -> bool {
    if expected.algorithm != computed.algorithm || expected.hex.len() != computed.hex.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (a, b) in expected.hex.bytes().zip(computed.hex.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[derive(Debug, thiserror::Error)]
#[error("digest mismatch: expected {expected}, computed {computed}, after {bytes_read} bytes")]
pub struct DigestMismatch {
    pub expected: Digest,
    pub computed: Digest,
    pub bytes_read: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let s = "sha256:6c3c624b58dbbcd3c0dd82b4c53f04194d1247c6eebdaab7c610cf7d66709b3";
        let d: Digest = s.parse().unwrap();
        assert_eq!(d.to_string(), s);
        assert_eq!(d.algorithm(), Algorithm::Sha256);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("sha256:abcd".parse::<Digest>().is_err());
    }

    #[test]
    fn rejects_unknown_algorithm() {
        assert!("md5:abcd".parse::<Digest>().is_err());
    }

    #[test]
    fn rejects_uppercase_hex() {
        let hex = "A".repeat(64);
        assert!(format!("sha256:{hex}").parse::<Digest>().is_err());
    }

    #[test]
    fn verify_matches_and_mismatches() {
        let mut d = Digester::new(Algorithm::Sha256);
        d.update(b"abc");
        let computed = d.finalize();
        let expected: Digest = "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015"
            .parse()
            .unwrap();
        assert!(verify(&expected, &computed));

        let mut other = Digester::new(Algorithm::Sha256);
        other.update(b"abd");
        let other = other.finalize();
        assert!(!verify(&expected, &other));
    }

    #[test]
    fn of_bytes_matches_streamed() {
        let direct = Digest::of_bytes(Algorithm::Sha256, b"hello world");
        let mut d = Digester::new(Algorithm::Sha256);
        d.update(b"hello world");
        assert_eq!(direct, d.finalize());
    }
}
