//! Download validation and artifact identity
//!
//! Every [`DownloadTask`](crate::download::DownloadTask) carries an ordered list of
//! [`Validator`]s. Each received chunk is fed to every validator via
//! [`Validator::update`]; once the full body has arrived the task calls
//! [`Validator::apply`], which fails with a [`ValidationError`] on mismatch when
//! the validator is enforced and only logs a warning otherwise.
//!
//! [`ArtifactHasher`] computes the full identity (size plus every supported
//! digest) of a file while it is being written.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Supported digest algorithms, declared strongest first
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// SHA-512
    Sha512,
    /// SHA-384
    Sha384,
    /// SHA-256
    Sha256,
    /// SHA-224
    Sha224,
    /// SHA-1
    Sha1,
    /// MD5
    Md5,
}

impl Algorithm {
    /// Every supported algorithm, strongest first
    pub const ALL: [Algorithm; 6] = [
        Algorithm::Sha512,
        Algorithm::Sha384,
        Algorithm::Sha256,
        Algorithm::Sha224,
        Algorithm::Sha1,
        Algorithm::Md5,
    ];

    /// Algorithms trusted to identify stored artifacts, strongest first
    pub const RELIABLE: [Algorithm; 3] = [Algorithm::Sha512, Algorithm::Sha384, Algorithm::Sha256];

    /// Lowercase algorithm name (also the database column name)
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha512 => "sha512",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha224 => "sha224",
            Algorithm::Sha1 => "sha1",
            Algorithm::Md5 => "md5",
        }
    }

    /// Whether the algorithm may be used to match an already stored artifact
    pub fn is_reliable(&self) -> bool {
        Self::RELIABLE.contains(self)
    }

    /// Start a streaming hash for this algorithm
    pub fn hasher(&self) -> Hasher {
        match self {
            Algorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
            Algorithm::Sha384 => Hasher::Sha384(sha2::Sha384::new()),
            Algorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            Algorithm::Sha224 => Hasher::Sha224(sha2::Sha224::new()),
            Algorithm::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            Algorithm::Md5 => Hasher::Md5(md5::Context::new()),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        Algorithm::ALL
            .into_iter()
            .find(|alg| alg.as_str() == name)
            .ok_or_else(|| ValidationError::UnsupportedAlgorithm(s.to_string()))
    }
}

/// Streaming hash state for one [`Algorithm`]
pub enum Hasher {
    /// SHA-512 state
    Sha512(sha2::Sha512),
    /// SHA-384 state
    Sha384(sha2::Sha384),
    /// SHA-256 state
    Sha256(sha2::Sha256),
    /// SHA-224 state
    Sha224(sha2::Sha224),
    /// SHA-1 state
    Sha1(sha1::Sha1),
    /// MD5 state
    Md5(md5::Context),
}

impl Hasher {
    /// Feed bytes into the hash
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha512(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha224(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Md5(h) => h.consume(data),
        }
    }

    /// Consume the state and return the lowercase hex digest
    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha512(h) => format!("{:x}", h.finalize()),
            Hasher::Sha384(h) => format!("{:x}", h.finalize()),
            Hasher::Sha256(h) => format!("{:x}", h.finalize()),
            Hasher::Sha224(h) => format!("{:x}", h.finalize()),
            Hasher::Sha1(h) => format!("{:x}", h.finalize()),
            Hasher::Md5(h) => format!("{:x}", h.compute()),
        }
    }
}

impl std::fmt::Debug for Hasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Hasher::Sha512(_) => "sha512",
            Hasher::Sha384(_) => "sha384",
            Hasher::Sha256(_) => "sha256",
            Hasher::Sha224(_) => "sha224",
            Hasher::Sha1(_) => "sha1",
            Hasher::Md5(_) => "md5",
        };
        f.debug_tuple("Hasher").field(&name).finish()
    }
}

/// Hex digests keyed by algorithm
pub type Digests = BTreeMap<Algorithm, String>;

/// Size and digests identifying one artifact
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactIdentity {
    /// Size in bytes
    pub size: u64,
    /// Every computed digest
    pub digests: Digests,
}

impl ArtifactIdentity {
    /// Digest for `algorithm`, if known
    pub fn digest(&self, algorithm: Algorithm) -> Option<&str> {
        self.digests.get(&algorithm).map(String::as_str)
    }

    /// Strongest reliable digest available
    pub fn strongest_reliable(&self) -> Option<(Algorithm, &str)> {
        Algorithm::RELIABLE
            .into_iter()
            .find_map(|alg| self.digest(alg).map(|hex| (alg, hex)))
    }
}

/// Computes the full [`ArtifactIdentity`] of a byte stream
#[derive(Debug)]
pub struct ArtifactHasher {
    size: u64,
    hashers: Vec<(Algorithm, Hasher)>,
}

impl Default for ArtifactHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactHasher {
    /// Hash with every supported algorithm
    pub fn new() -> Self {
        Self {
            size: 0,
            hashers: Algorithm::ALL
                .into_iter()
                .map(|alg| (alg, alg.hasher()))
                .collect(),
        }
    }

    /// Feed one chunk
    pub fn update(&mut self, data: &[u8]) {
        self.size += data.len() as u64;
        for (_, hasher) in &mut self.hashers {
            hasher.update(data);
        }
    }

    /// Number of bytes fed so far
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Finish every hash
    pub fn finish(self) -> ArtifactIdentity {
        ArtifactIdentity {
            size: self.size,
            digests: self
                .hashers
                .into_iter()
                .map(|(alg, hasher)| (alg, hasher.finalize_hex()))
                .collect(),
        }
    }
}

/// Per-download content verification
///
/// `update` is called once per received chunk, in order. `verify` is called once
/// after the full body arrived and compares the accumulated state with the
/// expected value. Callers normally go through [`Validator::apply`], which
/// honours [`Validator::is_enforced`].
pub trait Validator: Send + Sync {
    /// Accumulate state from one chunk
    fn update(&mut self, chunk: &[u8]);

    /// Compare the accumulated state with the expected value
    fn verify(&mut self) -> Result<(), ValidationError>;

    /// Discard accumulated state so the download can be attempted again
    fn reset(&mut self);

    /// A mismatch fails the download only when the validator is enforced
    fn is_enforced(&self) -> bool {
        true
    }

    /// Run [`verify`](Validator::verify), downgrading a mismatch to a warning
    /// when the validator is not enforced
    fn apply(&mut self) -> Result<(), ValidationError> {
        match self.verify() {
            Ok(()) => Ok(()),
            Err(e) if !self.is_enforced() => {
                tracing::warn!(error = %e, "validation failed (not enforced)");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Validates the number of received bytes
#[derive(Debug, Clone)]
pub struct SizeValidation {
    expected: u64,
    actual: u64,
    enforced: bool,
}

impl SizeValidation {
    /// Expect exactly `expected` bytes
    pub fn new(expected: u64) -> Self {
        Self {
            expected,
            actual: 0,
            enforced: true,
        }
    }

    /// Log instead of failing on mismatch
    pub fn not_enforced(mut self) -> Self {
        self.enforced = false;
        self
    }
}

impl Validator for SizeValidation {
    fn update(&mut self, chunk: &[u8]) {
        self.actual += chunk.len() as u64;
    }

    fn verify(&mut self) -> Result<(), ValidationError> {
        if self.actual == self.expected {
            Ok(())
        } else {
            Err(ValidationError::SizeMismatch {
                expected: self.expected,
                actual: self.actual,
            })
        }
    }

    fn reset(&mut self) {
        self.actual = 0;
    }

    fn is_enforced(&self) -> bool {
        self.enforced
    }
}

/// Validates a streaming digest against an expected hex value
#[derive(Debug)]
pub struct DigestValidation {
    algorithm: Algorithm,
    expected: String,
    hasher: Option<Hasher>,
    actual: Option<String>,
    enforced: bool,
}

impl DigestValidation {
    /// Validate with the algorithm named `algorithm`
    ///
    /// Fails with [`ValidationError::UnsupportedAlgorithm`] for unknown names.
    pub fn new(algorithm: &str, expected: impl Into<String>) -> Result<Self, ValidationError> {
        let algorithm = algorithm.parse::<Algorithm>()?;
        Ok(Self::with_algorithm(algorithm, expected))
    }

    /// Validate with a known algorithm
    pub fn with_algorithm(algorithm: Algorithm, expected: impl Into<String>) -> Self {
        Self {
            algorithm,
            expected: expected.into().to_ascii_lowercase(),
            hasher: Some(algorithm.hasher()),
            actual: None,
            enforced: true,
        }
    }

    /// Log instead of failing on mismatch
    pub fn not_enforced(mut self) -> Self {
        self.enforced = false;
        self
    }

    /// The algorithm in use
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }
}

impl Validator for DigestValidation {
    fn update(&mut self, chunk: &[u8]) {
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(chunk);
        }
    }

    fn verify(&mut self) -> Result<(), ValidationError> {
        if let Some(hasher) = self.hasher.take() {
            self.actual = Some(hasher.finalize_hex());
        }
        let actual = self.actual.clone().unwrap_or_default();
        if actual == self.expected {
            Ok(())
        } else {
            Err(ValidationError::DigestMismatch {
                algorithm: self.algorithm,
                expected: self.expected.clone(),
                actual,
            })
        }
    }

    fn reset(&mut self) {
        self.hasher = Some(self.algorithm.hasher());
        self.actual = None;
    }

    fn is_enforced(&self) -> bool {
        self.enforced
    }
}

/// Validators for an expected identity: size first, then each digest
pub fn validators_for(size: Option<u64>, digests: &Digests) -> Vec<Box<dyn Validator>> {
    let mut validators: Vec<Box<dyn Validator>> = Vec::with_capacity(digests.len() + 1);
    if let Some(size) = size {
        validators.push(Box::new(SizeValidation::new(size)));
    }
    for (algorithm, hex) in digests {
        validators.push(Box::new(DigestValidation::with_algorithm(
            *algorithm,
            hex.clone(),
        )));
    }
    validators
}
