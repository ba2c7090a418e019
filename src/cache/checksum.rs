use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Expected content digest of an archive, as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", content = "digest", rename_all = "lowercase")]
pub enum Checksum {
    Md5(String),
    Sha256(String),
}

impl Checksum {
    pub fn md5(hex: &str) -> Result<Self, String> {
        Ok(Self::Md5(normalize_hex(hex, 32, "md5")?))
    }

    pub fn sha256(hex: &str) -> Result<Self, String> {
        Ok(Self::Sha256(normalize_hex(hex, 64, "sha256")?))
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::Md5(_) => "md5",
            Self::Sha256(_) => "sha256",
        }
    }

    pub fn expected(&self) -> &str {
        match self {
            Self::Md5(hex) | Self::Sha256(hex) => hex,
        }
    }

    /// Hash `path` with this checksum's algorithm.
    pub fn digest_file(&self, path: &Path) -> std::io::Result<String> {
        match self {
            Self::Md5(_) => hash_file::<Md5>(path),
            Self::Sha256(_) => hash_file::<Sha256>(path),
        }
    }

    /// Whether `path` hashes to the expected digest.
    pub fn matches(&self, path: &Path) -> std::io::Result<bool> {
        Ok(self.digest_file(path)? == self.expected())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm(), self.expected())
    }
}

fn normalize_hex(raw: &str, len: usize, algorithm: &str) -> Result<String, String> {
    let hex = raw.trim().to_ascii_lowercase();
    if hex.len() != len || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(format!(
            "{algorithm} checksum must be {len} hex digits, got '{raw}'"
        ));
    }
    Ok(hex)
}

fn hash_file<D: Digest>(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = D::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}
