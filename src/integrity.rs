use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use md5::Md5;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::{DigestAlgorithm, ExpectedDigest, VerificationResult};

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Compute the digest of a file asynchronously, reading it once.
pub async fn digest_file(path: &Path, algorithm: DigestAlgorithm) -> Result<Vec<u8>, IntegrityError> {
    match algorithm {
        DigestAlgorithm::Md5 => hash_file::<Md5>(path).await,
        DigestAlgorithm::Sha256 => hash_file::<Sha256>(path).await,
    }
}

async fn hash_file<D: Digest>(path: &Path) -> Result<Vec<u8>, IntegrityError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = D::new();
    let mut buffer = [0u8; 1024 * 8];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 { break; }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

/// Compare the file at `path` against `expected`.
///
/// The file is only read. Deciding what to do with a mismatched file is up to
/// the caller.
pub async fn verify(path: &Path, expected: Option<&ExpectedDigest>) -> Result<VerificationResult, IntegrityError> {
    let Some(expected) = expected else {
        return Ok(VerificationResult::Skipped);
    };
    let actual = digest_file(path, expected.algorithm).await?;
    if actual == expected.bytes {
        Ok(VerificationResult::Verified)
    } else {
        Ok(VerificationResult::Mismatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_fixture(contents: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.bin");
        tokio::fs::write(&path, contents).await.unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn known_digests() {
        let (_dir, path) = write_fixture(b"hello world").await;
        let md5 = digest_file(&path, DigestAlgorithm::Md5).await.unwrap();
        assert_eq!(hex::encode(&md5), "5eb63bbbe01eeed093cb22bb8f5acdc3");
        let sha = digest_file(&path, DigestAlgorithm::Sha256).await.unwrap();
        assert_eq!(
            hex::encode(&sha),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn verified_and_mismatched() {
        let contents = vec![7u8; 20_000];
        let (_dir, path) = write_fixture(&contents).await;

        let good = ExpectedDigest::sha256(Sha256::digest(&contents).to_vec());
        assert_eq!(verify(&path, Some(&good)).await.unwrap(), VerificationResult::Verified);

        let bad = ExpectedDigest::md5(vec![0u8; 16]);
        assert_eq!(verify(&path, Some(&bad)).await.unwrap(), VerificationResult::Mismatched);

        // The file is left alone either way.
        assert_eq!(tokio::fs::read(&path).await.unwrap(), contents);
    }

    #[tokio::test]
    async fn skipped_without_expected_digest() {
        let (_dir, path) = write_fixture(b"abc").await;
        assert_eq!(verify(&path, None).await.unwrap(), VerificationResult::Skipped);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let expected = ExpectedDigest::md5(vec![0u8; 16]);
        let err = verify(&dir.path().join("nope"), Some(&expected)).await.unwrap_err();
        assert!(matches!(err, IntegrityError::Io(_)));
    }
}
