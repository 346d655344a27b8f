//! SHA-512 payload verification.

use sha2::{Digest, Sha512};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{error, info, instrument, warn};

use skyward_common::TimedOperation;

use super::error::{Result, UpdateError};

const BUFFER_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-512 of a file, streamed in 64 KiB chunks.
pub async fn sha512_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha512::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Whether the file's digest equals `expected_hex` (case-insensitive).
pub async fn verify(path: &Path, expected_hex: &str) -> std::io::Result<bool> {
    let actual = sha512_file(path).await?;
    Ok(actual.eq_ignore_ascii_case(expected_hex.trim()))
}

/// Verify a payload, removing it on mismatch.
#[instrument(skip(expected_hex), fields(path = %path.display()))]
pub async fn verify_or_discard(path: &Path, expected_hex: &str) -> Result<()> {
    let timer = TimedOperation::start("verify_payload");
    let actual = sha512_file(path)
        .await
        .map_err(|e| UpdateError::Disk(format!("failed to read {}: {}", path.display(), e)))?;
    timer.finish();

    let expected = expected_hex.trim().to_ascii_lowercase();
    if actual == expected {
        info!("Payload digest verified");
        return Ok(());
    }

    error!(expected = %expected, actual = %actual, "Payload digest mismatch");
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(error = %e, "Failed to remove payload after digest mismatch");
    }
    Err(UpdateError::IntegrityMismatch { expected, actual })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const HELLO_SHA512: &str = "9b71d224bd62f3785d96d46ad3ea3d73319bfbc2890caadae2dff72519673ca7\
2323c3d99ba5c11d7c7acc6e14b8c5da0c4663475c2e5c3adef46f73bcdec043";

    fn temp_with(content: &[u8]) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), content).unwrap();
        file
    }

    #[tokio::test]
    async fn test_known_digest() {
        let file = temp_with(b"hello");
        assert_eq!(sha512_file(file.path()).await.unwrap(), HELLO_SHA512);
    }

    #[tokio::test]
    async fn test_verify_is_case_insensitive_and_idempotent() {
        let file = temp_with(b"hello");
        let upper = HELLO_SHA512.to_uppercase();
        assert!(verify(file.path(), &upper).await.unwrap());
        assert!(verify(file.path(), HELLO_SHA512).await.unwrap());
        assert!(verify(file.path(), HELLO_SHA512).await.unwrap());
    }

    #[tokio::test]
    async fn test_flipped_byte_fails() {
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let file = temp_with(&content);
        let digest = sha512_file(file.path()).await.unwrap();
        assert!(verify(file.path(), &digest).await.unwrap());

        let mut flipped = content.clone();
        flipped[150_000] ^= 0x01;
        std::fs::write(file.path(), &flipped).unwrap();
        assert!(!verify(file.path(), &digest).await.unwrap());
    }

    #[tokio::test]
    async fn test_mismatch_discards_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.zip");
        std::fs::write(&path, b"hello").unwrap();

        let err = verify_or_discard(&path, &"0".repeat(128)).await.unwrap_err();
        assert!(matches!(err, UpdateError::IntegrityMismatch { .. }));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_match_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.zip");
        std::fs::write(&path, b"hello").unwrap();

        verify_or_discard(&path, HELLO_SHA512).await.unwrap();
        assert!(path.exists());
    }
}
