use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::ChatResult;

const CHUNK_SIZE: usize = 64 * 1024;

pub type Fingerprint = [u8; 32];

/// What `check_changed` does with the stored fingerprint after a successful read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPolicy {
    /// Compare only; the fingerprint taken at construction stays the baseline
    #[default]
    KeepBaseline,
    /// Adopt the new fingerprint, so each change is reported once
    RefreshOnCheck,
}

/// Tracks the fingerprint of a single file, so derived data such as
/// embeddings can be rebuilt when its bytes change.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    path: PathBuf,
    fingerprint: Fingerprint,
    policy: RefreshPolicy,
}

impl ChangeDetector {
    /// Fingerprint `path` now. Fails if the file cannot be read.
    pub async fn new(path: impl Into<PathBuf>, policy: RefreshPolicy) -> ChatResult<Self> {
        let path = path.into();
        let fingerprint = fingerprint(&path).await?;
        Ok(Self {
            path,
            fingerprint,
            policy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Recompute the fingerprint and compare.
    ///
    /// An unreadable file reports `false`: a read failure is never treated as
    /// a change, so this must not gate anything security-sensitive.
    pub async fn check_changed(&mut self) -> bool {
        let current = match fingerprint(&self.path).await {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!("change check skipped for {}: {e}", self.path.display());
                return false;
            }
        };
        let changed = current != self.fingerprint;
        if self.policy == RefreshPolicy::RefreshOnCheck {
            self.fingerprint = current;
        }
        changed
    }

    /// Adopt the file's current fingerprint as the new baseline.
    pub async fn refresh(&mut self) -> ChatResult<()> {
        self.fingerprint = fingerprint(&self.path).await?;
        Ok(())
    }

    /// Make `bytes`, already read from the file, the new baseline. A write
    /// that lands after that read is still reported by the next check.
    pub fn adopt(&mut self, bytes: &[u8]) {
        self.fingerprint = fingerprint_bytes(bytes);
    }
}

pub fn fingerprint_bytes(bytes: &[u8]) -> Fingerprint {
    Sha256::digest(bytes).into()
}

/// Stream `path` through SHA-256 in bounded chunks.
pub async fn fingerprint(path: &Path) -> ChatResult<Fingerprint> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write(path: &Path, content: &[u8]) {
        tokio::fs::write(path, content).await.unwrap();
    }

    #[tokio::test]
    async fn unchanged_file_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        write(&path, b"fn main() {}").await;

        let mut detector = ChangeDetector::new(&path, RefreshPolicy::default())
            .await
            .unwrap();
        assert!(!detector.check_changed().await);
        assert!(!detector.check_changed().await);
    }

    #[tokio::test]
    async fn modified_file_reports_true() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        write(&path, b"fn main() {}").await;

        let mut detector = ChangeDetector::new(&path, RefreshPolicy::KeepBaseline)
            .await
            .unwrap();
        write(&path, b"fn main() { println!(); }").await;
        assert!(detector.check_changed().await);
        // baseline kept, so it keeps reporting the change
        assert!(detector.check_changed().await);
    }

    #[tokio::test]
    async fn refresh_on_check_reports_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        write(&path, b"one").await;

        let mut detector = ChangeDetector::new(&path, RefreshPolicy::RefreshOnCheck)
            .await
            .unwrap();
        write(&path, b"two").await;
        assert!(detector.check_changed().await);
        assert!(!detector.check_changed().await);
    }

    #[tokio::test]
    async fn unreadable_file_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        write(&path, b"content").await;

        let mut detector = ChangeDetector::new(&path, RefreshPolicy::default())
            .await
            .unwrap();
        tokio::fs::remove_file(&path).await.unwrap();
        assert!(!detector.check_changed().await);
    }

    #[tokio::test]
    async fn explicit_refresh_moves_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        write(&path, b"one").await;

        let mut detector = ChangeDetector::new(&path, RefreshPolicy::KeepBaseline)
            .await
            .unwrap();
        write(&path, b"two").await;
        detector.refresh().await.unwrap();
        assert!(!detector.check_changed().await);
    }

    #[tokio::test]
    async fn adopted_bytes_become_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        write(&path, b"one").await;

        let mut detector = ChangeDetector::new(&path, RefreshPolicy::KeepBaseline)
            .await
            .unwrap();
        write(&path, b"two").await;
        let read = tokio::fs::read(&path).await.unwrap();
        // the file moves on after it was read
        write(&path, b"three").await;

        detector.adopt(&read);
        assert_eq!(detector.fingerprint(), &fingerprint_bytes(b"two"));
        assert!(detector.check_changed().await);

        write(&path, b"two").await;
        assert!(!detector.check_changed().await);
    }

    #[tokio::test]
    async fn streamed_and_in_memory_fingerprints_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let content: Vec<u8> = (0..CHUNK_SIZE * 2 + 5).map(|i| (i % 251) as u8).collect();
        write(&path, &content).await;
        assert_eq!(fingerprint(&path).await.unwrap(), fingerprint_bytes(&content));
    }

    #[tokio::test]
    async fn missing_file_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let result = ChangeDetector::new(dir.path().join("nope"), RefreshPolicy::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn large_file_spanning_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let mut content = vec![7u8; CHUNK_SIZE * 3 + 17];
        write(&path, &content).await;

        let mut detector = ChangeDetector::new(&path, RefreshPolicy::default())
            .await
            .unwrap();
        *content.last_mut().unwrap() = 8;
        write(&path, &content).await;
        assert!(detector.check_changed().await);
    }
}
