//! File access for the sidecar HTTP surface.
//!
//! Relative paths resolve against the agent's working directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Maximum file size for read_file (10 MB).
/// Prevents memory exhaustion from reading huge files.
const MAX_READ_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("file '{path}' is too large ({size} bytes, max {max} bytes)")]
    TooLarge { path: PathBuf, size: u64, max: u64 },

    #[error("failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path, source: std::io::Error) -> FsError {
    if source.kind() == ErrorKind::NotFound {
        FsError::NotFound(path.to_path_buf())
    } else {
        FsError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Resolve `path` against `workdir` unless it is absolute.
pub fn resolve(workdir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}

/// Read a whole file. Files larger than 10MB are rejected.
pub async fn read_file(path: &Path) -> Result<Vec<u8>, FsError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| io_error(path, e))?;

    if metadata.len() > MAX_READ_SIZE {
        return Err(FsError::TooLarge {
            path: path.to_path_buf(),
            size: metadata.len(),
            max: MAX_READ_SIZE,
        });
    }

    tokio::fs::read(path).await.map_err(|e| io_error(path, e))
}

/// Write a file, creating parent directories as needed.
pub async fn write_file(path: &Path, content: &[u8]) -> Result<(), FsError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| io_error(path, e))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    /// Fresh scratch directory for one test.
    pub(crate) fn temp_dir() -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "testbed-agent-test-{}-{}",
            std::process::id(),
            n
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = temp_dir();
        let path = dir.join("nested/deeper/file.txt");
        write_file(&path, b"hello").await.unwrap();
        assert_eq!(read_file(&path).await.unwrap(), b"hello");
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let dir = temp_dir();
        let err = read_file(&dir.join("absent")).await.unwrap_err();
        assert!(matches!(err, FsError::NotFound(_)));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_resolve() {
        let workdir = Path::new("/testbed");
        assert_eq!(resolve(workdir, "src/a.py"), PathBuf::from("/testbed/src/a.py"));
        assert_eq!(resolve(workdir, "/etc/hosts"), PathBuf::from("/etc/hosts"));
    }
}
