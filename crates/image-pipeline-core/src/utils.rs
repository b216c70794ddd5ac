//! Utility functions and helpers

use crate::error::Result;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

/// File utilities
pub mod file {
    use super::*;

    /// Check if a file exists and is readable
    pub async fn is_file_accessible(path: &Path) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => tokio::fs::File::open(path).await.is_ok(),
            _ => false,
        }
    }

    /// Ensure a directory exists, creating it if necessary
    pub async fn ensure_directory_exists(path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    /// File stem as an owned string, `image` when the path has none
    pub fn stem_of(path: &Path) -> String {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "image".to_string())
    }
}

/// Path utilities
pub mod paths {
    use super::*;

    /// Lexically normalize a path, resolving `.` and `..` without touching
    /// the filesystem
    pub fn normalize(path: &Path) -> PathBuf {
        let mut normalized = PathBuf::new();
        for component in path.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    normalized.pop();
                }
                other => normalized.push(other.as_os_str()),
            }
        }
        normalized
    }

    /// True when `path` lies inside `root`
    pub fn is_within(path: &Path, root: &Path) -> bool {
        let root = normalize(root);
        if root.as_os_str().is_empty() {
            return false;
        }
        normalize(path).starts_with(&root)
    }

    /// `Some(path)` unless the path is unset or empty
    pub fn non_empty(path: Option<&PathBuf>) -> Option<&PathBuf> {
        path.filter(|p| !p.as_os_str().is_empty())
    }
}

/// Performance measurement utilities
pub mod performance {
    use super::*;

    /// Simple timer for measuring operation duration
    pub struct Timer {
        start: Instant,
        name: String,
    }

    impl Timer {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                start: Instant::now(),
                name: name.into(),
            }
        }

        pub fn elapsed(&self) -> Duration {
            self.start.elapsed()
        }

        pub fn elapsed_ms(&self) -> u128 {
            self.elapsed().as_millis()
        }
    }

    impl Drop for Timer {
        fn drop(&mut self) {
            tracing::debug!("{} took {}ms", self.name, self.elapsed_ms());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_is_within() {
        let root = Path::new("/data/generated");
        assert!(paths::is_within(Path::new("/data/generated/a.png"), root));
        assert!(paths::is_within(Path::new("/data/generated/./x/../b.png"), root));
        assert!(!paths::is_within(Path::new("/data/generated/../output/a.png"), root));
        assert!(!paths::is_within(Path::new("/data/generated-old/a.png"), root));
        assert!(!paths::is_within(Path::new("/data/a.png"), Path::new("")));
    }

    #[test]
    fn test_non_empty() {
        let empty = PathBuf::new();
        let set = PathBuf::from("/out");
        assert!(paths::non_empty(Some(&empty)).is_none());
        assert!(paths::non_empty(None).is_none());
        assert_eq!(paths::non_empty(Some(&set)), Some(&set));
    }

    #[test]
    fn test_stem_of() {
        assert_eq!(file::stem_of(Path::new("/a/b/photo.final.png")), "photo.final");
        assert_eq!(file::stem_of(Path::new("/")), "image");
    }

    #[tokio::test]
    async fn test_file_accessibility() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("a.png");
        assert!(!file::is_file_accessible(&file_path).await);
        assert!(!file::is_file_accessible(dir.path()).await);

        std::fs::write(&file_path, b"x").unwrap();
        assert!(file::is_file_accessible(&file_path).await);
    }

    #[tokio::test]
    async fn test_ensure_directory_exists() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("x").join("y");
        file::ensure_directory_exists(&nested).await.unwrap();
        assert!(nested.is_dir());
        file::ensure_directory_exists(&nested).await.unwrap();
    }

    #[test]
    fn test_timer() {
        let timer = performance::Timer::new("test");
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed_ms() >= 5);
    }
}
