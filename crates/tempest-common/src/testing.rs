//! Testing utilities and fixtures

use std::path::PathBuf;
use tempfile::TempDir;

/// Test context with automatic cleanup
pub struct TestContext {
    pub temp_dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.temp_dir.path().join("data")
    }

    pub fn path(&self) -> &std::path::Path {
        self.temp_dir.path()
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Test fixtures for common scenarios
pub mod fixtures {
    /// A page payload with every byte set to `fill`.
    pub fn page_fill(len: usize, fill: u8) -> Vec<u8> {
        vec![fill; len]
    }

    /// A deterministic page payload that varies by position and seed, so
    /// two pages built from different seeds never compare equal.
    pub fn stamped_page(len: usize, seed: u64) -> Vec<u8> {
        (0..len)
            .map(|i| (seed.wrapping_add(i as u64) % 251) as u8)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_cleanup_paths() {
        let ctx = TestContext::new();
        assert!(ctx.path().exists());
        assert!(ctx.data_dir().starts_with(ctx.path()));
    }

    #[test]
    fn test_stamped_pages_differ_by_seed() {
        let a = fixtures::stamped_page(64, 1);
        let b = fixtures::stamped_page(64, 2);
        assert_ne!(a, b);
        assert_eq!(a, fixtures::stamped_page(64, 1));
    }
}
