// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::io::Write;
use std::path::Path;

/// Name of the per-database file recording the current segment set per level
pub const APPENDIX_FILE: &str = "appendix";

/// Flushes a directory's metadata, making freshly created or renamed files
/// inside it durable.
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let file = std::fs::File::open(path)?;
        file.sync_all()?;
    }

    // Directory handles cannot be fsynced on Windows
    #[cfg(not(unix))]
    {
        let _ = path;
    }

    Ok(())
}

/// Atomically rewrites a file: the old content stays intact until the
/// replacement is durable.
pub fn rewrite_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let folder = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file_mut().sync_all()?;
    temp_file.persist(path)?;

    fsync_directory(folder)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn rewrite_atomic_replaces_content() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("target");

        std::fs::write(&path, b"before")?;
        rewrite_atomic(&path, b"after")?;

        assert_eq!(b"after", &std::fs::read(&path)?[..]);
        Ok(())
    }

    #[test]
    fn rewrite_atomic_creates_file() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fresh");

        rewrite_atomic(&path, b"content")?;
        assert_eq!(b"content", &std::fs::read(&path)?[..]);
        Ok(())
    }
}
