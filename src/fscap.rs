//! Filesystem capability boundary (base spec §9 design note): "any
//! reflinking or hardlinking filesystem will do." This module defines that
//! boundary as traits so the dedup sink (C5) and restore engine (C7) stay
//! independent of a particular OS/filesystem, with a `StdFilesystem`
//! reference implementation on top of `std::fs` + `nix` hardlink/stat
//! calls for POSIX-like targets.

use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsCapError {
    #[error("reflink not supported on this filesystem")]
    ReflinkUnsupported,
    #[error("io error on {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type FsCapResult<T> = Result<T, FsCapError>;

fn io_err(path: &Path, source: std::io::Error) -> FsCapError {
    FsCapError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The storage operations the dedup sink and restore engine need, kept
/// abstract so a non-POSIX backend (or a test double) can implement it.
pub trait BackupFileSystem: Send + Sync {
    /// Copy-on-write clone `src` to `dst`. Returns `ReflinkUnsupported` if
    /// the backing filesystem has no such facility; callers fall back to
    /// `hardlink` (§4.4 step 2).
    fn reflink(&self, src: &Path, dst: &Path) -> FsCapResult<()>;

    fn hardlink(&self, src: &Path, dst: &Path) -> FsCapResult<()>;

    /// Current hardlink count on `path` (`st_nlink`), used for the
    /// hardlink-count safety margin (§4.4 step 3).
    fn hardlink_count(&self, path: &Path) -> FsCapResult<u64>;

    fn copy_file(&self, src: &Path, dst: &Path) -> FsCapResult<u64>;

    fn remove_file(&self, path: &Path) -> FsCapResult<()>;

    fn rename(&self, from: &Path, to: &Path) -> FsCapResult<()>;

    fn create_dir_all(&self, path: &Path) -> FsCapResult<()>;

    fn exists(&self, path: &Path) -> bool;

    fn file_size(&self, path: &Path) -> FsCapResult<u64>;
}

/// Reference implementation over `std::fs`/`nix`, POSIX hardlinks only
/// (no reflink facility is exposed by stable `std`/`nix` without a
/// filesystem-specific ioctl, so `reflink` always reports unsupported
/// here; a production build would wrap `ioctl(FICLONE)` on btrfs/XFS).
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFilesystem;

impl BackupFileSystem for StdFilesystem {
    fn reflink(&self, _src: &Path, _dst: &Path) -> FsCapResult<()> {
        Err(FsCapError::ReflinkUnsupported)
    }

    fn hardlink(&self, src: &Path, dst: &Path) -> FsCapResult<()> {
        std::fs::hard_link(src, dst).map_err(|e| io_err(dst, e))
    }

    fn hardlink_count(&self, path: &Path) -> FsCapResult<u64> {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(path).map_err(|e| io_err(path, e))?;
        Ok(meta.nlink())
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> FsCapResult<u64> {
        std::fs::copy(src, dst).map_err(|e| io_err(dst, e))
    }

    fn remove_file(&self, path: &Path) -> FsCapResult<()> {
        std::fs::remove_file(path).map_err(|e| io_err(path, e))
    }

    fn rename(&self, from: &Path, to: &Path) -> FsCapResult<()> {
        std::fs::rename(from, to).map_err(|e| io_err(to, e))
    }

    fn create_dir_all(&self, path: &Path) -> FsCapResult<()> {
        std::fs::create_dir_all(path).map_err(|e| io_err(path, e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn file_size(&self, path: &Path) -> FsCapResult<u64> {
        std::fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| io_err(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn hardlink_and_count_roundtrip() {
        let dir = tempdir().unwrap();
        let fs = StdFilesystem;
        let src = dir.path().join("a");
        std::fs::File::create(&src).unwrap().write_all(b"x").unwrap();

        assert_eq!(fs.hardlink_count(&src).unwrap(), 1);
        let dst = dir.path().join("b");
        fs.hardlink(&src, &dst).unwrap();
        assert_eq!(fs.hardlink_count(&src).unwrap(), 2);
        assert_eq!(fs.hardlink_count(&dst).unwrap(), 2);
    }

    #[test]
    fn reflink_reports_unsupported() {
        let dir = tempdir().unwrap();
        let fs = StdFilesystem;
        let src = dir.path().join("a");
        std::fs::write(&src, b"x").unwrap();
        let dst = dir.path().join("b");
        match fs.reflink(&src, &dst) {
            Err(FsCapError::ReflinkUnsupported) => {}
            other => panic!("expected ReflinkUnsupported, got {:?}", other),
        }
    }
}
