//! File access used by the manager

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::kdb3::error::Result;
use crate::kdb3::progress::{Outcome, Ticker};

/// Whole-file operations the manager needs from the platform.
pub trait FileIo {
    fn load_binary(&self, path: &Path) -> Result<Vec<u8>>;

    /// Replaces `path` with `data` without ever leaving a half written file
    /// at `path`.
    fn save_binary(&self, path: &Path, data: &[u8]) -> Result<()>;

    fn delete(&self, path: &Path) -> Result<()>;

    fn file_size(&self, path: &Path) -> Result<u64>;

    fn exists(&self, path: &Path) -> bool;

    /// SHA-256 of the file, read `chunk_size` bytes at a time.
    fn content_hash(&self, path: &Path, chunk_size: usize, ticker: &mut Ticker) -> Result<Outcome<[u8; 32]>>;
}


/// [`FileIo`] over the local file system.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsIo;

// Sibling of `path` the new content is written to before the rename
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

impl FileIo for FsIo {
    fn load_binary(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    fn save_binary(&self, path: &Path, data: &[u8]) -> Result<()> {
        let tmp = temp_path(path);
        let written = File::create(&tmp).and_then(|mut f| {
            f.write_all(data)?;
            f.sync_all()
        });
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }

        // rename replaces the old file in one step
        if let Err(err) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        tracing::debug!("Wrote {} bytes to {:?}", data.len(), path);
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_file(path)?)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn content_hash(&self, path: &Path, chunk_size: usize, ticker: &mut Ticker) -> Result<Outcome<[u8; 32]>> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        let chunk_size = chunk_size.max(1);
        ticker.next_step(size.div_ceil(chunk_size as u64), "hash key file");

        let mut hasher = Sha256::new();
        let mut buf = Zeroizing::new(vec![0u8; chunk_size]);
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            if ticker.tick().is_canceled() {
                return Ok(Outcome::Canceled);
            }
        }
        Ok(Outcome::Done(hasher.finalize().into()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdb3::crypto::sha256;
    use crate::kdb3::progress::tests::CancelAfter;

    #[test]
    fn test_save_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.kdb");
        let io = FsIo;

        io.save_binary(&path, b"first").unwrap();
        io.save_binary(&path, b"second version").unwrap();
        assert_eq!(io.load_binary(&path).unwrap(), b"second version");
        assert_eq!(io.file_size(&path).unwrap(), 14);
        assert!(!io.exists(&temp_path(&path)));

        io.delete(&path).unwrap();
        assert!(!io.exists(&path));
        assert!(io.load_binary(&path).is_err());
    }

    #[test]
    fn test_temp_path_is_sibling() {
        assert_eq!(temp_path(Path::new("/a/b/db.kdb")), PathBuf::from("/a/b/db.kdb.tmp"));
    }

    #[test]
    fn test_streaming_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.bin");
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();

        let hash = FsIo.content_hash(&path, 2048, &mut Ticker::none()).unwrap().done().unwrap();
        assert_eq!(hash, sha256(&data));

        let mut cancel = CancelAfter::new(2);
        let out = FsIo.content_hash(&path, 2048, &mut Ticker::new(Some(&mut cancel))).unwrap();
        assert!(out.is_canceled());
        assert_eq!(cancel.ticks, 2);
    }
}
