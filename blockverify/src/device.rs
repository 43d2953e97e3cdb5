// Copyright 2026 Oxide Computer Company
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use blockverify_common::{verify_bail, VerifyError};

/// Byte addressable access to the device under test.
///
/// Implementations are shared between all workers.  Callers never issue
/// overlapping I/O at the same time, so no locking is required for
/// correctness beyond what positioned reads and writes already give.
pub trait BlockDevice: Send + Sync + std::fmt::Debug {
    /// Size in bytes.
    fn size(&self) -> Result<u64, VerifyError>;

    /// Fill `buf` from `offset`.  A short read is an error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), VerifyError>;

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), VerifyError>;

    /// Ask that later reads of this range come from the device and not a
    /// cache.  Only a hint.
    fn invalidate_cache(&self, offset: u64, len: u64)
        -> Result<(), VerifyError>;

    /// Tell the device the range no longer holds data.  It must read back
    /// as zeroes afterwards.  `Unsupported` if the device can't.
    fn discard(&self, offset: u64, len: u64) -> Result<(), VerifyError>;

    /// Make every completed write durable.
    fn flush(&self) -> Result<(), VerifyError>;
}

/// A block device node or a regular file.
#[derive(Debug)]
pub struct FileDevice {
    path: PathBuf,
    file: File,
    size: u64,
}

impl FileDevice {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileDevice, VerifyError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                VerifyError::SetupError(format!("open {:?}: {}", path, e))
            })?;

        // Seeking to the end works for block devices, where the metadata
        // length is zero.
        let size = file.seek(SeekFrom::End(0)).map_err(|e| {
            VerifyError::SetupError(format!("size of {:?}: {}", path, e))
        })?;

        Ok(FileDevice {
            path: path.to_path_buf(),
            file,
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(target_os = "linux")]
fn unsupported_errno(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS)
    ) || e.kind() == io::ErrorKind::Unsupported
}

impl BlockDevice for FileDevice {
    fn size(&self) -> Result<u64, VerifyError> {
        Ok(self.size)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), VerifyError> {
        self.file.read_exact_at(buf, offset).map_err(|e| {
            VerifyError::ReadError(format!(
                "{} bytes at {}: {}",
                buf.len(),
                offset,
                e
            ))
        })
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), VerifyError> {
        self.file.write_all_at(buf, offset).map_err(|e| {
            VerifyError::WriteError(format!(
                "{} bytes at {}: {}",
                buf.len(),
                offset,
                e
            ))
        })
    }

    #[cfg(target_os = "linux")]
    fn invalidate_cache(
        &self,
        offset: u64,
        len: u64,
    ) -> Result<(), VerifyError> {
        use std::os::fd::AsRawFd;

        // posix_fadvise returns the error number rather than setting errno.
        let rc = unsafe {
            libc::posix_fadvise(
                self.file.as_raw_fd(),
                offset as libc::off_t,
                len as libc::off_t,
                libc::POSIX_FADV_DONTNEED,
            )
        };
        if rc != 0 {
            let e = io::Error::from_raw_os_error(rc);
            if unsupported_errno(&e) {
                verify_bail!(Unsupported, "fadvise: {}", e);
            }
            verify_bail!(IoError, "fadvise {} at {}: {}", len, offset, e);
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn invalidate_cache(
        &self,
        _offset: u64,
        _len: u64,
    ) -> Result<(), VerifyError> {
        verify_bail!(Unsupported, "cache invalidation on this platform");
    }

    #[cfg(target_os = "linux")]
    fn discard(&self, offset: u64, len: u64) -> Result<(), VerifyError> {
        use std::os::fd::AsRawFd;

        let rc = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if rc != 0 {
            let e = io::Error::last_os_error();
            if unsupported_errno(&e) {
                verify_bail!(
                    Unsupported,
                    "punch hole on {:?}: {}",
                    self.path,
                    e
                );
            }
            verify_bail!(WriteError, "punch hole {} at {}: {}", len, offset, e);
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn discard(&self, _offset: u64, _len: u64) -> Result<(), VerifyError> {
        verify_bail!(Unsupported, "discard on this platform");
    }

    fn flush(&self) -> Result<(), VerifyError> {
        self.file.sync_data().map_err(|e| {
            VerifyError::WriteError(format!("fdatasync {:?}: {}", self.path, e))
        })
    }
}
