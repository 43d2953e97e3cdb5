// Copyright 2026 Oxide Computer Company
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use blockverify_common::{verify_bail, VerifyError};

use crate::BlockDevice;

/// A RAM backed [`BlockDevice`] with switches for injecting faults.
#[derive(Debug)]
pub struct MemDevice {
    bytes: Mutex<Vec<u8>>,

    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    /// Flip the first byte of every read buffer.
    corrupt_reads: AtomicBool,
    discard_unsupported: AtomicBool,

    flushes: AtomicU64,
    discards: AtomicU64,
    invalidations: AtomicU64,
}

impl MemDevice {
    pub fn new(size: usize) -> Self {
        MemDevice {
            bytes: Mutex::new(vec![0; size]),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            corrupt_reads: AtomicBool::new(false),
            discard_unsupported: AtomicBool::new(false),
            flushes: AtomicU64::new(0),
            discards: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn set_fail_reads(&self, v: bool) {
        self.fail_reads.store(v, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, v: bool) {
        self.fail_writes.store(v, Ordering::SeqCst);
    }

    pub fn set_corrupt_reads(&self, v: bool) {
        self.corrupt_reads.store(v, Ordering::SeqCst);
    }

    pub fn set_discard_unsupported(&self, v: bool) {
        self.discard_unsupported.store(v, Ordering::SeqCst);
    }

    /// Invert `len` stored bytes starting at `offset`, as media corruption
    /// behind the writer's back would.
    pub fn corrupt(&self, offset: usize, len: usize) {
        let mut bytes = self.bytes.lock().unwrap();
        for b in &mut bytes[offset..offset + len] {
            *b = !*b;
        }
    }

    /// A copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn discards(&self) -> u64 {
        self.discards.load(Ordering::SeqCst)
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::SeqCst)
    }

    fn check_bounds(
        len: usize,
        offset: u64,
        n: usize,
    ) -> Result<usize, VerifyError> {
        let start = offset as usize;
        match start.checked_add(n) {
            Some(end) if end <= len => Ok(start),
            _ => verify_bail!(
                IoError,
                "{} bytes at {} is past the end of a {} byte device",
                n,
                offset,
                len
            ),
        }
    }
}

impl BlockDevice for MemDevice {
    fn size(&self) -> Result<u64, VerifyError> {
        Ok(self.bytes.lock().unwrap().len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), VerifyError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            verify_bail!(ReadError, "injected read error at {}", offset);
        }
        let bytes = self.bytes.lock().unwrap();
        let start = Self::check_bounds(bytes.len(), offset, buf.len())
            .map_err(|e| VerifyError::ReadError(e.to_string()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        if self.corrupt_reads.load(Ordering::SeqCst) && !buf.is_empty() {
            buf[0] = !buf[0];
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), VerifyError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            verify_bail!(WriteError, "injected write error at {}", offset);
        }
        let mut bytes = self.bytes.lock().unwrap();
        let start = Self::check_bounds(bytes.len(), offset, buf.len())
            .map_err(|e| VerifyError::WriteError(e.to_string()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn invalidate_cache(
        &self,
        offset: u64,
        len: u64,
    ) -> Result<(), VerifyError> {
        let bytes = self.bytes.lock().unwrap();
        Self::check_bounds(bytes.len(), offset, len as usize)?;
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn discard(&self, offset: u64, len: u64) -> Result<(), VerifyError> {
        if self.discard_unsupported.load(Ordering::SeqCst) {
            verify_bail!(Unsupported, "discard disabled on this device");
        }
        let mut bytes = self.bytes.lock().unwrap();
        let start = Self::check_bounds(bytes.len(), offset, len as usize)?;
        bytes[start..start + len as usize].fill(0);
        self.discards.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&self) -> Result<(), VerifyError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            verify_bail!(WriteError, "injected flush error");
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
