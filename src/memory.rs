//! Flat byte-addressed memory shared by the DSP cores and the host.
//!
//! Addresses are offsets into one contiguous space holding the proxy rings,
//! the per-core pools and every buffer handed out from them. Messages carry
//! these addresses, never pointers.

use crate::error::{Error, Result};
use bytemuck::Pod;
use spin::Mutex;

/// Byte space backing all pools.
#[derive(Debug)]
pub struct SharedMemory {
    bytes: Mutex<Vec<u8>>,
    len: u32,
}

impl SharedMemory {
    /// Zero-filled memory of `len` bytes.
    pub fn new(len: u32) -> Self {
        Self {
            bytes: Mutex::new(vec![0; len as usize]),
            len,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `out.len()` bytes starting at `addr` into `out`.
    pub fn read(&self, addr: u32, out: &mut [u8]) -> Result<()> {
        let range = self.range(addr, out.len() as u32)?;
        out.copy_from_slice(&self.bytes.lock()[range]);
        Ok(())
    }

    /// Write `data` at `addr`.
    pub fn write(&self, addr: u32, data: &[u8]) -> Result<()> {
        let range = self.range(addr, data.len() as u32)?;
        self.bytes.lock()[range].copy_from_slice(data);
        Ok(())
    }

    /// Move `len` bytes from `src` to `dst`; the ranges may overlap.
    pub fn copy(&self, dst: u32, src: u32, len: u32) -> Result<()> {
        let from = self.range(src, len)?;
        self.range(dst, len)?;
        self.bytes.lock().copy_within(from, dst as usize);
        Ok(())
    }

    pub fn fill(&self, addr: u32, len: u32, byte: u8) -> Result<()> {
        let range = self.range(addr, len)?;
        self.bytes.lock()[range].fill(byte);
        Ok(())
    }

    pub fn to_vec(&self, addr: u32, len: u32) -> Result<Vec<u8>> {
        let range = self.range(addr, len)?;
        Ok(self.bytes.lock()[range].to_vec())
    }

    /// Read a plain-old-data value stored at `addr`.
    pub fn read_pod<T: Pod>(&self, addr: u32) -> Result<T> {
        let mut value = T::zeroed();
        self.read(addr, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    pub fn write_pod<T: Pod>(&self, addr: u32, value: &T) -> Result<()> {
        self.write(addr, bytemuck::bytes_of(value))
    }

    fn range(&self, addr: u32, len: u32) -> Result<std::ops::Range<usize>> {
        let end = u64::from(addr) + u64::from(len);
        if end > u64::from(self.len) {
            return Err(Error::BadAddress { addr, len });
        }
        Ok(addr as usize..end as usize)
    }
}
