//! WASM linear memory management.
//!
//! Byte buffer plus page accounting for one memory instance. Addresses are
//! effective addresses (`base + offset`) computed in 64-bit arithmetic, so an
//! address past the end of a 32-bit memory is an ordinary bounds failure
//! rather than a wrap-around.

use alloc::vec::Vec;

use crate::interpreter::{Trap, TrapKind};
use crate::types::MemoryType;

/// Page size in bytes (64 KB).
pub const PAGE_SIZE: usize = 65536;

/// Maximum memory size in pages (4 GiB).
pub const MAX_PAGES: u32 = 65536;

fn out_of_bounds() -> Trap {
    Trap::new(TrapKind::OutOfBoundsMemoryAccess)
}

/// Linear memory for a WASM instance.
#[derive(Debug, Clone)]
pub struct LinearMemory {
    /// Memory data.
    data: Vec<u8>,

    /// Current size in pages.
    current_pages: u32,

    /// Maximum size in pages (if specified).
    max_pages: Option<u32>,

    /// Host-imposed ceiling, never above [`MAX_PAGES`].
    limit_pages: u32,

    shared: bool,
}

impl LinearMemory {
    /// Allocate a memory of `ty.limits.min` pages. `None` when the initial
    /// size exceeds `limit_pages`.
    pub fn new(ty: MemoryType, limit_pages: u32) -> Option<Self> {
        let limit_pages = limit_pages.min(MAX_PAGES);
        let initial = ty.limits.min;
        if initial > limit_pages {
            return None;
        }
        let mut data = Vec::new();
        data.try_reserve_exact(initial as usize * PAGE_SIZE).ok()?;
        data.resize(initial as usize * PAGE_SIZE, 0);

        Some(LinearMemory {
            data,
            current_pages: initial,
            max_pages: ty.limits.max,
            limit_pages,
            shared: ty.shared,
        })
    }

    /// Current type: the declared maximum with the current size as minimum.
    pub fn ty(&self) -> MemoryType {
        MemoryType {
            limits: crate::types::Limits::new(self.current_pages, self.max_pages),
            shared: self.shared,
        }
    }

    /// Get the current size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get the current size in pages.
    pub fn pages(&self) -> u32 {
        self.current_pages
    }

    /// Get the maximum size in pages.
    pub fn max_pages(&self) -> Option<u32> {
        self.max_pages
    }

    /// Grow memory by the specified number of pages.
    ///
    /// Returns the previous size in pages, or `None` when the declared
    /// maximum, the host limit, or the allocator refuses.
    pub fn grow(&mut self, delta_pages: u32) -> Option<u32> {
        let new_pages = self.current_pages.checked_add(delta_pages)?;
        let ceiling = self.max_pages.unwrap_or(MAX_PAGES).min(self.limit_pages);
        if new_pages > ceiling {
            return None;
        }

        let new_size = new_pages as usize * PAGE_SIZE;
        self.data
            .try_reserve_exact(new_size - self.data.len())
            .ok()?;
        let old_pages = self.current_pages;
        self.data.resize(new_size, 0);
        self.current_pages = new_pages;

        Some(old_pages)
    }

    /// Byte range `[addr, addr + len)`, or an out-of-bounds trap.
    fn range(&self, addr: u64, len: u64) -> Result<core::ops::Range<usize>, Trap> {
        let end = addr.checked_add(len).ok_or_else(out_of_bounds)?;
        if end > self.data.len() as u64 {
            return Err(out_of_bounds());
        }
        Ok(addr as usize..end as usize)
    }

    /// Read `N` bytes at an effective address.
    pub fn load<const N: usize>(&self, addr: u64) -> Result<[u8; N], Trap> {
        let range = self.range(addr, N as u64)?;
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.data[range]);
        Ok(bytes)
    }

    /// Write `N` bytes at an effective address.
    pub fn store<const N: usize>(&mut self, addr: u64, bytes: [u8; N]) -> Result<(), Trap> {
        let range = self.range(addr, N as u64)?;
        self.data[range].copy_from_slice(&bytes);
        Ok(())
    }

    /// Read a byte from memory.
    pub fn read_u8(&self, addr: u64) -> Result<u8, Trap> {
        self.load::<1>(addr).map(|b| b[0])
    }

    /// Read a u32 from memory (little-endian).
    pub fn read_u32(&self, addr: u64) -> Result<u32, Trap> {
        self.load(addr).map(u32::from_le_bytes)
    }

    /// Read a u64 from memory (little-endian).
    pub fn read_u64(&self, addr: u64) -> Result<u64, Trap> {
        self.load(addr).map(u64::from_le_bytes)
    }

    /// Write a u32 to memory (little-endian).
    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), Trap> {
        self.store(addr, value.to_le_bytes())
    }

    /// Read bytes from memory.
    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<&[u8], Trap> {
        let range = self.range(addr, len as u64)?;
        Ok(&self.data[range])
    }

    /// Write bytes to memory.
    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<(), Trap> {
        let range = self.range(addr, bytes.len() as u64)?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// `memory.fill`.
    pub fn fill(&mut self, addr: u64, len: u64, value: u8) -> Result<(), Trap> {
        let range = self.range(addr, len)?;
        self.data[range].fill(value);
        Ok(())
    }

    /// `memory.copy` within one memory; overlapping ranges behave like memmove.
    pub fn copy_within(&mut self, src: u64, dst: u64, len: u64) -> Result<(), Trap> {
        let src = self.range(src, len)?;
        let dst = self.range(dst, len)?;
        self.data.copy_within(src, dst.start);
        Ok(())
    }

    /// `memory.init`: copy `len` bytes of `segment` starting at `src`.
    pub fn init(&mut self, dst: u64, segment: &[u8], src: u64, len: u64) -> Result<(), Trap> {
        let src_end = src.checked_add(len).ok_or_else(out_of_bounds)?;
        if src_end > segment.len() as u64 {
            return Err(out_of_bounds());
        }
        let dst = self.range(dst, len)?;
        self.data[dst].copy_from_slice(&segment[src as usize..src_end as usize]);
        Ok(())
    }

    /// Whole memory contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// `memory.copy` between two distinct memories.
pub fn copy_between(
    dst_mem: &mut LinearMemory,
    dst: u64,
    src_mem: &LinearMemory,
    src: u64,
    len: u64,
) -> Result<(), Trap> {
    let src = src_mem.range(src, len)?;
    let dst = dst_mem.range(dst, len)?;
    dst_mem.data[dst].copy_from_slice(&src_mem.data[src]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Limits;

    fn memory(min: u32, max: Option<u32>) -> LinearMemory {
        LinearMemory::new(
            MemoryType {
                limits: Limits::new(min, max),
                shared: false,
            },
            MAX_PAGES,
        )
        .unwrap()
    }

    #[test]
    fn test_memory_new() {
        let mem = memory(1, Some(10));
        assert_eq!(mem.pages(), 1);
        assert_eq!(mem.size(), PAGE_SIZE);
        assert_eq!(mem.max_pages(), Some(10));
    }

    #[test]
    fn test_memory_new_over_host_limit() {
        let ty = MemoryType {
            limits: Limits::new(4, None),
            shared: false,
        };
        assert!(LinearMemory::new(ty, 3).is_none());
    }

    #[test]
    fn test_memory_read_write() {
        let mut mem = memory(1, None);
        mem.write_u32(0, 0x1234_5678).unwrap();
        assert_eq!(mem.read_u32(0).unwrap(), 0x1234_5678);
        assert_eq!(mem.read_u8(0).unwrap(), 0x78);
        mem.store(8, 0xDEAD_BEEF_CAFE_BABEu64.to_le_bytes()).unwrap();
        assert_eq!(mem.read_u64(8).unwrap(), 0xDEAD_BEEF_CAFE_BABE);
    }

    #[test]
    fn test_memory_bounds() {
        let mem = memory(1, None);
        assert!(mem.read_u32(PAGE_SIZE as u64 - 4).is_ok());
        let err = mem.read_u32(PAGE_SIZE as u64 - 3).unwrap_err();
        assert_eq!(err.kind, TrapKind::OutOfBoundsMemoryAccess);
        assert!(mem.read_u32(u64::MAX - 1).is_err());
        // Zero-length access at the end is in bounds.
        assert!(mem.read_bytes(PAGE_SIZE as u64, 0).is_ok());
        assert!(mem.read_bytes(PAGE_SIZE as u64 + 1, 0).is_err());
    }

    #[test]
    fn test_memory_grow() {
        let mut mem = memory(1, Some(3));
        assert_eq!(mem.grow(1), Some(1));
        assert_eq!(mem.pages(), 2);
        assert_eq!(mem.grow(2), None);
        assert_eq!(mem.pages(), 2);
        assert_eq!(mem.grow(0), Some(2));
    }

    #[test]
    fn test_memory_grow_respects_host_limit() {
        let mut mem = LinearMemory::new(
            MemoryType {
                limits: Limits::new(1, None),
                shared: false,
            },
            2,
        )
        .unwrap();
        assert_eq!(mem.grow(1), Some(1));
        assert_eq!(mem.grow(1), None);
    }

    #[test]
    fn test_memory_copy_overlapping() {
        let mut mem = memory(1, None);
        mem.write_bytes(0, &[1, 2, 3, 4]).unwrap();
        mem.copy_within(0, 1, 4).unwrap();
        assert_eq!(mem.read_bytes(0, 5).unwrap(), &[1, 1, 2, 3, 4]);
    }

    #[test]
    fn test_memory_init_checks_segment() {
        let mut mem = memory(1, None);
        mem.init(10, &[7, 8, 9], 1, 2).unwrap();
        assert_eq!(mem.read_bytes(10, 2).unwrap(), &[8, 9]);
        assert!(mem.init(10, &[7, 8, 9], 2, 2).is_err());
        assert!(mem.init(0, &[], 0, 0).is_ok());
    }
}
