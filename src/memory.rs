//! DMA memory model
//!
//! The UHCI controller only understands 32-bit physical addresses, while the
//! driver works through virtual pointers. The two address spaces get their own
//! newtypes and are only ever related through [`DmaRegion::translate`] (or the
//! allocator's [`DmaAllocator::physical_address`]), so an address from one
//! space can never be handed to the other by accident.

use core::fmt;
use core::ptr;

/// A physical address as seen by a 32-bit bus master
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check that the address has the given power-of-two alignment
    pub const fn is_aligned(self, align: u32) -> bool {
        self.0 & (align - 1) == 0
    }

    /// The address `bytes` further into the same physical block
    pub const fn add(self, bytes: u32) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

/// A CPU-addressable (virtual) address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

/// A physically contiguous, CPU-addressable block of DMA memory
#[derive(Debug, Clone, Copy)]
pub struct DmaRegion {
    virt: VirtAddr,
    phys: PhysAddr,
    len: usize,
}

impl DmaRegion {
    /// Describe an already allocated region
    ///
    /// # Safety
    ///
    /// `virt` must point to `len` bytes of memory that stay valid (and are not
    /// used for anything else) for as long as the region is used, and the
    /// memory must be physically contiguous starting at `phys`.
    pub unsafe fn from_raw(virt: VirtAddr, phys: PhysAddr, len: usize) -> Self {
        Self { virt, phys, len }
    }

    pub fn virt(&self) -> VirtAddr {
        self.virt
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Virtual address of the byte at `offset`
    pub fn virt_at(&self, offset: usize) -> Option<VirtAddr> {
        (offset < self.len).then(|| VirtAddr(self.virt.0 + offset))
    }

    /// Physical address of the byte at `offset`
    pub fn phys_at(&self, offset: usize) -> Option<PhysAddr> {
        if offset >= self.len {
            return None;
        }
        self.phys.0.checked_add(offset as u32).map(PhysAddr)
    }

    /// Translate a virtual address inside this region to its physical address
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let offset = virt.0.checked_sub(self.virt.0)?;
        self.phys_at(offset)
    }

    /// Check that `len` bytes starting at `virt` lie entirely in the region
    pub fn contains(&self, virt: VirtAddr, len: usize) -> bool {
        match virt.0.checked_sub(self.virt.0) {
            Some(offset) => offset.checked_add(len).is_some_and(|end| end <= self.len),
            None => false,
        }
    }

    /// Fill `len` bytes at `offset` with `value`
    pub fn fill(&self, offset: usize, value: u8, len: usize) {
        let len = len.min(self.len.saturating_sub(offset));
        if len == 0 {
            return;
        }
        unsafe { ptr::write_bytes(self.virt.as_mut_ptr::<u8>().add(offset), value, len) };
    }

    /// Copy `data` into the region at `offset`, returning the bytes copied
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> usize {
        let len = data.len().min(self.len.saturating_sub(offset));
        if len == 0 {
            return 0;
        }
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.virt.as_mut_ptr::<u8>().add(offset), len)
        };
        len
    }

    /// Copy bytes out of the region at `offset`, returning the bytes copied
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> usize {
        let len = out.len().min(self.len.saturating_sub(offset));
        if len == 0 {
            return 0;
        }
        unsafe { ptr::copy_nonoverlapping(self.virt.as_ptr::<u8>().add(offset), out.as_mut_ptr(), len) };
        len
    }
}

/// Source of DMA-capable memory
pub trait DmaAllocator {
    /// Allocate `size` bytes aligned to `align` (a power of two)
    fn alloc_aligned(&mut self, size: usize, align: usize) -> Option<VirtAddr>;

    /// Physical address backing an allocated virtual address
    fn physical_address(&self, virt: VirtAddr) -> Option<PhysAddr>;

    /// Allocate a zeroed region the controller can reach with 32-bit addressing
    fn alloc_dma(&mut self, size: usize, align: usize) -> Option<DmaRegion> {
        let virt = self.alloc_aligned(size, align)?;
        let phys = self.physical_address(virt)?;
        if (phys.as_u32() as u64) + size as u64 > 1 << 32 || !phys.is_aligned(align as u32) {
            log::error!("DMA: allocation at {:?} unusable for a 32-bit controller", phys);
            return None;
        }
        unsafe { ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, size) };
        Some(DmaRegion { virt, phys, len: size })
    }
}

/// Bump allocator over one contiguous window with a fixed virtual/physical offset
///
/// With `virt_base == phys_base` this is the identity-mapped low-memory pool
/// the kernel hands to drivers at boot.
pub struct DmaPool {
    virt_base: VirtAddr,
    phys_base: PhysAddr,
    len: usize,
    next: usize,
}

impl DmaPool {
    /// Create a pool over `len` bytes of memory
    ///
    /// # Safety
    ///
    /// The window must be valid, exclusively owned by the pool and physically
    /// contiguous for its whole length.
    pub unsafe fn new(virt_base: VirtAddr, phys_base: PhysAddr, len: usize) -> Self {
        Self {
            virt_base,
            phys_base,
            len,
            next: 0,
        }
    }

    /// Bytes still available (ignoring alignment padding)
    pub fn remaining(&self) -> usize {
        self.len - self.next
    }
}

impl DmaAllocator for DmaPool {
    fn alloc_aligned(&mut self, size: usize, align: usize) -> Option<VirtAddr> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }
        // Align on the physical side; the offset between the spaces is fixed
        let phys_next = self.phys_base.as_u32() as usize + self.next;
        let padding = phys_next.next_multiple_of(align) - phys_next;
        let start = self.next.checked_add(padding)?;
        let end = start.checked_add(size)?;
        if end > self.len {
            log::warn!("DMA: pool exhausted ({} bytes requested)", size);
            return None;
        }
        self.next = end;
        Some(VirtAddr(self.virt_base.0 + start))
    }

    fn physical_address(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let offset = virt.0.checked_sub(self.virt_base.0)?;
        if offset >= self.len {
            return None;
        }
        u32::try_from(offset)
            .ok()
            .and_then(|o| self.phys_base.as_u32().checked_add(o))
            .map(PhysAddr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(backing: &mut [u8], phys: u32) -> DmaPool {
        unsafe { DmaPool::new(VirtAddr::from_ptr(backing.as_ptr()), PhysAddr::new(phys), backing.len()) }
    }

    #[test]
    fn test_pool_aligns_physical_side() {
        let mut backing = vec![0u8; 0x4000];
        let mut dma = pool(&mut backing, 0x0010_0010);

        let a = dma.alloc_dma(16, 16).unwrap();
        assert_eq!(a.phys(), PhysAddr::new(0x0010_0010));

        let b = dma.alloc_dma(0x100, 0x1000).unwrap();
        assert_eq!(b.phys(), PhysAddr::new(0x0010_1000));
        assert_eq!(b.virt().as_usize() - a.virt().as_usize(), 0x1000 - 0x10);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut backing = vec![0u8; 0x100];
        let mut dma = pool(&mut backing, 0x1000);
        assert!(dma.alloc_dma(0x80, 16).is_some());
        assert!(dma.alloc_dma(0x100, 16).is_none());
        assert_eq!(dma.remaining(), 0x80);
    }

    #[test]
    fn test_region_translation_is_bounded() {
        let mut backing = vec![0u8; 0x200];
        let mut dma = pool(&mut backing, 0x2000);
        let region = dma.alloc_dma(0x100, 0x100).unwrap();

        let inside = region.virt_at(0x40).unwrap();
        assert_eq!(region.translate(inside), Some(PhysAddr::new(0x2040)));
        assert_eq!(region.translate(VirtAddr::new(region.virt().as_usize() + 0x100)), None);
        assert_eq!(region.translate(VirtAddr::new(region.virt().as_usize() - 1)), None);
        assert!(region.contains(inside, 0xC0));
        assert!(!region.contains(inside, 0xC1));
    }

    #[test]
    fn test_region_copy_helpers() {
        let mut backing = vec![0xAAu8; 0x40];
        let mut dma = pool(&mut backing, 0x3000);
        let region = dma.alloc_dma(0x20, 16).unwrap();

        assert_eq!(region.write_bytes(0x1C, &[1, 2, 3, 4, 5, 6]), 4);
        let mut out = [0u8; 8];
        assert_eq!(region.read_bytes(0x18, &mut out), 8);
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);
    }
}
