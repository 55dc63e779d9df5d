use std::marker::PhantomData;
use std::{cmp, fmt, mem, ptr};

use bitflags::bitflags;
use thiserror::Error;

pub const PAGE_SIZE: usize = 4096;

bitflags! {
    /// Attributes passed to [PhysMemory::map_page].
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum DmaError {
    #[error("out of physical pages")]
    OutOfMemory,

    #[error("failed to map physical page {0:#x}")]
    MapFailed(usize),

    #[error("range {offset:#x}+{len:#x} does not fit in one page")]
    OutOfBounds { offset: usize, len: usize },
}

/// The kernel's memory manager, as seen by a driver that hands physical addresses to a device.
///
/// No cache coherency is assumed: whatever the CPU writes has to be flushed before the device
/// reads it, and whatever the device writes has to be invalidated before the CPU reads it.
pub trait PhysMemory {
    /// Allocate one zeroed or dirty page-aligned physical page.
    fn allocate_page(&self) -> Option<usize>;
    /// # Safety
    /// `phys` must have been returned by [PhysMemory::allocate_page] and must not be accessed by
    /// either the CPU or a device afterwards.
    unsafe fn free_page(&self, phys: usize);

    fn phys_to_virt(&self, phys: usize) -> *mut u8;
    fn virt_to_phys(&self, virt: *const u8) -> usize;

    fn flush_cache_range(&self, virt: *const u8, len: usize);
    fn invalidate_cache_range(&self, virt: *const u8, len: usize);

    fn map_page(&self, virt: *mut u8, phys: usize, flags: PageFlags) -> Result<(), DmaError>;
}

/// An RAII guard of a single physical page.
pub struct PhysBox<'m> {
    mem: &'m dyn PhysMemory,
    address: usize,
}

impl<'m> PhysBox<'m> {
    pub fn new(mem: &'m dyn PhysMemory) -> Result<Self, DmaError> {
        let address = mem.allocate_page().ok_or_else(|| {
            log::error!("dma: physical page allocation failed");
            DmaError::OutOfMemory
        })?;
        debug_assert_eq!(address % PAGE_SIZE, 0);

        Ok(Self { mem, address })
    }

    /// Retrieve the byte address in physical memory, of this allocation.
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn size(&self) -> usize {
        PAGE_SIZE
    }
}

impl Drop for PhysBox<'_> {
    fn drop(&mut self) {
        unsafe { self.mem.free_page(self.address) }
    }
}

impl fmt::Debug for PhysBox<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysBox").field("address", &self.address).finish()
    }
}

struct FitsInPage<T>(PhantomData<T>);

impl<T> FitsInPage<T> {
    const OK: () = assert!(mem::size_of::<T>() <= PAGE_SIZE && mem::align_of::<T>() <= PAGE_SIZE);
}

/// A `T` living at the start of one physical page that a device may read or write at any time.
///
/// There is no `Deref`. CPU access goes through [Dma::update], which flushes after
/// the write, and [Dma::observe], which invalidates before the read.
pub struct Dma<'m, T> {
    phys: PhysBox<'m>,
    virt: *mut T,
}

impl<'m, T> Dma<'m, T> {
    /// Allocate a page, zero it and publish the zeroes.
    ///
    /// # Safety
    /// The all-zero bit pattern must be a valid `T`.
    pub unsafe fn zeroed(mem: &'m dyn PhysMemory) -> Result<Self, DmaError> {
        let () = FitsInPage::<T>::OK;

        let phys = PhysBox::new(mem)?;
        let virt = mem.phys_to_virt(phys.address());
        ptr::write_bytes(virt, 0, PAGE_SIZE);
        mem.flush_cache_range(virt, PAGE_SIZE);

        Ok(Self {
            phys,
            virt: virt as *mut T,
        })
    }

    pub fn physical(&self) -> usize {
        self.phys.address()
    }

    /// Write back the CPU view of `T` so the device observes it.
    pub fn publish(&self) {
        self.phys
            .mem
            .flush_cache_range(self.virt as *const u8, mem::size_of::<T>());
    }

    /// Discard the CPU view of `T` so the next read sees what the device wrote.
    pub fn acquire(&self) {
        self.phys
            .mem
            .invalidate_cache_range(self.virt as *const u8, mem::size_of::<T>());
    }

    pub fn update<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        let ret = f(unsafe { &mut *self.virt });
        self.publish();
        ret
    }

    pub fn observe<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.acquire();
        f(unsafe { &*self.virt })
    }

    /// Borrow `len` bytes at `offset` into the page as a device-visible byte buffer.
    pub fn region(&mut self, offset: usize, len: usize) -> Result<DmaRegion<'_>, DmaError> {
        match offset.checked_add(len) {
            Some(end) if end <= PAGE_SIZE => (),
            _ => return Err(DmaError::OutOfBounds { offset, len }),
        }
        let mem = self.phys.mem;
        let virt = unsafe { (self.virt as *mut u8).add(offset) };

        Ok(DmaRegion {
            mem,
            virt,
            phys: mem.virt_to_phys(virt),
            len,
            _page: PhantomData,
        })
    }
}

impl<'m> Dma<'m, [u8; PAGE_SIZE]> {
    /// A zeroed page of plain bytes.
    pub fn page(mem: &'m dyn PhysMemory) -> Result<Self, DmaError> {
        unsafe { Self::zeroed(mem) }
    }
}

impl<T> fmt::Debug for Dma<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dma").field("phys", &self.phys).finish()
    }
}

/// A byte range inside a [Dma] page, borrowed for the length of one transfer.
pub struct DmaRegion<'a> {
    mem: &'a dyn PhysMemory,
    virt: *mut u8,
    phys: usize,
    len: usize,
    _page: PhantomData<&'a mut [u8]>,
}

impl DmaRegion<'_> {
    pub fn physical(&self) -> usize {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn publish(&self) {
        self.mem.flush_cache_range(self.virt, self.len);
    }

    pub fn acquire(&self) {
        self.mem.invalidate_cache_range(self.virt, self.len);
    }

    /// Copy `bytes` to the start of the region and publish them. Returns the number of bytes
    /// copied, which is short if the region is smaller than `bytes`.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let count = cmp::min(bytes.len(), self.len);
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.virt, count) };
        self.mem.flush_cache_range(self.virt, count);
        count
    }

    /// Acquire the region and copy its start into `out`.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let count = cmp::min(out.len(), self.len);
        self.mem.invalidate_cache_range(self.virt, count);
        unsafe { ptr::copy_nonoverlapping(self.virt as *const u8, out.as_mut_ptr(), count) };
        count
    }
}

impl fmt::Debug for DmaRegion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("phys", &self.phys)
            .field("len", &self.len)
            .finish()
    }
}
