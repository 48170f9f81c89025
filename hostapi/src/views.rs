//! Typed views over guest linear memory, with invalidation on growth.
//!
//! Growing guest memory may move or resize its backing region, so a view
//! built before a growth event must never satisfy a read after it. Every
//! [`View`] records the identity of the region it was built over, and every
//! access checks that identity against the region supplied at access time:
//! a stale view fails with [`BridgeError::StaleView`] instead of touching
//! the wrong bytes.
//!
//! [`ViewCache`] hands out views lazily and rebuilds one whenever the
//! current region's identity differs from the cached view's. A view is only
//! guaranteed valid until the next boundary call that can allocate.
//!
//! Views never lend out guest bytes. Every access copies into or out of a
//! [`Region`], which is what lets a region shared with other threads be
//! accessed without ever forming a reference to its contents.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::Range;

use crate::error::BridgeError;

/// Guest linear memory as one boundary call sees it.
pub enum Region<'m> {
    /// Memory only this instance can touch while the borrow lasts.
    Private(&'m mut [u8]),
    /// Memory other threads may read and write concurrently.
    Shared(&'m [UnsafeCell<u8>]),
}

impl Region<'_> {
    /// Identity of the region, for view invalidation.
    pub fn id(&self) -> RegionId {
        match self {
            Self::Private(bytes) => RegionId::of(bytes),
            Self::Shared(cells) => RegionId {
                base: cells.as_ptr() as usize,
                len: cells.len(),
            },
        }
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Private(bytes) => bytes.len(),
            Self::Shared(cells) => cells.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `out.len()` bytes starting at `start` into `out`. Panics if the
    /// range is out of bounds; callers check with [`byte_range`] first.
    fn copy_out(&self, start: usize, out: &mut [u8]) {
        let range = start..start + out.len();
        match self {
            Self::Private(bytes) => out.copy_from_slice(&bytes[range]),
            Self::Shared(cells) => {
                let src = &cells[range];
                // SAFETY: `src` and `out` have the same length. The cells are
                // only reached through raw pointers, so no reference to shared
                // guest bytes is ever formed.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        UnsafeCell::raw_get(src.as_ptr()),
                        out.as_mut_ptr(),
                        out.len(),
                    );
                }
            }
        }
    }

    /// Copy `data` in starting at `start`. Panics if out of bounds.
    fn copy_in(&mut self, start: usize, data: &[u8]) {
        let range = start..start + data.len();
        match self {
            Self::Private(bytes) => bytes[range].copy_from_slice(data),
            Self::Shared(cells) => {
                let dst = &cells[range];
                // SAFETY: as in `copy_out`, with the roles swapped.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        UnsafeCell::raw_get(dst.as_ptr()),
                        data.len(),
                    );
                }
            }
        }
    }
}

impl<'m> From<&'m mut [u8]> for Region<'m> {
    fn from(bytes: &'m mut [u8]) -> Self {
        Self::Private(bytes)
    }
}

impl<'m> From<&'m mut Vec<u8>> for Region<'m> {
    fn from(bytes: &'m mut Vec<u8>) -> Self {
        Self::Private(bytes.as_mut_slice())
    }
}

impl<'m> From<&'m [UnsafeCell<u8>]> for Region<'m> {
    fn from(cells: &'m [UnsafeCell<u8>]) -> Self {
        Self::Shared(cells)
    }
}

/// Identity of a linear-memory region: its base address and byte length.
/// Growth always changes the length, and may change the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionId {
    base: usize,
    len: usize,
}

impl RegionId {
    pub fn of(mem: &[u8]) -> Self {
        Self {
            base: mem.as_ptr() as usize,
            len: mem.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// An element type a view can be typed over. Elements are little-endian.
pub trait Element: Copy {
    const SIZE: usize;
    fn load(bytes: &[u8]) -> Self;
    fn store(self, bytes: &mut [u8]);
}

macro_rules! impl_element {
    ($($ty:ty),*) => {
        $(
            impl Element for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn load(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }

                fn store(self, bytes: &mut [u8]) {
                    bytes[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_element!(u8, i32, u32, f64);

/// A typed overlay over one specific memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct View<E> {
    region: RegionId,
    _elem: PhantomData<E>,
}

impl<E: Element> View<E> {
    fn new(region: RegionId) -> Self {
        Self {
            region,
            _elem: PhantomData,
        }
    }

    /// Identity of the region this view was built over.
    pub fn region(&self) -> RegionId {
        self.region
    }

    /// Number of whole elements in the view.
    pub fn len(&self) -> usize {
        self.region.len / E::SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the element at `index` (a byte pointer divided by the element size).
    pub fn get(&self, mem: &Region<'_>, index: usize) -> Result<E, BridgeError> {
        self.check(mem)?;
        let start = self.element_start(index, mem.len())?;
        let mut raw = [0u8; 8];
        mem.copy_out(start, &mut raw[..E::SIZE]);
        Ok(E::load(&raw))
    }

    /// Write the element at `index`.
    pub fn set(&self, mem: &mut Region<'_>, index: usize, value: E) -> Result<(), BridgeError> {
        self.check(mem)?;
        let start = self.element_start(index, mem.len())?;
        let mut raw = [0u8; 8];
        value.store(&mut raw);
        mem.copy_in(start, &raw[..E::SIZE]);
        Ok(())
    }

    /// Convert a byte pointer into an element index, rejecting misaligned
    /// pointers.
    pub fn index_of(ptr: u32) -> Result<usize, BridgeError> {
        if ptr as usize % E::SIZE != 0 {
            return Err(BridgeError::Misaligned {
                ptr,
                align: E::SIZE,
            });
        }
        Ok(ptr as usize / E::SIZE)
    }

    fn check(&self, mem: &Region<'_>) -> Result<(), BridgeError> {
        if mem.id() != self.region {
            return Err(BridgeError::StaleView);
        }
        Ok(())
    }

    fn element_start(&self, index: usize, size: usize) -> Result<usize, BridgeError> {
        let start = index.checked_mul(E::SIZE);
        match start {
            Some(start) if start + E::SIZE <= size => Ok(start),
            _ => Err(BridgeError::OutOfBounds {
                op: "view",
                ptr: index.saturating_mul(E::SIZE) as u32,
                len: E::SIZE as u32,
                size,
            }),
        }
    }
}

impl View<u8> {
    /// Copy out `len` bytes starting at `ptr`.
    pub fn read(&self, mem: &Region<'_>, ptr: u32, len: u32) -> Result<Vec<u8>, BridgeError> {
        self.check(mem)?;
        let range = byte_range("read", ptr, len, mem.len())?;
        let mut out = vec![0u8; range.len()];
        mem.copy_out(range.start, &mut out);
        Ok(out)
    }

    /// Copy `data` into memory starting at `ptr`.
    pub fn write(&self, mem: &mut Region<'_>, ptr: u32, data: &[u8]) -> Result<(), BridgeError> {
        self.check(mem)?;
        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        let range = byte_range("write", ptr, len, mem.len())?;
        mem.copy_in(range.start, data);
        Ok(())
    }
}

/// Validate `[ptr, ptr + len)` against a region of `size` bytes.
pub fn byte_range(
    op: &'static str,
    ptr: u32,
    len: u32,
    size: usize,
) -> Result<Range<usize>, BridgeError> {
    let start = ptr as usize;
    match start.checked_add(len as usize) {
        Some(end) if end <= size => Ok(start..end),
        _ => Err(BridgeError::OutOfBounds { op, ptr, len, size }),
    }
}

/// Lazily built, identity-checked views over one guest instance's memory.
#[derive(Debug, Default)]
pub struct ViewCache {
    u8_view: Option<View<u8>>,
    i32_view: Option<View<i32>>,
    u32_view: Option<View<u32>>,
    f64_view: Option<View<f64>>,
    rebuilds: u64,
}

impl ViewCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view_u8(&mut self, mem: &Region<'_>) -> View<u8> {
        refresh(&mut self.u8_view, &mut self.rebuilds, mem)
    }

    pub fn view_i32(&mut self, mem: &Region<'_>) -> View<i32> {
        refresh(&mut self.i32_view, &mut self.rebuilds, mem)
    }

    pub fn view_u32(&mut self, mem: &Region<'_>) -> View<u32> {
        refresh(&mut self.u32_view, &mut self.rebuilds, mem)
    }

    pub fn view_f64(&mut self, mem: &Region<'_>) -> View<f64> {
        refresh(&mut self.f64_view, &mut self.rebuilds, mem)
    }

    /// Total number of views (re)built so far.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Forget every cached view.
    pub fn invalidate(&mut self) {
        self.u8_view = None;
        self.i32_view = None;
        self.u32_view = None;
        self.f64_view = None;
    }
}

fn refresh<E: Element>(slot: &mut Option<View<E>>, rebuilds: &mut u64, mem: &Region<'_>) -> View<E> {
    let current = mem.id();
    match slot {
        Some(view) if view.region == current => *view,
        _ => {
            *rebuilds += 1;
            let view = View::new(current);
            *slot = Some(view);
            view
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(len: usize) -> Vec<UnsafeCell<u8>> {
        (0..len).map(|_| UnsafeCell::new(0)).collect()
    }

    #[test]
    fn test_view_is_cached_while_region_unchanged() {
        let mut mem = vec![0u8; 64];
        let region = Region::from(&mut mem);
        let mut cache = ViewCache::new();
        let a = cache.view_u8(&region);
        let b = cache.view_u8(&region);
        assert_eq!(a, b);
        assert_eq!(cache.rebuilds(), 1);
    }

    #[test]
    fn test_view_rebuilt_after_growth() {
        let mut mem = vec![0u8; 64];
        let mut cache = ViewCache::new();
        let before = cache.view_i32(&Region::from(&mut mem));

        mem.resize(128, 0);
        let region = Region::from(&mut mem);
        let after = cache.view_i32(&region);

        assert_ne!(before.region(), after.region());
        assert_eq!(after.region(), region.id());
        assert_eq!(after.len(), 32);
        assert_eq!(cache.rebuilds(), 2);
    }

    #[test]
    fn test_stale_view_refuses_access() {
        let mut mem = vec![0u8; 64];
        let mut cache = ViewCache::new();
        let stale = cache.view_u32(&Region::from(&mut mem));
        mem.resize(4096, 0);

        let mut region = Region::from(&mut mem);
        assert_eq!(stale.get(&region, 0).unwrap_err(), BridgeError::StaleView);
        assert_eq!(stale.set(&mut region, 0, 1).unwrap_err(), BridgeError::StaleView);
        let fresh = cache.view_u32(&region);
        fresh.set(&mut region, 3, 0xDEADBEEF).unwrap();
        assert_eq!(fresh.get(&region, 3).unwrap(), 0xDEADBEEF);
    }

    #[test]
    fn test_elements_are_little_endian() {
        let mut mem = vec![0u8; 16];
        let mut cache = ViewCache::new();
        {
            let mut region = Region::from(&mut mem);
            cache.view_i32(&region).set(&mut region, 1, -2).unwrap();
        }
        assert_eq!(&mem[4..8], &(-2i32).to_le_bytes());

        let mut region = Region::from(&mut mem);
        cache.view_f64(&region).set(&mut region, 1, 2.5).unwrap();
        assert_eq!(cache.view_f64(&region).get(&region, 1).unwrap(), 2.5);
    }

    #[test]
    fn test_index_of_rejects_misaligned_pointers() {
        assert_eq!(View::<i32>::index_of(8).unwrap(), 2);
        assert_eq!(
            View::<f64>::index_of(12).unwrap_err(),
            BridgeError::Misaligned { ptr: 12, align: 8 }
        );
        assert_eq!(View::<u8>::index_of(7).unwrap(), 7);
    }

    #[test]
    fn test_out_of_bounds_access() {
        let mut mem = vec![0u8; 8];
        let mut region = Region::from(&mut mem);
        let mut cache = ViewCache::new();
        let view = cache.view_u8(&region);
        assert!(view.read(&region, 4, 5).is_err());
        assert!(view.write(&mut region, u32::MAX, &[1]).is_err());
        assert!(cache.view_i32(&region).get(&region, 2).is_err());
    }

    #[test]
    fn test_shared_region_copies_in_and_out() {
        let cells = cells(32);
        let mut region = Region::from(cells.as_slice());
        let mut cache = ViewCache::new();

        cache.view_u8(&region).write(&mut region, 4, b"shared").unwrap();
        cache.view_u32(&region).set(&mut region, 4, 0xA1B2C3D4).unwrap();

        assert_eq!(cache.view_u8(&region).read(&region, 4, 6).unwrap(), b"shared");
        assert_eq!(cache.view_u32(&region).get(&region, 4).unwrap(), 0xA1B2C3D4);
        assert_eq!(unsafe { *cells[4].get() }, b's');
        assert!(cache.view_u8(&region).read(&region, 30, 4).is_err());
    }

    #[test]
    fn test_private_view_is_stale_for_shared_region() {
        let mut mem = vec![0u8; 32];
        let cells = cells(32);
        let mut cache = ViewCache::new();
        let private = cache.view_u8(&Region::from(&mut mem));
        let shared = Region::from(cells.as_slice());
        assert_eq!(private.read(&shared, 0, 1).unwrap_err(), BridgeError::StaleView);
    }
}
