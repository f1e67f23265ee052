//! # KILN Core Types
//!
//! Fundamental type definitions shared by the batch and primer code.
//!
//! These types provide:
//! - Strong typing for device addresses (never confused with host pointers)
//! - Byte sizes with alignment helpers
//! - Typed handles for externally owned objects
//! - Wrapping sequence numbers for completion tracking

use core::fmt;
use core::ops::{Add, Sub};

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// Device-visible address
///
/// This is an address in the device's (global GTT) address space.
/// It is NOT a host pointer and cannot be dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null GPU address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Lower 32 bits, as written by a single-dword relocation
    #[inline]
    pub const fn lower_32(self) -> u32 {
        self.0 as u32
    }

    /// Upper 32 bits
    #[inline]
    pub const fn upper_32(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<GpuAddr> for GpuAddr {
    type Output = u64;

    fn sub(self, rhs: GpuAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// 4 KiB (one page)
    pub const KIB_4: Self = Self(4 * 1024);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Align up
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Round `value` up to a power-of-two `align`
///
/// Returns `None` if `align` is not a power of two or the result overflows.
#[inline]
pub const fn align_up_u32(value: u32, align: u32) -> Option<u32> {
    if !align.is_power_of_two() {
        return None;
    }
    let mask = align - 1;
    match value.checked_add(mask) {
        Some(v) => Some(v & !mask),
        None => None,
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Opaque handle to an externally owned object
///
/// Handles are type-safe wrappers that prevent mixing different resource types.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: core::marker::PhantomData<T>,
}

impl<T> Handle<T> {
    /// Create a new handle
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _marker: core::marker::PhantomData,
        }
    }

    /// Get the raw ID
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }
}

// Manual impls so markers don't need to be Copy/Eq themselves.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> core::hash::Hash for Handle<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handle<{}>(0x{:x})",
            core::any::type_name::<T>(),
            self.id
        )
    }
}

/// Marker for memory object handles
#[derive(Debug)]
pub struct ObjectMarker;

/// Handle to a device memory object
pub type BufferHandle = Handle<ObjectMarker>;

// =============================================================================
// SEQUENCE NUMBERS
// =============================================================================

/// Completion sequence number
///
/// The device retires requests in order and advances a 32-bit counter as it
/// goes. Comparisons are done on the signed difference so the counter may
/// wrap.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Seqno(u32);

impl Seqno {
    /// Create from a raw counter value
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw counter value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check whether `self` has reached or passed `target`
    #[inline]
    pub const fn passed(self, target: Seqno) -> bool {
        (self.0.wrapping_sub(target.0) as i32) >= 0
    }
}

impl fmt::Debug for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seqno({})", self.0)
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::assert_impl_all!(GpuAddr: Send, Sync, Copy);
static_assertions::assert_impl_all!(ByteSize: Send, Sync, Copy);
static_assertions::assert_impl_all!(BufferHandle: Send, Sync, Copy);
static_assertions::assert_impl_all!(Seqno: Send, Sync, Copy);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_addr_halves() {
        let addr = GpuAddr::new(0x0000_1234_8000_0010);
        assert_eq!(addr.lower_32(), 0x8000_0010);
        assert_eq!(addr.upper_32(), 0x1234);
        assert_eq!(addr + 0x10, GpuAddr::new(0x0000_1234_8000_0020));
        assert_eq!(GpuAddr::new(0x2000) - GpuAddr::new(0x1000), 0x1000);
    }

    #[test]
    fn test_align_up_u32() {
        assert_eq!(align_up_u32(0, 4), Some(0));
        assert_eq!(align_up_u32(2049, 4), Some(2052));
        assert_eq!(align_up_u32(2048, 64), Some(2048));
        assert_eq!(align_up_u32(5, 3), None);
        assert_eq!(align_up_u32(5, 0), None);
        assert_eq!(align_up_u32(u32::MAX, 8), None);
    }

    #[test]
    fn test_seqno_wrap() {
        let a = Seqno::new(u32::MAX);
        let b = Seqno::new(a.raw().wrapping_add(1));
        assert!(b.passed(a));
        assert!(!a.passed(b));
        assert!(a.passed(a));
    }

    #[test]
    fn test_handle_identity() {
        let h = BufferHandle::new(7);
        assert_eq!(h.id(), 7);
        assert_eq!(h, BufferHandle::new(7));
        assert_ne!(h, BufferHandle::new(8));
    }
}
