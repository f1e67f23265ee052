//! # KILN Core Traits
//!
//! The collaborators a batch submission needs from the surrounding driver.
//!
//! ```text
//! ObjectAllocator                RenderEngine
//!    │ alloc_object                 │ generation
//!    │ pin ──────▶ GpuAddr          │ dispatch (GpuAddr, len, flags)
//!    │ map ──────▶ host pointer     │ flush_all_caches
//!    │ unmap / unpin / free         │ add_request ──▶ Seqno
//!                                   │ wait_seqno
//! ```
//!
//! Release operations (`unmap`, `unpin`, `free`) cannot fail: they run on
//! every exit path, including error unwinding.

use core::ptr::NonNull;

use crate::error::Result;
use crate::types::*;

// =============================================================================
// MEMORY OBJECT PROVIDER
// =============================================================================

/// Provider of pinned, host-mapped device memory objects
pub trait ObjectAllocator: Send + Sync {
    /// Allocate a memory object of at least `size` bytes
    fn alloc_object(&self, size: ByteSize) -> Result<BufferHandle>;

    /// Pin the object into the device address space
    fn pin(&self, obj: BufferHandle, alignment: u64) -> Result<GpuAddr>;

    /// Map the object into the host address space
    ///
    /// The returned pointer is valid for reads and writes of the object's
    /// full size until [`unmap`](Self::unmap) is called.
    fn map(&self, obj: BufferHandle) -> Result<NonNull<u8>>;

    /// Remove the host mapping
    fn unmap(&self, obj: BufferHandle);

    /// Drop the device pin
    fn unpin(&self, obj: BufferHandle);

    /// Release the object
    fn free(&self, obj: BufferHandle);
}

// =============================================================================
// RENDER ENGINE
// =============================================================================

bitflags::bitflags! {
    /// Flags for batch dispatch
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DispatchFlags: u32 {
        /// Run with secure (privileged) dispatch
        const SECURE = 1 << 0;
    }
}

/// Submission side of an engine ring
pub trait RenderEngine: Send + Sync {
    /// Hardware generation of the device behind this engine
    fn generation(&self) -> u32;

    /// Start execution of `len` bytes of instructions at `addr`
    fn dispatch(&self, addr: GpuAddr, len: u32, flags: DispatchFlags) -> Result<()>;

    /// Flush and invalidate all caches on the ring
    fn flush_all_caches(&self) -> Result<()>;

    /// Queue a completion request behind the previous work
    fn add_request(&self) -> Result<Seqno>;

    /// Block until `seqno` has retired
    fn wait_seqno(&self, seqno: Seqno) -> Result<()>;
}
