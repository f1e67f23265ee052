//! # KILN Test Framework
//!
//! A software device implementing [`ObjectAllocator`] and [`RenderEngine`].
//!
//! `SoftDevice` backs memory objects with host allocations, "executes" a
//! dispatched batch by reading its dwords back, retires requests through a
//! [`SeqnoFence`], and records every collaborator call in order. Any step can
//! be made to fail once, and the engine can be hung so waits time out.

#![no_std]
#![warn(missing_docs)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;

use arrayvec::ArrayVec;
use spin::Mutex;

use kiln_core::{
    BufferHandle, ByteSize, DispatchFlags, Error, GpuAddr, ObjectAllocator, RenderEngine, Result,
    Seqno, SeqnoFence,
};

/// Maximum calls kept in the log
pub const MAX_CALLS: usize = 64;

/// Spins a wait is allowed before reporting a timeout
pub const DEFAULT_SPIN_LIMIT: u64 = 1 << 16;

const MAX_OBJECTS: usize = 8;
const MAX_FAULTS: usize = 8;
const GTT_BASE: u64 = 0x0010_0000;

// =============================================================================
// CALL LOG
// =============================================================================

/// Collaborator step, used for fault injection and order checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// `alloc_object`
    Alloc,
    /// `pin`
    Pin,
    /// `map`
    Map,
    /// `unmap`
    Unmap,
    /// `unpin`
    Unpin,
    /// `free`
    Free,
    /// `dispatch`
    Dispatch,
    /// `flush_all_caches`
    Flush,
    /// `add_request`
    Request,
    /// `wait_seqno`
    Wait,
}

/// One recorded collaborator call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// Object allocation
    AllocObject {
        /// Requested size
        size: ByteSize,
    },
    /// Object pin
    Pin {
        /// Object
        obj: BufferHandle,
        /// Address handed out, null on failure
        addr: GpuAddr,
    },
    /// Host mapping
    Map {
        /// Object
        obj: BufferHandle,
    },
    /// Host unmapping
    Unmap {
        /// Object
        obj: BufferHandle,
    },
    /// Device unpin
    Unpin {
        /// Object
        obj: BufferHandle,
    },
    /// Object release
    Free {
        /// Object
        obj: BufferHandle,
    },
    /// Batch dispatch
    Dispatch {
        /// Batch address
        addr: GpuAddr,
        /// Batch length
        len: u32,
        /// Dispatch flags
        flags: DispatchFlags,
    },
    /// Cache flush
    Flush,
    /// Completion request
    AddRequest,
    /// Completion wait
    Wait {
        /// Awaited seqno
        seqno: Seqno,
    },
}

impl Call {
    /// Step this call belongs to
    pub fn step(&self) -> Step {
        match self {
            Self::AllocObject { .. } => Step::Alloc,
            Self::Pin { .. } => Step::Pin,
            Self::Map { .. } => Step::Map,
            Self::Unmap { .. } => Step::Unmap,
            Self::Unpin { .. } => Step::Unpin,
            Self::Free { .. } => Step::Free,
            Self::Dispatch { .. } => Step::Dispatch,
            Self::Flush => Step::Flush,
            Self::AddRequest => Step::Request,
            Self::Wait { .. } => Step::Wait,
        }
    }
}

// =============================================================================
// SOFT OBJECTS
// =============================================================================

#[derive(Debug)]
struct SoftObject {
    handle: BufferHandle,
    mem: NonNull<[u8]>,
    gpu_addr: Option<GpuAddr>,
    mapped: bool,
}

impl SoftObject {
    fn new(handle: BufferHandle, size: usize) -> Self {
        let mem = Box::into_raw(alloc::vec![0u8; size].into_boxed_slice());
        Self {
            handle,
            // SAFETY: Box::into_raw never returns null
            mem: unsafe { NonNull::new_unchecked(mem) },
            gpu_addr: None,
            mapped: false,
        }
    }

    fn len(&self) -> usize {
        self.mem.len()
    }

    fn contains(&self, addr: GpuAddr) -> bool {
        self.gpu_addr
            .is_some_and(|base| addr >= base && addr - base < self.len() as u64)
    }

    fn read_dwords(&self, offset: usize, len: usize) -> Vec<u32> {
        let end = (offset + len).min(self.len());
        // SAFETY: `mem` is live until drop and nothing writes through the
        // mapping while the engine is reading the batch.
        let bytes = unsafe { &self.mem.as_ref()[offset.min(end)..end] };
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

impl Drop for SoftObject {
    fn drop(&mut self) {
        // SAFETY: `mem` came from Box::into_raw in `new` and is dropped once
        drop(unsafe { Box::from_raw(self.mem.as_ptr()) });
    }
}

// SAFETY: The allocation is owned by the object; access is serialised by
// the device lock.
unsafe impl Send for SoftObject {}

// =============================================================================
// SOFT DEVICE
// =============================================================================

#[derive(Debug, Default)]
struct Inner {
    calls: ArrayVec<Call, MAX_CALLS>,
    faults: ArrayVec<(Step, Error), MAX_FAULTS>,
    objects: ArrayVec<SoftObject, MAX_OBJECTS>,
    next_handle: u64,
    next_gtt: u64,
    executed: Vec<u32>,
    hung: bool,
}

impl Inner {
    fn record(&mut self, call: Call) {
        if self.calls.try_push(call).is_err() {
            log::warn!("soft device call log full");
        }
    }

    fn inject(&mut self, step: Step) -> Result<()> {
        match self.faults.iter().position(|(s, _)| *s == step) {
            Some(idx) => Err(self.faults.remove(idx).1),
            None => Ok(()),
        }
    }

    fn object(&mut self, obj: BufferHandle) -> Option<&mut SoftObject> {
        self.objects.iter_mut().find(|o| o.handle == obj)
    }
}

/// Software GPU device for tests
#[derive(Debug)]
pub struct SoftDevice {
    generation: u32,
    inner: Mutex<Inner>,
    fence: SeqnoFence,
}

impl SoftDevice {
    /// Create a device reporting `generation`
    pub fn new(generation: u32) -> Self {
        Self::with_spin_limit(generation, DEFAULT_SPIN_LIMIT)
    }

    /// Create a device whose seqno waits give up after `spins` polls
    pub fn with_spin_limit(generation: u32, spins: u64) -> Self {
        Self {
            generation,
            inner: Mutex::new(Inner {
                next_handle: 1,
                next_gtt: GTT_BASE,
                ..Inner::default()
            }),
            fence: SeqnoFence::with_spin_limit(spins),
        }
    }

    /// Make the next call of `step` fail with `err`
    pub fn fail_at(&self, step: Step, err: Error) {
        if self.inner.lock().faults.try_push((step, err)).is_err() {
            log::warn!("soft device fault table full");
        }
    }

    /// Stop retiring requests
    pub fn hang(&self) {
        self.inner.lock().hung = true;
    }

    /// Calls made so far, in order
    pub fn calls(&self) -> ArrayVec<Call, MAX_CALLS> {
        self.inner.lock().calls.clone()
    }

    /// Number of recorded calls matching `pred`
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.inner.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Dwords of every batch dispatched so far
    pub fn executed(&self) -> Vec<u32> {
        self.inner.lock().executed.clone()
    }

    /// Objects allocated and not yet freed
    pub fn live_objects(&self) -> usize {
        self.inner.lock().objects.len()
    }

    /// Last retired seqno
    pub fn completed(&self) -> Seqno {
        self.fence.completed()
    }
}

impl ObjectAllocator for SoftDevice {
    fn alloc_object(&self, size: ByteSize) -> Result<BufferHandle> {
        let mut inner = self.inner.lock();
        inner.record(Call::AllocObject { size });
        inner.inject(Step::Alloc)?;

        let len = usize::try_from(size.as_bytes()).map_err(|_| Error::AllocationFailed)?;
        if inner.objects.is_full() {
            return Err(Error::AllocationFailed);
        }

        let handle = BufferHandle::new(inner.next_handle);
        inner.next_handle += 1;
        inner.objects.push(SoftObject::new(handle, len));
        Ok(handle)
    }

    fn pin(&self, obj: BufferHandle, alignment: u64) -> Result<GpuAddr> {
        let mut inner = self.inner.lock();
        if let Err(err) = inner.inject(Step::Pin) {
            inner.record(Call::Pin {
                obj,
                addr: GpuAddr::null(),
            });
            return Err(err);
        }

        let base = ByteSize::from_bytes(inner.next_gtt).align_up(alignment.max(1));
        let addr = GpuAddr::new(base.as_bytes());
        let len = match inner.object(obj) {
            Some(o) => {
                o.gpu_addr = Some(addr);
                o.len() as u64
            }
            None => {
                inner.record(Call::Pin {
                    obj,
                    addr: GpuAddr::null(),
                });
                return Err(Error::PinFailed);
            }
        };
        inner.next_gtt = addr.raw() + len;
        inner.record(Call::Pin { obj, addr });
        Ok(addr)
    }

    fn map(&self, obj: BufferHandle) -> Result<NonNull<u8>> {
        let mut inner = self.inner.lock();
        inner.record(Call::Map { obj });
        inner.inject(Step::Map)?;

        let o = inner.object(obj).ok_or(Error::MappingFailed)?;
        o.mapped = true;
        Ok(o.mem.cast::<u8>())
    }

    fn unmap(&self, obj: BufferHandle) {
        let mut inner = self.inner.lock();
        inner.record(Call::Unmap { obj });
        match inner.object(obj) {
            Some(o) if o.mapped => o.mapped = false,
            _ => log::warn!("unmap of unmapped object {:?}", obj),
        }
    }

    fn unpin(&self, obj: BufferHandle) {
        let mut inner = self.inner.lock();
        inner.record(Call::Unpin { obj });
        match inner.object(obj) {
            Some(o) if o.gpu_addr.is_some() => o.gpu_addr = None,
            _ => log::warn!("unpin of unpinned object {:?}", obj),
        }
    }

    fn free(&self, obj: BufferHandle) {
        let mut inner = self.inner.lock();
        inner.record(Call::Free { obj });
        match inner.objects.iter().position(|o| o.handle == obj) {
            Some(idx) => drop(inner.objects.remove(idx)),
            None => log::warn!("free of unknown object {:?}", obj),
        }
    }
}

impl RenderEngine for SoftDevice {
    fn generation(&self) -> u32 {
        self.generation
    }

    fn dispatch(&self, addr: GpuAddr, len: u32, flags: DispatchFlags) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.record(Call::Dispatch { addr, len, flags });
        inner.inject(Step::Dispatch)?;

        let dwords = inner
            .objects
            .iter()
            .find(|o| o.contains(addr))
            .and_then(|o| {
                let base = o.gpu_addr?;
                Some(o.read_dwords((addr - base) as usize, len as usize))
            })
            .ok_or(Error::DispatchFailed)?;
        inner.executed.extend(dwords);
        Ok(())
    }

    fn flush_all_caches(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.record(Call::Flush);
        inner.inject(Step::Flush)
    }

    fn add_request(&self) -> Result<Seqno> {
        let mut inner = self.inner.lock();
        inner.record(Call::AddRequest);
        inner.inject(Step::Request)?;

        let seqno = self.fence.advance();
        if !inner.hung {
            self.fence.signal(seqno);
        }
        Ok(seqno)
    }

    fn wait_seqno(&self, seqno: Seqno) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.record(Call::Wait { seqno });
            inner.inject(Step::Wait)?;
        }
        self.fence.wait(seqno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_lifecycle() {
        let dev = SoftDevice::new(7);
        let obj = dev.alloc_object(ByteSize::KIB_4).unwrap();
        let addr = dev.pin(obj, 4096).unwrap();
        assert!(addr.is_aligned(4096));

        let ptr = dev.map(obj).unwrap();
        // SAFETY: the object is 4 KiB and mapped
        unsafe { ptr.as_ptr().cast::<[u8; 4]>().write(0x0500_0000u32.to_le_bytes()) };

        dev.dispatch(addr, 4, DispatchFlags::SECURE).unwrap();
        assert_eq!(dev.executed(), [0x0500_0000]);

        dev.unmap(obj);
        dev.unpin(obj);
        dev.free(obj);
        assert_eq!(dev.live_objects(), 0);
        assert_eq!(dev.calls().len(), 7);
    }

    #[test]
    fn test_pin_unknown_object_is_recorded() {
        let dev = SoftDevice::new(7);
        let stray = BufferHandle::new(0x99);
        assert_eq!(dev.pin(stray, 4096), Err(Error::PinFailed));
        assert_eq!(
            dev.calls().last(),
            Some(&Call::Pin {
                obj: stray,
                addr: GpuAddr::null(),
            })
        );
        assert_eq!(dev.count(|c| matches!(c, Call::Pin { .. })), 1);
    }

    #[test]
    fn test_fault_fires_once() {
        let dev = SoftDevice::new(6);
        dev.fail_at(Step::Flush, Error::FlushFailed);
        assert_eq!(dev.flush_all_caches(), Err(Error::FlushFailed));
        assert_eq!(dev.flush_all_caches(), Ok(()));
    }

    #[test]
    fn test_requests_retire_unless_hung() {
        let dev = SoftDevice::with_spin_limit(6, 8);
        let seqno = dev.add_request().unwrap();
        assert_eq!(dev.wait_seqno(seqno), Ok(()));
        assert_eq!(dev.completed(), seqno);

        dev.hang();
        let stuck = dev.add_request().unwrap();
        assert_eq!(dev.wait_seqno(stuck), Err(Error::WaitTimeout));
    }

    #[test]
    fn test_dispatch_outside_objects() {
        let dev = SoftDevice::new(6);
        assert_eq!(
            dev.dispatch(GpuAddr::new(0xdead_0000), 4, DispatchFlags::empty()),
            Err(Error::DispatchFailed)
        );
    }
}
