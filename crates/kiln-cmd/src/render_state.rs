//! # Render-State Primer
//!
//! One-shot batch that puts the render engine into a known state before any
//! other work runs on it.
//!
//! ```text
//! Idle ──▶ Allocated ──▶ Encoded ──▶ Submitted ──▶ Flushed ──▶ Awaited ──▶ Released
//!              │             │            │            │           │
//!              └─────────────┴────────────┴────────────┴───────────┴──▶ Failed
//! ```
//!
//! The backing object is released on every path out of the sequence. A batch
//! that faulted while being recorded is never submitted.

use core::ptr::NonNull;

use kiln_core::{
    BufferHandle, ByteSize, DispatchFlags, Error, GpuAddr, ObjectAllocator, RenderEngine, Result,
    Seqno,
};

use crate::batch::BatchBuffer;
use crate::encoder::{GenSupport, RenderGen};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Render-state primer configuration
#[derive(Debug, Clone)]
pub struct RenderStateConfig {
    /// Size of the batch object
    pub batch_size: ByteSize,
    /// Pin alignment in the device address space
    pub alignment: u64,
}

impl Default for RenderStateConfig {
    fn default() -> Self {
        Self {
            batch_size: ByteSize::KIB_4,
            alignment: 4096,
        }
    }
}

// =============================================================================
// STATE & OUTCOME
// =============================================================================

/// Primer progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimerState {
    /// Nothing done yet
    Idle,
    /// Object allocated, pinned and mapped
    Allocated,
    /// Batch recorded without faults
    Encoded,
    /// Batch handed to the engine
    Submitted,
    /// Caches flushed behind the batch
    Flushed,
    /// Completion observed
    Awaited,
    /// Object released after a successful run
    Released,
    /// A step failed; object released
    Failed,
}

/// Result of a successful primer run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimeOutcome {
    /// Generation predates render-state priming; nothing was done
    Skipped {
        /// Reported generation
        generation: u32,
    },
    /// No generator for this generation yet; nothing was submitted
    Unimplemented {
        /// Reported generation
        generation: u32,
    },
    /// Batch executed and retired
    Primed {
        /// Generator used
        generation: RenderGen,
        /// Bytes of instructions submitted
        len: u32,
        /// Request the batch retired with
        seqno: Seqno,
    },
}

// =============================================================================
// RENDER-STATE OBJECT
// =============================================================================

/// Pinned, mapped batch object, released on drop
#[derive(Debug)]
pub struct RenderStateObject<'d, A: ObjectAllocator + ?Sized> {
    allocator: &'d A,
    handle: BufferHandle,
    gpu_addr: GpuAddr,
    base: NonNull<u8>,
    size: usize,
    len: u32,
}

impl<'d, A: ObjectAllocator + ?Sized> RenderStateObject<'d, A> {
    /// Allocate, pin and map a batch object
    ///
    /// Steps that succeeded are undone if a later one fails.
    pub fn alloc(allocator: &'d A, config: &RenderStateConfig) -> Result<Self> {
        let size =
            usize::try_from(config.batch_size.as_bytes()).map_err(|_| Error::AllocationFailed)?;

        let handle = allocator.alloc_object(config.batch_size)?;

        let gpu_addr = match allocator.pin(handle, config.alignment) {
            Ok(addr) => addr,
            Err(err) => {
                allocator.free(handle);
                return Err(err);
            }
        };

        let base = match allocator.map(handle) {
            Ok(ptr) => ptr,
            Err(err) => {
                allocator.unpin(handle);
                allocator.free(handle);
                return Err(err);
            }
        };

        log::debug!(
            "render state object {:?}: {} at {}",
            handle,
            config.batch_size,
            gpu_addr
        );

        Ok(Self {
            allocator,
            handle,
            gpu_addr,
            base,
            size,
            len: 0,
        })
    }

    /// Object handle
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Device address of the batch
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// Bytes of instructions recorded by the last [`generate`](Self::generate)
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Check whether no instructions have been recorded
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Batch buffer view over the mapping
    pub fn batch(&mut self) -> BatchBuffer<'_> {
        // SAFETY: The mapping covers `size` bytes and stays valid until drop;
        // the `&mut self` borrow keeps the view exclusive.
        unsafe { BatchBuffer::from_raw(self.base, self.size, self.gpu_addr) }
    }

    /// Record the batch for `render_gen`, returning its length
    pub fn generate(&mut self, render_gen: RenderGen) -> Result<u32> {
        let mut batch = self.batch();
        // Generators stop at the first fault; the sticky status catches
        // anything they chose to ignore.
        render_gen.generate(&mut batch)?;
        batch.status()?;

        let len = batch.used();
        self.len = len;
        Ok(len)
    }
}

impl<A: ObjectAllocator + ?Sized> Drop for RenderStateObject<'_, A> {
    fn drop(&mut self) {
        log::debug!("releasing render state object {:?}", self.handle);
        self.allocator.unmap(self.handle);
        self.allocator.unpin(self.handle);
        self.allocator.free(self.handle);
    }
}

// =============================================================================
// PRIMER
// =============================================================================

/// Drives the render-state sequence on one engine
#[derive(Debug)]
pub struct RenderStatePrimer<'d, A: ?Sized, E: ?Sized> {
    allocator: &'d A,
    engine: &'d E,
    config: RenderStateConfig,
    state: PrimerState,
}

impl<'d, A, E> RenderStatePrimer<'d, A, E>
where
    A: ObjectAllocator + ?Sized,
    E: RenderEngine + ?Sized,
{
    /// Create a primer with the default configuration
    pub fn new(allocator: &'d A, engine: &'d E) -> Self {
        Self::with_config(allocator, engine, RenderStateConfig::default())
    }

    /// Create a primer with an explicit configuration
    pub fn with_config(allocator: &'d A, engine: &'d E, config: RenderStateConfig) -> Self {
        Self {
            allocator,
            engine,
            config,
            state: PrimerState::Idle,
        }
    }

    /// Current state
    pub fn state(&self) -> PrimerState {
        self.state
    }

    /// Configuration in use
    pub fn config(&self) -> &RenderStateConfig {
        &self.config
    }

    fn transition(&mut self, next: PrimerState) {
        log::trace!("render state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run the whole sequence, blocking until the batch retires
    ///
    /// Returns the first error hit. The batch object is released before this
    /// returns, whatever the outcome.
    pub fn run(&mut self) -> Result<PrimeOutcome> {
        self.state = PrimerState::Idle;

        let generation = self.engine.generation();
        if let GenSupport::Unsupported(generation) = GenSupport::from_generation(generation) {
            log::debug!("gen {} has no render state, skipping", generation);
            return Ok(PrimeOutcome::Skipped { generation });
        }

        let result = self.prime(generation);
        match result {
            Ok(_) => self.transition(PrimerState::Released),
            Err(err) => {
                log::error!(
                    "render state init failed in {:?}: {} ({})",
                    self.state,
                    err,
                    err.to_errno()
                );
                self.transition(PrimerState::Failed);
            }
        }
        result
    }

    fn prime(&mut self, generation: u32) -> Result<PrimeOutcome> {
        let mut so = RenderStateObject::alloc(self.allocator, &self.config)?;
        self.transition(PrimerState::Allocated);

        let render_gen = match GenSupport::from_generation(generation) {
            GenSupport::Known(render_gen) => render_gen,
            _ => {
                log::warn!("gen {:#x} render state not implemented", generation);
                return Ok(PrimeOutcome::Unimplemented { generation });
            }
        };

        let len = so.generate(render_gen)?;
        self.transition(PrimerState::Encoded);

        self.engine.dispatch(so.gpu_addr(), len, DispatchFlags::SECURE)?;
        self.transition(PrimerState::Submitted);

        self.engine.flush_all_caches()?;
        self.transition(PrimerState::Flushed);

        let seqno = self.engine.add_request()?;
        self.engine.wait_seqno(seqno)?;
        self.transition(PrimerState::Awaited);

        log::debug!(
            "{} render state primed: {} bytes, seqno {}",
            render_gen.name(),
            len,
            seqno
        );

        Ok(PrimeOutcome::Primed {
            generation: render_gen,
            len,
            seqno,
        })
    }
}

/// Prime the render engine with the default configuration
pub fn init_render_state<A, E>(allocator: &A, engine: &E) -> Result<PrimeOutcome>
where
    A: ObjectAllocator + ?Sized,
    E: RenderEngine + ?Sized,
{
    RenderStatePrimer::new(allocator, engine).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mi::MI_BATCH_BUFFER_END;
    use kiln_test_framework::{Call, SoftDevice, Step};
    use std::vec::Vec;

    fn assert_released(dev: &SoftDevice) {
        assert_eq!(dev.live_objects(), 0);
        assert_eq!(
            dev.count(|c| matches!(c, Call::AllocObject { .. })),
            dev.count(|c| matches!(c, Call::Free { .. }))
        );
    }

    #[test]
    fn test_skips_old_generations() {
        let dev = SoftDevice::new(5);
        let outcome = init_render_state(&dev, &dev).unwrap();

        assert_eq!(outcome, PrimeOutcome::Skipped { generation: 5 });
        assert!(dev.calls().is_empty());
        assert_released(&dev);
    }

    #[test]
    fn test_unimplemented_generation_is_vacuous() {
        let dev = SoftDevice::new(9);
        let mut primer = RenderStatePrimer::new(&dev, &dev);
        let outcome = primer.run().unwrap();

        assert_eq!(outcome, PrimeOutcome::Unimplemented { generation: 9 });
        assert_eq!(primer.state(), PrimerState::Released);
        assert_eq!(dev.count(|c| matches!(c, Call::Dispatch { .. })), 0);
        assert_eq!(dev.count(|c| matches!(c, Call::AllocObject { .. })), 1);
        assert_released(&dev);
    }

    #[test]
    fn test_known_generations_prime() {
        for generation in 6..=8 {
            let dev = SoftDevice::new(generation);
            let mut primer = RenderStatePrimer::new(&dev, &dev);
            let outcome = primer.run().unwrap();

            let PrimeOutcome::Primed { generation: render_gen, len, .. } = outcome else {
                panic!("gen {} not primed: {:?}", generation, outcome);
            };
            assert_eq!(render_gen.number(), generation);
            assert_eq!(len, 4);
            assert_eq!(primer.state(), PrimerState::Released);
            assert_eq!(dev.executed(), [MI_BATCH_BUFFER_END]);
            assert_released(&dev);
        }
    }

    #[test]
    fn test_call_order() {
        let dev = SoftDevice::new(7);
        init_render_state(&dev, &dev).unwrap();

        let calls = dev.calls();
        let kinds: Vec<Step> = calls.iter().map(Call::step).collect();
        assert_eq!(
            kinds,
            [
                Step::Alloc,
                Step::Pin,
                Step::Map,
                Step::Dispatch,
                Step::Flush,
                Step::Request,
                Step::Wait,
                Step::Unmap,
                Step::Unpin,
                Step::Free,
            ]
        );

        let pinned = calls.iter().find_map(|c| match c {
            Call::Pin { addr, .. } => Some(*addr),
            _ => None,
        });
        let dispatched = calls.iter().find_map(|c| match c {
            Call::Dispatch { addr, len, flags } => Some((*addr, *len, *flags)),
            _ => None,
        });
        assert_eq!(dispatched, Some((pinned.unwrap(), 4, DispatchFlags::SECURE)));
        assert!(matches!(calls[0], Call::AllocObject { size } if size == ByteSize::KIB_4));
    }

    #[test]
    fn test_release_after_wait_failure() {
        let dev = SoftDevice::new(8);
        dev.fail_at(Step::Wait, Error::WaitFailed);

        let mut primer = RenderStatePrimer::new(&dev, &dev);
        assert_eq!(primer.run(), Err(Error::WaitFailed));
        assert_eq!(primer.state(), PrimerState::Failed);

        let calls = dev.calls();
        let tail: Vec<Step> = calls.iter().rev().take(3).map(Call::step).collect();
        assert_eq!(tail, [Step::Free, Step::Unpin, Step::Unmap]);
        assert_released(&dev);
    }

    #[test]
    fn test_hung_engine_times_out() {
        let dev = SoftDevice::with_spin_limit(6, 64);
        dev.hang();

        assert_eq!(init_render_state(&dev, &dev), Err(Error::WaitTimeout));
        assert_eq!(dev.executed(), [MI_BATCH_BUFFER_END]);
        assert_released(&dev);
    }

    #[test]
    fn test_submission_failures_propagate() {
        for (step, err) in [
            (Step::Dispatch, Error::DispatchFailed),
            (Step::Flush, Error::FlushFailed),
            (Step::Request, Error::RequestFailed),
        ] {
            let dev = SoftDevice::new(6);
            dev.fail_at(step, err);

            assert_eq!(init_render_state(&dev, &dev), Err(err));
            assert_eq!(dev.count(|c| matches!(c, Call::Wait { .. })), 0);
            assert_released(&dev);
        }
    }

    #[test]
    fn test_allocation_failures_unwind() {
        let dev = SoftDevice::new(7);
        dev.fail_at(Step::Alloc, Error::AllocationFailed);
        assert_eq!(init_render_state(&dev, &dev), Err(Error::AllocationFailed));
        assert_eq!(dev.calls().len(), 1);

        let dev = SoftDevice::new(7);
        dev.fail_at(Step::Pin, Error::PinFailed);
        assert_eq!(init_render_state(&dev, &dev), Err(Error::PinFailed));
        let steps: Vec<Step> = dev.calls().iter().map(Call::step).collect();
        assert_eq!(steps, [Step::Alloc, Step::Pin, Step::Free]);
        assert_released(&dev);

        let dev = SoftDevice::new(7);
        dev.fail_at(Step::Map, Error::MappingFailed);
        assert_eq!(init_render_state(&dev, &dev), Err(Error::MappingFailed));
        let steps: Vec<Step> = dev.calls().iter().map(Call::step).collect();
        assert_eq!(steps, [Step::Alloc, Step::Pin, Step::Map, Step::Unpin, Step::Free]);
        assert_released(&dev);
    }

    #[test]
    fn test_faulted_batch_is_not_submitted() {
        let dev = SoftDevice::new(8);
        let config = RenderStateConfig {
            batch_size: ByteSize::from_bytes(2),
            alignment: 4096,
        };
        let mut primer = RenderStatePrimer::with_config(&dev, &dev, config);

        // Too small for a single dword
        assert_eq!(primer.run(), Err(Error::OutOfSpace));
        assert_eq!(primer.state(), PrimerState::Failed);
        assert_eq!(dev.count(|c| matches!(c, Call::Dispatch { .. })), 0);
        assert_released(&dev);
    }

    #[test]
    fn test_object_batch_view() {
        let dev = SoftDevice::new(7);
        let mut so = RenderStateObject::alloc(&dev, &RenderStateConfig::default()).unwrap();
        assert!(so.is_empty());
        let addr = so.gpu_addr();

        {
            let mut batch = so.batch();
            assert_eq!(batch.capacity(), 4096);
            assert_eq!(batch.gpu_addr(), addr);
            let offset = batch.state_copy(&[1, 2, 3, 4], 16).unwrap();
            batch.emit_reloc(offset).unwrap();
        }

        // Regenerating rebinds the view from scratch
        assert_eq!(so.generate(RenderGen::Gen8), Ok(4));
        assert_eq!(so.len(), 4);
        drop(so);
        assert_released(&dev);
    }
}
