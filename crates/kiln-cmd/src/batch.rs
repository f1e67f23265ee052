//! # Batch Buffer
//!
//! Split-arena view over one host/device mapped region.
//!
//! ```text
//!  0                      state_base                       capacity
//!  ├──────────────────────────┼────────────────────────────────┤
//!  │ instructions ──▶         │ state ──▶                    │x│
//!  └──────────────────────────┴────────────────────────────────┘
//!        instr cursor               state cursor        reserved byte
//! ```
//!
//! Instructions grow up from offset 0, state blobs grow up from the midpoint.
//! The midpoint never moves, so the zones cannot collide. The last byte of
//! the region is never handed out.
//!
//! Failures are sticky: the first `OutOfSpace` or `InvalidArgument` is
//! recorded and every later call fails with it, leaving the cursors and
//! the recorded prefix untouched. Callers can emit speculatively and check
//! [`BatchBuffer::status`] once before submitting.

use core::ptr::NonNull;

use kiln_core::{Error, GpuAddr, Result, align_up_u32};

/// Size of one instruction dword
pub const DWORD_SIZE: u32 = 4;

// =============================================================================
// STATE ALLOCATION
// =============================================================================

/// A zeroed block carved from the state zone
#[derive(Debug)]
pub struct StateAlloc<'b> {
    offset: u32,
    data: &'b mut [u8],
}

impl<'b> StateAlloc<'b> {
    /// Offset of the block from the start of the buffer
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check for a zero-sized block
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Host pointer to the start of the block
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    /// Block contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut *self.data
    }

    /// Consume the handle, keeping the borrow of the bytes
    pub fn into_slice(self) -> &'b mut [u8] {
        self.data
    }
}

// =============================================================================
// BATCH BUFFER
// =============================================================================

/// Instruction stream and state arena sharing one mapped region
#[derive(Debug)]
pub struct BatchBuffer<'a> {
    /// Host mapping of the region
    mem: &'a mut [u8],
    /// Usable size in bytes
    size: u32,
    /// Device address of offset 0
    gpu_addr: GpuAddr,
    /// Boundary between the two zones
    state_base: u32,
    /// Next instruction write offset
    instr: u32,
    /// Next state allocation offset
    state: u32,
    /// Sticky fault
    err: Option<Error>,
}

impl<'a> BatchBuffer<'a> {
    /// Bind a buffer to `mem`, mapped at `gpu_addr` on the device
    pub fn new(mem: &'a mut [u8], gpu_addr: GpuAddr) -> Self {
        let size = u32::try_from(mem.len()).unwrap_or(u32::MAX);
        let state_base = Self::state_start(size);

        Self {
            mem,
            size,
            gpu_addr,
            state_base,
            instr: 0,
            state: state_base,
            err: None,
        }
    }

    /// Bind a buffer to a raw host mapping
    ///
    /// # Safety
    /// - `ptr` must be valid for reads and writes of `len` bytes for `'a`
    /// - nothing else may access the region while the buffer is alive
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize, gpu_addr: GpuAddr) -> Self {
        // SAFETY: Caller guarantees validity and exclusivity of the region
        let mem = unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), len) };
        Self::new(mem, gpu_addr)
    }

    /// Rebind to a (possibly different) region, rewinding both zones and
    /// clearing any fault
    pub fn reset(&mut self, mem: &'a mut [u8], gpu_addr: GpuAddr) {
        *self = Self::new(mem, gpu_addr);
    }

    fn state_start(size: u32) -> u32 {
        // size / 2 + 3 cannot overflow
        let mid = (size >> 1).next_multiple_of(DWORD_SIZE);
        mid.min(size)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Total size of the bound region
    pub fn capacity(&self) -> u32 {
        self.size
    }

    /// Device address of the region
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// Offset where the state zone begins
    pub fn state_base(&self) -> u32 {
        self.state_base
    }

    /// Bytes of instructions recorded; this is the length to dispatch
    pub fn used(&self) -> u32 {
        self.instr
    }

    /// Bytes consumed in the state zone, alignment padding included
    pub fn state_used(&self) -> u32 {
        self.state - self.state_base
    }

    /// Bytes left in the instruction zone
    pub fn instruction_space(&self) -> u32 {
        self.state_base - self.instr
    }

    /// `Ok` while no fault has been recorded
    pub fn status(&self) -> Result<()> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Check for a recorded fault
    pub fn is_faulted(&self) -> bool {
        self.err.is_some()
    }

    /// Whole region, including bytes not yet written
    pub fn as_bytes(&self) -> &[u8] {
        &self.mem[..self.size as usize]
    }

    /// Recorded instruction dwords
    pub fn instructions(&self) -> impl Iterator<Item = u32> + '_ {
        self.mem[..self.instr as usize]
            .chunks_exact(DWORD_SIZE as usize)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    }

    /// Offset of `ptr` from the start of the region
    ///
    /// Returns `None` for pointers outside the region.
    pub fn offset_of(&self, ptr: *const u8) -> Option<u32> {
        let base = self.mem.as_ptr() as usize;
        let addr = ptr as usize;
        if addr < base || addr - base >= self.size as usize {
            return None;
        }
        Some((addr - base) as u32)
    }

    fn fail<T>(&mut self, err: Error) -> Result<T> {
        log::debug!(
            "batch @ {} fault {:?} (instr {}/{}, state {}/{})",
            self.gpu_addr,
            err,
            self.instr,
            self.state_base,
            self.state,
            self.size
        );
        self.err = Some(err);
        Err(err)
    }

    // =========================================================================
    // Instruction zone
    // =========================================================================

    /// Append one instruction dword
    pub fn emit_dword(&mut self, dword: u32) -> Result<()> {
        self.status()?;

        if self.instruction_space() < DWORD_SIZE {
            return self.fail(Error::OutOfSpace);
        }

        let at = self.instr as usize;
        self.mem[at..at + DWORD_SIZE as usize].copy_from_slice(&dword.to_le_bytes());
        self.instr += DWORD_SIZE;
        Ok(())
    }

    /// Append several dwords, stopping at the first failure
    pub fn emit_dwords(&mut self, dwords: &[u32]) -> Result<()> {
        dwords.iter().try_for_each(|&dw| self.emit_dword(dw))
    }

    /// Append the device address of offset `delta` within this buffer
    ///
    /// Writes the low 32 bits of the address, which is the full address on
    /// 32-bit GTT generations.
    pub fn emit_reloc(&mut self, delta: u32) -> Result<()> {
        self.status()?;

        if delta >= self.size {
            return self.fail(Error::InvalidArgument);
        }

        let addr = self.gpu_addr + u64::from(delta);
        self.emit_dword(addr.lower_32())
    }

    /// Append the 64-bit device address of offset `delta`, low dword first
    pub fn emit_reloc64(&mut self, delta: u32) -> Result<()> {
        self.status()?;

        if delta >= self.size {
            return self.fail(Error::InvalidArgument);
        }
        if self.instruction_space() < 2 * DWORD_SIZE {
            return self.fail(Error::OutOfSpace);
        }

        let addr = self.gpu_addr + u64::from(delta);
        self.emit_dword(addr.lower_32())?;
        self.emit_dword(addr.upper_32())
    }

    // =========================================================================
    // State zone
    // =========================================================================

    /// Allocate `size` zeroed bytes aligned to `align` in the state zone
    ///
    /// `align` must be a power of two.
    pub fn state_alloc(&mut self, size: u32, align: u32) -> Result<StateAlloc<'_>> {
        self.status()?;

        if !align.is_power_of_two() {
            return self.fail(Error::InvalidArgument);
        }

        let end = align_up_u32(self.state, align)
            .and_then(|offset| offset.checked_add(size).map(|end| (offset, end)));
        let (offset, end) = match end {
            // At least one byte past the allocation must remain
            Some((offset, end)) if end < self.size => (offset, end),
            _ => return self.fail(Error::OutOfSpace),
        };

        self.state = end;

        let data = &mut self.mem[offset as usize..end as usize];
        data.fill(0);
        Ok(StateAlloc { offset, data })
    }

    /// Copy `bytes` into a fresh state allocation, returning its offset
    pub fn state_copy(&mut self, bytes: &[u8], align: u32) -> Result<u32> {
        self.status()?;

        let Ok(size) = u32::try_from(bytes.len()) else {
            return self.fail(Error::OutOfSpace);
        };

        let mut block = self.state_alloc(size, align)?;
        block.as_mut_slice().copy_from_slice(bytes);
        Ok(block.offset())
    }

    /// Copy a plain-old-data state structure, returning its offset
    pub fn state_copy_pod<T: bytemuck::Pod>(&mut self, value: &T, align: u32) -> Result<u32> {
        self.state_copy(bytemuck::bytes_of(value), align)
    }
}
