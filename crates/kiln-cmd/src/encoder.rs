//! # Render-State Encoders
//!
//! Generation-specific batch contents for render-state priming.
//!
//! Each known generation has one generator. They currently record only the
//! batch terminator; pipeline setup goes in front of it as it is added.

use kiln_core::Result;

use crate::batch::BatchBuffer;
use crate::mi::MI_BATCH_BUFFER_END;

/// Oldest generation with a render-state batch
pub const MIN_RENDER_GEN: u32 = 6;

/// Newest generation with a render-state batch
pub const MAX_RENDER_GEN: u32 = 8;

// =============================================================================
// GENERATIONS
// =============================================================================

/// Generations with a render-state generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RenderGen {
    /// Sandybridge
    Gen6 = 6,
    /// Ivybridge / Haswell
    Gen7 = 7,
    /// Broadwell
    Gen8 = 8,
}

/// How a reported generation is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenSupport {
    /// Too old to need render-state priming
    Unsupported(u32),
    /// Has a generator
    Known(RenderGen),
    /// Newer than every generator
    Unimplemented(u32),
}

impl GenSupport {
    /// Classify a generation number
    pub const fn from_generation(generation: u32) -> Self {
        match generation {
            g if g < MIN_RENDER_GEN => Self::Unsupported(g),
            g if g > MAX_RENDER_GEN => Self::Unimplemented(g),
            g => Self::Known(RenderGen::ALL[(g - MIN_RENDER_GEN) as usize]),
        }
    }
}

type GenerateFn = fn(&mut BatchBuffer<'_>) -> Result<()>;

impl RenderGen {
    /// Every generator, indexed by `number() - MIN_RENDER_GEN`
    pub const ALL: [Self; (MAX_RENDER_GEN - MIN_RENDER_GEN + 1) as usize] =
        [Self::Gen6, Self::Gen7, Self::Gen8];

    /// Generation number
    pub const fn number(self) -> u32 {
        self as u32
    }

    /// Encoder name for logs
    pub const fn name(self) -> &'static str {
        match self {
            Self::Gen6 => "gen6",
            Self::Gen7 => "gen7",
            Self::Gen8 => "gen8",
        }
    }

    const fn generator(self) -> GenerateFn {
        match self {
            Self::Gen6 => gen6_generate_batch,
            Self::Gen7 => gen7_generate_batch,
            Self::Gen8 => gen8_generate_batch,
        }
    }

    /// Record this generation's render-state batch into `batch`
    pub fn generate(self, batch: &mut BatchBuffer<'_>) -> Result<()> {
        (self.generator())(batch)
    }
}

// =============================================================================
// GENERATORS
// =============================================================================

fn gen6_generate_batch(batch: &mut BatchBuffer<'_>) -> Result<()> {
    batch.emit_dword(MI_BATCH_BUFFER_END)
}

fn gen7_generate_batch(batch: &mut BatchBuffer<'_>) -> Result<()> {
    batch.emit_dword(MI_BATCH_BUFFER_END)
}

fn gen8_generate_batch(batch: &mut BatchBuffer<'_>) -> Result<()> {
    batch.emit_dword(MI_BATCH_BUFFER_END)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{Error, GpuAddr};

    #[test]
    fn test_classification() {
        assert_eq!(GenSupport::from_generation(2), GenSupport::Unsupported(2));
        assert_eq!(GenSupport::from_generation(5), GenSupport::Unsupported(5));
        assert_eq!(GenSupport::from_generation(6), GenSupport::Known(RenderGen::Gen6));
        assert_eq!(GenSupport::from_generation(7), GenSupport::Known(RenderGen::Gen7));
        assert_eq!(GenSupport::from_generation(8), GenSupport::Known(RenderGen::Gen8));
        assert_eq!(
            GenSupport::from_generation(MAX_RENDER_GEN + 1),
            GenSupport::Unimplemented(MAX_RENDER_GEN + 1)
        );
    }

    #[test]
    fn test_table_matches_range() {
        for (i, render_gen) in RenderGen::ALL.iter().enumerate() {
            assert_eq!(render_gen.number(), MIN_RENDER_GEN + i as u32);
        }
        assert_eq!(
            GenSupport::from_generation(MAX_RENDER_GEN),
            GenSupport::Known(RenderGen::Gen8)
        );
        assert_eq!(
            GenSupport::from_generation(MIN_RENDER_GEN - 1),
            GenSupport::Unsupported(MIN_RENDER_GEN - 1)
        );
    }

    #[test]
    fn test_every_generator_terminates() {
        for render_gen in RenderGen::ALL {
            let mut mem = [0u8; 4096];
            let mut batch = BatchBuffer::new(&mut mem, GpuAddr::new(0x1000));
            render_gen.generate(&mut batch).unwrap();

            assert_eq!(batch.used(), 4, "{}", render_gen.name());
            assert!(batch.instructions().eq([MI_BATCH_BUFFER_END]));
            assert_eq!(batch.state_used(), 0);
        }
    }

    #[test]
    fn test_generator_reports_fault() {
        let mut mem = [0u8; 2];
        let mut batch = BatchBuffer::new(&mut mem, GpuAddr::new(0x1000));
        assert_eq!(RenderGen::Gen7.generate(&mut batch), Err(Error::OutOfSpace));
    }
}
