//! # KILN Core
//!
//! Foundational types, error handling and collaborator traits for batch
//! buffer construction and render-state priming.
//!
//! Everything the command crate needs from the rest of the driver (object
//! allocation, dispatch, cache control, completion tracking) is expressed
//! here as a trait, so the batch code stays hardware-agnostic.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        kiln-core                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Traits    │  │   Types     │  │     Error           │  │
//! │  │ (Allocator, │  │ (GpuAddr,   │  │   Handling          │  │
//! │  │   Engine)   │  │  Seqno)     │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod sync;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use error::{Error, Result};
pub use sync::SeqnoFence;
pub use traits::*;
pub use types::*;
