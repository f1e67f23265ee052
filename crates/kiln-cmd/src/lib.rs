//! # KILN Command System
//!
//! Batch buffer construction and render-state priming.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                    Render-State Submission                        │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐     │
//! │  │  Generation  │    │    Batch     │    │  Render Engine   │     │
//! │  │   Encoder    │───▶│   Buffer     │───▶│  (dispatch ring) │     │
//! │  │ (gen6/7/8)   │    │ (instr|state)│    │                  │     │
//! │  └──────────────┘    └──────────────┘    └────────┬─────────┘     │
//! │                                                   │               │
//! │                                          ┌────────▼─────────┐     │
//! │                                          │  Seqno Fence     │     │
//! │                                          │  (completion)    │     │
//! │                                          └──────────────────┘     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Submission Flow
//!
//! 1. A pinned, mapped object is allocated for the batch
//! 2. The generation encoder records instructions into a `BatchBuffer`
//! 3. The batch is dispatched with secure privilege
//! 4. Caches are flushed and a request is queued behind it
//! 5. The caller blocks on the request's seqno, then the object is released

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod batch;
pub mod encoder;
pub mod mi;
pub mod render_state;

// Re-exports
pub use batch::{BatchBuffer, StateAlloc};
pub use encoder::{GenSupport, RenderGen};
pub use render_state::{
    PrimeOutcome, PrimerState, RenderStateConfig, RenderStateObject, RenderStatePrimer,
    init_render_state,
};
