//! # MAGMA Core
//!
//! Foundational types shared by the MAGMA push buffer crates.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      magma-core                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Types     │  │    Sync     │  │     Error           │  │
//! │  │ (GpuAddr,   │  │  (Fence,    │  │   Handling          │  │
//! │  │  Handle)    │  │  Syncpoint) │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use error::{Error, Result};
pub use sync::{Fence, Syncpoint};
pub use types::*;

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::assert_impl_all!(GpuAddr: Send, Sync, Copy);
static_assertions::assert_impl_all!(ByteSize: Send, Sync, Copy);
static_assertions::assert_impl_all!(Fence: Send, Sync, Copy);
static_assertions::assert_impl_all!(BufferHandle: Send, Sync, Copy);
static_assertions::assert_eq_size!(Fence, u64);
