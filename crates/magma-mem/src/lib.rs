//! # MAGMA Memory Management
//!
//! Buffer objects and the allocation interface used by the command layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      MAGMA Memory System                        │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                     BoAllocator                           │  │
//! │  │          (create, map, GPU address assignment)            │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                  │
//! │  ┌─────────────────┐  ┌──────┴────────┐                         │
//! │  │ SysmemAllocator │  │ BufferObject  │──▶ fence + access       │
//! │  │ (GART aperture) │  │ (Rc handle)   │    tracking             │
//! │  └─────────────────┘  └───────────────┘                         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Buffer objects are single-threaded: handles are `Rc`-based and each
//! holder owns one strong reference.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod allocator;
pub mod bo;

// Re-exports
pub use allocator::{BoAllocator, SysmemAllocator, SysmemConfig, SysmemStats};
pub use bo::{BoFlags, BoInfo, BufferId, BufferObject, Domain};
