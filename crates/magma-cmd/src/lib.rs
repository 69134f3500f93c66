//! # MAGMA Command System
//!
//! Push buffers: batching command words, tracking the buffers each batch
//! references, and submitting batches to a GPFIFO queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                    Command Submission Pipeline                    │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐     │
//! │  │   Buffer     │    │    Push      │    │  Record Queue    │     │
//! │  │   Context    │───▶│   Buffer     │───▶│  (krec chain)    │     │
//! │  │  (bufctx)    │    │  (cursor)    │    │                  │     │
//! │  └──────────────┘    └──────┬───────┘    └────────┬─────────┘     │
//! │                             │                     │               │
//! │                     ┌───────▼───────┐    ┌────────▼─────────┐     │
//! │                     │    Client     │    │    GpuQueue      │     │
//! │                     │ (kref table)  │    │ (GPFIFO entries) │     │
//! │                     └───────────────┘    └──────────────────┘     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Submission Flow
//!
//! 1. The client reserves space and writes command words
//! 2. Buffers used by the commands are referenced in the current record
//! 3. A flush turns the record into GPFIFO entries and kicks the queue
//! 4. The queue's fence is stamped on every referenced buffer
//! 5. A cache flush and barrier precede the next batch

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod bufctx;
pub mod channel;
pub mod client;
pub mod cmdlist;
pub mod gpfifo;
pub mod pushbuf;
pub mod record;
pub mod soft;
pub mod submit;

// Re-exports
pub use bufctx::BufferContext;
pub use channel::{FIFO_CHANNEL_CLASS, FifoChannel};
pub use client::{Client, KrefOwner, PushbufId};
pub use cmdlist::CmdlistLayout;
pub use gpfifo::{EntryFlags, GpFifoEntry, GpuQueue, QueueFactory, QueueStatus};
pub use pushbuf::{CommandStream, KickNotify, PushRef, Pushbuf, PushbufConfig, PushbufStats};
pub use record::{DomainLimits, MAX_BUFFERS, MAX_PUSH};
pub use soft::{SoftQueue, SoftQueueConfig, SoftQueueFactory};
