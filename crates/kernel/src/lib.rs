//! # ember-kernel
//!
//! A preemptive, priority-based real-time kernel for single-core
//! microcontrollers without memory protection.
//!
//! ## Module Overview
//! - [`kernel`]    – Kernel instance, dispatch, tick and interrupt entry.
//! - [`thread`]    – Threads, priorities and the thread API.
//! - [`mutex`]     – Mutexes with recursion and priority inheritance.
//! - [`semaphore`] – Counting semaphores.
//! - [`flags`]     – Event flag groups and per-thread flags.
//! - [`pool`]      – Fixed-block memory pool; [`mempool`] wraps it as a kernel object.
//! - [`queue`]     – Priority message queues.
//! - [`timer`]     – Software timers serviced by the timer thread.
//! - [`isr`]       – Interrupt post-processing queue.
//! - [`critical`]  – Nestable critical sections.
//! - [`atomic`]    – Atomic words with exclusive-access and guarded backends.
//! - [`port`]      – Processor port seam, host simulator and Cortex-M port.
//!
//! On a host the kernel never runs thread code itself. Blocking calls return
//! [`core::task::Poll::Pending`] when they suspend the caller; the outcome is
//! collected later with [`Kernel::take_wait_result`], the way a real port
//! would write the return register of the resumed thread.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod atomic;
pub mod config;
pub mod critical;
pub mod error;
pub mod flags;
pub mod isr;
pub mod kernel;
mod list;
pub mod mempool;
pub mod mutex;
pub mod pool;
pub mod port;
pub mod queue;
mod scheduler;
pub mod semaphore;
pub mod slots;
mod sync;
pub mod thread;
pub mod timer;
pub mod trace;

pub use config::{KernelConfig, KernelConfigBuilder, ISR_QUEUE_DEPTH, MAX_MESSAGE_SIZE, MAX_PRIORITY};
pub use critical::CriticalGuard;
pub use error::{FatalError, KernelError, KernelResult};
pub use flags::{EventFlagsId, FlagOptions};
pub use kernel::{Kernel, KernelBuilder, KernelStatus, Timeout, WaitValue};
pub use mempool::PoolId;
pub use mutex::{MutexConfig, MutexId};
pub use pool::{Block, MemoryPool, PoolStats};
pub use port::{Port, SimPort};
pub use queue::{Message, QueueId};
pub use semaphore::SemaphoreId;
pub use slots::Key;
pub use thread::{Priority, StackSource, ThreadConfig, ThreadEntry, ThreadId, ThreadState, WaitReason};
pub use timer::{TimerId, TimerKind};
pub use trace::TraceHook;

#[cfg(test)]
mod tests;
