//! Processor port seam.
//!
//! The kernel never touches hardware directly. Interrupt masking, initial
//! stack frames and the actual register save/restore go through [`Port`].
//! [`SimPort`] drives the kernel on a host and records what a real port would
//! have done; `CortexMPort` (feature `cortex-m`) targets ARMv7-M.

#[cfg(all(feature = "cortex-m", target_arch = "arm"))]
mod cortex_m;
mod sim;

#[cfg(all(feature = "cortex-m", target_arch = "arm"))]
pub use self::cortex_m::CortexMPort;
pub use sim::{SimPort, SIM_FRAME_SIZE};

use crate::thread::{ThreadEntry, ThreadId};

pub trait Port: Send + Sync {
    /// Masks interrupts and returns whether they were enabled before.
    fn disable_interrupts(&self) -> bool;

    /// Restores the state returned by [`Port::disable_interrupts`].
    fn restore_interrupts(&self, enabled: bool);

    /// Builds the initial frame so the first switch to `thread` starts at
    /// `entry`. The canary and watermark fill are already in place.
    fn prepare_stack(&self, thread: ThreadId, stack: &mut [u8], entry: &ThreadEntry);

    /// Saves `from` (if any) and resumes `to`.
    fn switch_context(&self, from: Option<ThreadId>, to: ThreadId);

    /// Called when the idle thread has nothing else to do.
    fn idle(&self);
}
