use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::Port;
use crate::sync::Mutex;
use crate::thread::{ThreadEntry, ThreadId};

/// Bytes of "register frame" [`SimPort`] writes at the top of each stack.
pub const SIM_FRAME_SIZE: usize = 32;

const FRAME_MAGIC: u32 = 0x5349_4D46;

/// Host port: keeps an interrupt-enable flag and a log of every switch.
pub struct SimPort {
    interrupts: AtomicBool,
    idle_calls: AtomicUsize,
    switches: Mutex<Vec<(Option<ThreadId>, ThreadId)>>,
}

impl SimPort {
    pub fn new() -> Self {
        Self {
            interrupts: AtomicBool::new(true),
            idle_calls: AtomicUsize::new(0),
            switches: Mutex::new(Vec::new()),
        }
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn switch_log(&self) -> Vec<(Option<ThreadId>, ThreadId)> {
        self.switches.lock().clone()
    }

    pub fn switch_count(&self) -> usize {
        self.switches.lock().len()
    }

    pub fn last_switch(&self) -> Option<(Option<ThreadId>, ThreadId)> {
        self.switches.lock().last().copied()
    }

    pub fn clear_switch_log(&self) {
        self.switches.lock().clear();
    }

    pub fn idle_calls(&self) -> usize {
        self.idle_calls.load(Ordering::SeqCst)
    }
}

impl Default for SimPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for SimPort {
    fn disable_interrupts(&self) -> bool {
        self.interrupts.swap(false, Ordering::SeqCst)
    }

    fn restore_interrupts(&self, enabled: bool) {
        self.interrupts.store(enabled, Ordering::SeqCst);
    }

    fn prepare_stack(&self, thread: ThreadId, stack: &mut [u8], entry: &ThreadEntry) {
        let len = stack.len();
        if len < SIM_FRAME_SIZE + 4 {
            return;
        }
        let (pc, arg) = match entry {
            ThreadEntry::User { entry, arg } => (*entry as usize, *arg),
            ThreadEntry::Idle => (0, 0),
            ThreadEntry::TimerService => (1, 0),
        };
        let frame = &mut stack[len - SIM_FRAME_SIZE..];
        frame.fill(0);
        frame[0..4].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
        frame[4..8].copy_from_slice(&thread.key().to_bytes());
        frame[8..16].copy_from_slice(&(pc as u64).to_le_bytes());
        frame[16..24].copy_from_slice(&(arg as u64).to_le_bytes());
    }

    fn switch_context(&self, from: Option<ThreadId>, to: ThreadId) {
        self.switches.lock().push((from, to));
    }

    fn idle(&self) {
        self.idle_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::Key;

    #[test]
    fn interrupt_flag_follows_disable_and_restore() {
        let port = SimPort::new();
        assert!(port.disable_interrupts());
        assert!(!port.interrupts_enabled());
        assert!(!port.disable_interrupts());
        port.restore_interrupts(true);
        assert!(port.interrupts_enabled());
    }

    #[test]
    fn frame_lands_at_top_of_stack() {
        let port = SimPort::new();
        let mut stack = vec![0xCCu8; 128];
        let id = ThreadId(Key::new(2, 0));
        port.prepare_stack(id, &mut stack, &ThreadEntry::Idle);

        assert!(stack[..128 - SIM_FRAME_SIZE].iter().all(|b| *b == 0xCC));
        assert_eq!(&stack[96..100], &FRAME_MAGIC.to_le_bytes());
    }
}
