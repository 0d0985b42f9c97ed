use cortex_m::interrupt;
use cortex_m::peripheral::SCB;
use cortex_m::register::primask;
use heapless::FnvIndexMap;

use super::Port;
use crate::atomic::{Atomic32, AtomicWord};
use crate::slots::Key;
use crate::sync::Mutex;
use crate::thread::{ThreadEntry, ThreadId};

const XPSR_THUMB: u32 = 0x0100_0000;
/// Hardware-stacked frame plus R4-R11.
const FRAME_WORDS: usize = 16;
const NO_THREAD: u32 = u32::MAX;

/// ARMv7-M port: PRIMASK masking and PendSV-driven switches.
///
/// `switch_context` only publishes the outgoing and incoming thread and pends
/// PendSV; the board's PendSV handler saves R4-R11 and swaps PSP using
/// [`CortexMPort::pending_switch`] and [`CortexMPort::initial_sp`].
pub struct CortexMPort {
    system_entry: fn(usize),
    thread_exit: fn(),
    from: Atomic32,
    to: Atomic32,
    initial_sp: Mutex<FnvIndexMap<u16, usize, 64>>,
}

impl CortexMPort {
    /// `system_entry` runs the idle loop for argument 0 and the timer service
    /// loop for argument 1. `thread_exit` is loaded into LR of every thread.
    pub fn new(system_entry: fn(usize), thread_exit: fn()) -> Self {
        Self {
            system_entry,
            thread_exit,
            from: Atomic32::new(NO_THREAD),
            to: Atomic32::new(NO_THREAD),
            initial_sp: Mutex::new(FnvIndexMap::new()),
        }
    }

    /// Threads published by the last `switch_context`.
    pub fn pending_switch(&self) -> (Option<Key>, Option<Key>) {
        (unpack(self.from.load()), unpack(self.to.load()))
    }

    /// Stack pointer of a freshly prepared frame.
    pub fn initial_sp(&self, thread: ThreadId) -> Option<usize> {
        self.initial_sp.lock().remove(&thread.index())
    }
}

fn pack(key: Key) -> u32 {
    u32::from_le_bytes(key.to_bytes())
}

fn unpack(raw: u32) -> Option<Key> {
    (raw != NO_THREAD).then(|| Key::from_bytes(&raw.to_le_bytes())).flatten()
}

impl Port for CortexMPort {
    fn disable_interrupts(&self) -> bool {
        let was_active = primask::read().is_active();
        interrupt::disable();
        was_active
    }

    fn restore_interrupts(&self, enabled: bool) {
        if enabled {
            // SAFETY: only re-enables what `disable_interrupts` found enabled.
            unsafe { interrupt::enable() }
        }
    }

    fn prepare_stack(&self, thread: ThreadId, stack: &mut [u8], entry: &ThreadEntry) {
        let (pc, r0) = match entry {
            ThreadEntry::User { entry, arg } => (*entry as usize as u32, *arg as u32),
            ThreadEntry::Idle => (self.system_entry as usize as u32, 0),
            ThreadEntry::TimerService => (self.system_entry as usize as u32, 1),
        };

        let top = (stack.as_ptr() as usize + stack.len()) & !7;
        let frame_start = top - FRAME_WORDS * 4 - stack.as_ptr() as usize;
        let Some(frame) = stack.get_mut(frame_start..frame_start + FRAME_WORDS * 4) else {
            return;
        };

        let mut words = [0u32; FRAME_WORDS];
        // R4-R11 occupy words 0..8; the hardware frame follows.
        words[8] = r0;
        words[13] = self.thread_exit as usize as u32;
        words[14] = pc | 1;
        words[15] = XPSR_THUMB;
        for (chunk, word) in frame.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }

        let sp = frame.as_ptr() as usize;
        let _ = self.initial_sp.lock().insert(thread.index(), sp);
    }

    fn switch_context(&self, from: Option<ThreadId>, to: ThreadId) {
        self.from.store(from.map_or(NO_THREAD, |id| pack(id.key())));
        self.to.store(pack(to.key()));
        SCB::set_pendsv();
    }

    fn idle(&self) {
        cortex_m::asm::wfi();
    }
}
