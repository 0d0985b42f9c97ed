//! Record identifiers emitted by the kernel.
//!
//! Ids are grouped by subsystem in blocks of sixteen so a host decoder can
//! route on the high nibble.

/// Kernel lifecycle and tick records.
pub mod kernel {
    /// Kernel started; payload is the initial thread count.
    pub const START: u8 = 1;
    /// Tick processed; payload is the low 32 bits of the tick counter.
    pub const TICK: u8 = 2;
    /// Scheduler locked; payload is the new lock depth.
    pub const LOCK: u8 = 3;
    /// Scheduler unlocked; payload is the remaining lock depth.
    pub const UNLOCK: u8 = 4;
    /// Fatal error; payload is the fatal code followed by detail bytes.
    pub const FATAL: u8 = 5;
    /// Idle thread selected.
    pub const IDLE: u8 = 6;
}

/// Thread records. Payloads start with the thread slot index (u16 LE).
pub mod thread {
    pub const CREATE: u8 = 16;
    /// Context switch; payload is `from` (0xFFFF when none) then `to`.
    pub const SWITCH: u8 = 17;
    pub const READY: u8 = 18;
    /// Thread blocked; payload carries the wait reason code.
    pub const BLOCK: u8 = 19;
    pub const TIMEOUT: u8 = 20;
    pub const EXIT: u8 = 21;
    pub const TERMINATE: u8 = 22;
    pub const JOIN: u8 = 23;
    /// Effective priority changed; payload is old then new priority.
    pub const PRIORITY: u8 = 24;
    pub const RECLAIM: u8 = 25;
}

/// Mutex records. Payloads start with the mutex slot index.
pub mod mutex {
    pub const CREATE: u8 = 32;
    pub const ACQUIRE: u8 = 33;
    pub const RELEASE: u8 = 34;
    /// Priority inherited; payload is mutex, owner, new effective priority.
    pub const INHERIT: u8 = 35;
    pub const DELETE: u8 = 36;
}

/// Semaphore records.
pub mod sem {
    pub const CREATE: u8 = 48;
    pub const ACQUIRE: u8 = 49;
    pub const RELEASE: u8 = 50;
    pub const DELETE: u8 = 51;
}

/// Event and thread flag records.
pub mod flags {
    pub const CREATE: u8 = 64;
    pub const SET: u8 = 65;
    pub const CLEAR: u8 = 66;
    pub const WAKE: u8 = 67;
    pub const DELETE: u8 = 68;
    pub const THREAD_SET: u8 = 69;
}

/// Memory pool records.
pub mod pool {
    pub const CREATE: u8 = 80;
    pub const ALLOC: u8 = 81;
    pub const FREE: u8 = 82;
    pub const DELETE: u8 = 83;
}

/// Message queue records.
pub mod queue {
    pub const CREATE: u8 = 96;
    pub const PUT: u8 = 97;
    pub const GET: u8 = 98;
    pub const RESET: u8 = 99;
    pub const DELETE: u8 = 100;
}

/// Software timer records.
pub mod timer {
    pub const CREATE: u8 = 112;
    pub const START: u8 = 113;
    pub const STOP: u8 = 114;
    /// Timer expired and was posted to the timer thread.
    pub const EXPIRE: u8 = 115;
    /// Callback invoked in the timer thread.
    pub const CALLBACK: u8 = 116;
    pub const DELETE: u8 = 117;
}

/// Interrupt records.
pub mod isr {
    /// Interrupt entered; payload is the new nesting depth.
    pub const ENTER: u8 = 128;
    /// Interrupt exited; payload is the remaining nesting depth.
    pub const EXIT: u8 = 129;
    /// Deferred operation drained; payload is the post event kind and slot.
    pub const POST: u8 = 130;
}

/// Returns a short name for a record id, or `None` for unknown ids.
pub fn name(id: u8) -> Option<&'static str> {
    let name = match id {
        kernel::START => "KERNEL_START",
        kernel::TICK => "KERNEL_TICK",
        kernel::LOCK => "KERNEL_LOCK",
        kernel::UNLOCK => "KERNEL_UNLOCK",
        kernel::FATAL => "KERNEL_FATAL",
        kernel::IDLE => "KERNEL_IDLE",
        thread::CREATE => "THREAD_CREATE",
        thread::SWITCH => "THREAD_SWITCH",
        thread::READY => "THREAD_READY",
        thread::BLOCK => "THREAD_BLOCK",
        thread::TIMEOUT => "THREAD_TIMEOUT",
        thread::EXIT => "THREAD_EXIT",
        thread::TERMINATE => "THREAD_TERMINATE",
        thread::JOIN => "THREAD_JOIN",
        thread::PRIORITY => "THREAD_PRIORITY",
        thread::RECLAIM => "THREAD_RECLAIM",
        mutex::CREATE => "MUTEX_CREATE",
        mutex::ACQUIRE => "MUTEX_ACQUIRE",
        mutex::RELEASE => "MUTEX_RELEASE",
        mutex::INHERIT => "MUTEX_INHERIT",
        mutex::DELETE => "MUTEX_DELETE",
        sem::CREATE => "SEM_CREATE",
        sem::ACQUIRE => "SEM_ACQUIRE",
        sem::RELEASE => "SEM_RELEASE",
        sem::DELETE => "SEM_DELETE",
        flags::CREATE => "FLAGS_CREATE",
        flags::SET => "FLAGS_SET",
        flags::CLEAR => "FLAGS_CLEAR",
        flags::WAKE => "FLAGS_WAKE",
        flags::DELETE => "FLAGS_DELETE",
        flags::THREAD_SET => "THREAD_FLAGS_SET",
        pool::CREATE => "POOL_CREATE",
        pool::ALLOC => "POOL_ALLOC",
        pool::FREE => "POOL_FREE",
        pool::DELETE => "POOL_DELETE",
        queue::CREATE => "QUEUE_CREATE",
        queue::PUT => "QUEUE_PUT",
        queue::GET => "QUEUE_GET",
        queue::RESET => "QUEUE_RESET",
        queue::DELETE => "QUEUE_DELETE",
        timer::CREATE => "TIMER_CREATE",
        timer::START => "TIMER_START",
        timer::STOP => "TIMER_STOP",
        timer::EXPIRE => "TIMER_EXPIRE",
        timer::CALLBACK => "TIMER_CALLBACK",
        timer::DELETE => "TIMER_DELETE",
        isr::ENTER => "ISR_ENTER",
        isr::EXIT => "ISR_EXIT",
        isr::POST => "ISR_POST",
        crate::predefined::OBJ_DICT => "OBJ_DICT",
        crate::predefined::TARGET_INFO => "TARGET_INFO",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_group_has_a_distinct_high_nibble() {
        let groups = [
            kernel::START,
            thread::CREATE,
            mutex::CREATE,
            sem::CREATE,
            flags::CREATE,
            pool::CREATE,
            queue::CREATE,
            timer::CREATE,
            isr::ENTER,
        ];
        let mut nibbles: Vec<u8> = groups.iter().map(|id| id >> 4).collect();
        nibbles.dedup();
        assert_eq!(nibbles.len(), groups.len());
    }

    #[test]
    fn names_resolve() {
        assert_eq!(name(thread::SWITCH), Some("THREAD_SWITCH"));
        assert_eq!(name(isr::POST), Some("ISR_POST"));
        assert_eq!(name(255), None);
    }
}
