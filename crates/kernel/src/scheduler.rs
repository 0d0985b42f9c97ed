//! Ready queue: one FIFO bucket per priority plus a bitmap of non-empty
//! buckets, so selecting the next thread is a single `leading_zeros`.

use crate::config::PRIORITY_LEVELS;
use crate::list::List;
use crate::slots::ObjectPool;
use crate::thread::{Priority, Thread};

/// 64-bit bitmap of priorities with at least one ready thread.
#[derive(Default, Clone, Copy)]
pub(crate) struct ReadySet {
    bits: u64,
}

impl ReadySet {
    fn insert(&mut self, prio: u8) {
        Self::assert_range(prio);
        self.bits |= 1u64 << prio;
    }

    fn remove(&mut self, prio: u8) {
        Self::assert_range(prio);
        self.bits &= !(1u64 << prio);
    }

    fn contains(&self, prio: u8) -> bool {
        Self::assert_range(prio);
        (self.bits & (1u64 << prio)) != 0
    }

    fn max(&self) -> Option<u8> {
        if self.bits == 0 {
            None
        } else {
            Some(63 - self.bits.leading_zeros() as u8)
        }
    }

    fn assert_range(prio: u8) {
        assert!(
            (prio as usize) < PRIORITY_LEVELS,
            "priority {prio} exceeds supported range 0..63"
        );
    }
}

pub(crate) struct ReadyQueue {
    buckets: [List; PRIORITY_LEVELS],
    set: ReadySet,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            buckets: [List::new(); PRIORITY_LEVELS],
            set: ReadySet::default(),
        }
    }

    /// Appends a woken or rotated thread.
    pub fn push_back(&mut self, threads: &mut ObjectPool<Thread>, index: u16) {
        let prio = threads.at(index).priority.raw();
        self.buckets[prio as usize].push_back(threads, index);
        self.set.insert(prio);
    }

    /// Puts a preempted thread back at the head of its bucket.
    pub fn push_front(&mut self, threads: &mut ObjectPool<Thread>, index: u16) {
        let prio = threads.at(index).priority.raw();
        self.buckets[prio as usize].push_front(threads, index);
        self.set.insert(prio);
    }

    /// Removes a ready thread; `prio` is the priority it was queued at.
    pub fn remove(&mut self, threads: &mut ObjectPool<Thread>, index: u16, prio: Priority) {
        let bucket = &mut self.buckets[prio.raw() as usize];
        bucket.remove(threads, index);
        if bucket.is_empty() {
            self.set.remove(prio.raw());
        }
    }

    pub fn highest(&self) -> Option<Priority> {
        self.set.max().map(Priority)
    }

    pub fn has_ready(&self, prio: Priority) -> bool {
        self.set.contains(prio.raw())
    }

    pub fn pop_highest(&mut self, threads: &mut ObjectPool<Thread>) -> Option<u16> {
        let prio = self.set.max()?;
        let bucket = &mut self.buckets[prio as usize];
        let index = bucket.pop_front(threads)?;
        if bucket.is_empty() {
            self.set.remove(prio);
        }
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{Stack, ThreadEntry};

    fn thread(threads: &mut ObjectPool<Thread>, prio: u8) -> u16 {
        threads
            .insert(Thread::new(
                "t",
                ThreadEntry::Idle,
                Priority(prio),
                Stack::Owned(alloc::vec::Vec::new()),
                0,
            ))
            .unwrap()
            .index()
    }

    #[test]
    fn ready_set_tracks_maximum() {
        let mut set = ReadySet::default();
        assert_eq!(set.max(), None);
        set.insert(3);
        set.insert(40);
        set.insert(63);
        assert_eq!(set.max(), Some(63));
        set.remove(63);
        assert_eq!(set.max(), Some(40));
        assert!(set.contains(3));
    }

    #[test]
    fn highest_bucket_runs_first_and_preempted_returns_to_head() {
        let mut threads = ObjectPool::with_capacity(4);
        let low = thread(&mut threads, 5);
        let a = thread(&mut threads, 20);
        let b = thread(&mut threads, 20);

        let mut ready = ReadyQueue::new();
        ready.push_back(&mut threads, low);
        ready.push_back(&mut threads, a);
        ready.push_back(&mut threads, b);
        assert_eq!(ready.highest(), Some(Priority(20)));

        assert_eq!(ready.pop_highest(&mut threads), Some(a));
        ready.push_front(&mut threads, a);
        assert_eq!(ready.pop_highest(&mut threads), Some(a));
        assert_eq!(ready.pop_highest(&mut threads), Some(b));
        assert_eq!(ready.pop_highest(&mut threads), Some(low));
        assert_eq!(ready.pop_highest(&mut threads), None);
    }

    #[test]
    fn removing_last_thread_clears_bucket_bit() {
        let mut threads = ObjectPool::with_capacity(2);
        let t = thread(&mut threads, 9);
        let mut ready = ReadyQueue::new();
        ready.push_back(&mut threads, t);
        assert!(ready.has_ready(Priority(9)));
        ready.remove(&mut threads, t, Priority(9));
        assert!(!ready.has_ready(Priority(9)));
        assert_eq!(ready.highest(), None);
    }
}
