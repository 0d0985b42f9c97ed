//! Interrupt post-processing queue.
//!
//! An interrupt handler performs only the lock-free half of an object
//! operation (bumping a counter, setting bits, moving a block) and records the
//! object here. The queue drains at the outermost interrupt exit, under the
//! scheduler lock, where waiters are woken before any thread resumes.

use heapless::Deque;

use crate::config::ISR_QUEUE_DEPTH;
use crate::error::FatalError;
use crate::flags::EventFlagsId;
use crate::mempool::PoolId;
use crate::queue::QueueId;
use crate::semaphore::SemaphoreId;
use crate::thread::ThreadId;

/// Object whose waiters must be re-examined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PostEvent {
    Semaphore(SemaphoreId),
    EventFlags(EventFlagsId),
    ThreadFlags(ThreadId),
    Pool(PoolId),
    /// A message was stored; blocked getters may proceed.
    QueueData(QueueId),
    /// An envelope was freed; blocked putters may proceed.
    QueueSpace(QueueId),
}

impl PostEvent {
    pub(crate) fn code(&self) -> u8 {
        match self {
            Self::Semaphore(_) => 0,
            Self::EventFlags(_) => 1,
            Self::ThreadFlags(_) => 2,
            Self::Pool(_) => 3,
            Self::QueueData(_) => 4,
            Self::QueueSpace(_) => 5,
        }
    }

    pub(crate) fn index(&self) -> u16 {
        match self {
            Self::Semaphore(id) => id.index(),
            Self::EventFlags(id) => id.index(),
            Self::ThreadFlags(id) => id.index(),
            Self::Pool(id) => id.index(),
            Self::QueueData(id) | Self::QueueSpace(id) => id.index(),
        }
    }
}

pub(crate) struct PostQueue {
    events: Deque<PostEvent, ISR_QUEUE_DEPTH>,
}

impl PostQueue {
    pub const fn new() -> Self {
        Self {
            events: Deque::new(),
        }
    }

    /// Records `event`; a pending identical event absorbs it.
    pub fn push(&mut self, event: PostEvent) -> Result<(), FatalError> {
        if self.events.iter().any(|pending| *pending == event) {
            return Ok(());
        }
        self.events
            .push_back(event)
            .map_err(|_| FatalError::IsrQueueOverflow)
    }

    pub fn pop(&mut self) -> Option<PostEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::Key;

    fn sem(index: u16) -> PostEvent {
        PostEvent::Semaphore(SemaphoreId(Key::new(index, 0)))
    }

    #[test]
    fn duplicates_coalesce_and_order_is_fifo() {
        let mut queue = PostQueue::new();
        queue.push(sem(1)).unwrap();
        queue.push(sem(2)).unwrap();
        queue.push(sem(1)).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(sem(1)));
        assert_eq!(queue.pop(), Some(sem(2)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn overflow_is_reported() {
        let mut queue = PostQueue::new();
        for i in 0..ISR_QUEUE_DEPTH as u16 {
            queue.push(sem(i)).unwrap();
        }
        assert_eq!(queue.push(sem(99)), Err(FatalError::IsrQueueOverflow));
    }
}
