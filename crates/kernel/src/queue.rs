//! Priority message queues.
//!
//! Messages are copied into envelopes allocated from a per-queue
//! [`MemoryPool`]; envelope metadata forms a list ordered by priority, FIFO
//! within one priority. The store sits behind its own leaf lock so interrupt
//! handlers can put and get without the scheduler lock. Handing messages to
//! blocked getters, and letting blocked putters deposit theirs once space
//! frees up, is the deferred half.

use alloc::vec;
use alloc::vec::Vec;
use core::task::Poll;

use crate::config::MAX_MESSAGE_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::isr::PostEvent;
use crate::kernel::{Kernel, KernelState, Timeout, WaitValue};
use crate::list::List;
use crate::pool::MemoryPool;
use crate::port::Port;
use crate::slots::object_id;
use crate::thread::{Wait, WaitReason};
use crate::trace::records;

object_id!(
    /// Handle to a message queue.
    QueueId
);

/// A message copied out of (or into) a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub priority: u8,
    pub data: heapless::Vec<u8, MAX_MESSAGE_SIZE>,
}

impl Message {
    pub fn new(priority: u8, data: &[u8]) -> KernelResult<Self> {
        let data = heapless::Vec::from_slice(data).map_err(|_| KernelError::Parameter)?;
        Ok(Self { priority, data })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Envelope {
    priority: u8,
    len: u8,
    next: Option<u16>,
}

pub(crate) struct QueueStore {
    pool: MemoryPool,
    envelopes: Vec<Envelope>,
    head: Option<u16>,
    count: usize,
    msg_size: usize,
}

impl QueueStore {
    pub fn new(capacity: usize, msg_size: usize) -> KernelResult<Self> {
        if msg_size == 0 || msg_size > MAX_MESSAGE_SIZE {
            return Err(KernelError::Parameter);
        }
        let pool = MemoryPool::new(capacity, msg_size)?;
        Ok(Self {
            envelopes: vec![Envelope::default(); pool.block_count()],
            pool,
            head: None,
            count: 0,
            msg_size,
        })
    }

    pub fn capacity(&self) -> usize {
        self.pool.block_count()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn space(&self) -> usize {
        self.capacity() - self.count
    }

    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    /// Copies a message in behind every message of equal or higher priority.
    pub fn push(&mut self, priority: u8, data: &[u8]) -> KernelResult<()> {
        if data.len() > self.msg_size {
            return Err(KernelError::Parameter);
        }
        let block = self.pool.alloc().ok_or(KernelError::Resource)?;
        let index = self.pool.index_of(block.address())?;
        self.pool.slot_mut(index)[..data.len()].copy_from_slice(data);

        let mut prev = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if self.envelopes[current as usize].priority < priority {
                break;
            }
            prev = Some(current);
            cursor = self.envelopes[current as usize].next;
        }
        self.envelopes[index] = Envelope {
            priority,
            len: data.len() as u8,
            next: cursor,
        };
        match prev {
            Some(p) => self.envelopes[p as usize].next = Some(index as u16),
            None => self.head = Some(index as u16),
        }
        self.count += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Message> {
        let index = self.head?;
        let envelope = self.envelopes[index as usize];
        let message = Message::new(
            envelope.priority,
            &self.pool.slot(index as usize)[..envelope.len as usize],
        )
        .ok()?;
        self.head = envelope.next;
        self.count -= 1;
        let block = self.pool.block_at(index as usize);
        // The envelope came from this pool and is allocated.
        let _ = self.pool.free(block);
        Some(message)
    }

    pub fn reset(&mut self) {
        self.pool.reset();
        self.head = None;
        self.count = 0;
    }
}

pub(crate) struct QueueCb {
    pub name: &'static str,
    pub getters: List,
    pub putters: List,
}

impl<P: Port> Kernel<P> {
    /// Creates a queue of `capacity` messages of at most `msg_size` bytes.
    pub fn queue_new(&self, name: &'static str, capacity: u16, msg_size: usize) -> KernelResult<QueueId> {
        self.thread_context()?;
        self.with_state(|st| {
            if st.queues.len() >= self.config().max_queues as usize + st.timer_queue.is_some() as usize {
                return Err(KernelError::NoMemory);
            }
            self.create_queue(st, name, capacity, msg_size)
        })
    }

    pub(crate) fn create_queue(
        &self,
        st: &mut KernelState,
        name: &'static str,
        capacity: u16,
        msg_size: usize,
    ) -> KernelResult<QueueId> {
        if capacity == 0 {
            return Err(KernelError::Parameter);
        }
        let store = QueueStore::new(capacity as usize, msg_size)?;
        let key = st.queues.insert(QueueCb {
            name,
            getters: List::new(),
            putters: List::new(),
        })?;
        self.queue_leaves.at(key.index())?.bind(key, store);
        self.emit(records::queue::CREATE, &key.index().to_le_bytes());
        log::debug!("queue '{}' created: {} x {} bytes", name, capacity, msg_size);
        Ok(QueueId(key))
    }

    fn with_store<R>(&self, id: QueueId, f: impl FnOnce(&mut QueueStore) -> R) -> KernelResult<R> {
        self.queue_leaves.at(id.index())?.with(id.key(), f)
    }

    /// Copies `data` into the queue, blocking up to `timeout` while it is
    /// full. Safe from interrupt handlers with a zero timeout.
    pub fn queue_put(&self, id: QueueId, data: &[u8], priority: u8, timeout: Timeout) -> KernelResult<Poll<()>> {
        self.check_alive()?;
        let timeout = self.wait_timeout(timeout)?;
        match self.with_store(id, |store| store.push(priority, data))? {
            Ok(()) => {
                self.emit(records::queue::PUT, &id.index().to_le_bytes());
                self.post_or_process(PostEvent::QueueData(id));
                return Ok(Poll::Ready(()));
            }
            Err(KernelError::Resource) if !timeout.is_no_wait() => {}
            Err(err) => return Err(err),
        }

        let message = Message::new(priority, data)?;
        self.with_state(|st| {
            st.queues.get(id.key())?;
            match self.with_store(id, |store| store.push(priority, data))? {
                Ok(()) => {
                    self.queue_deliver(st, id);
                    return Ok(Poll::Ready(()));
                }
                Err(KernelError::Resource) => {}
                Err(err) => return Err(err),
            }
            let me = self.begin_wait(st)?;
            st.threads.at_mut(me).outgoing = Some(message);
            st.queues
                .at_mut(id.index())
                .putters
                .insert_by(&mut st.threads, me, |t| t.priority);
            let wait = Wait {
                reason: WaitReason::MessagePut,
                object: id.index(),
                flags: None,
            };
            self.suspend(st, me, wait, timeout);
            Ok(Poll::Pending)
        })
    }

    /// Takes the highest priority message, blocking up to `timeout` while the
    /// queue is empty. Safe from interrupt handlers with a zero timeout.
    pub fn queue_get(&self, id: QueueId, timeout: Timeout) -> KernelResult<Poll<Message>> {
        self.check_alive()?;
        let timeout = self.wait_timeout(timeout)?;
        if let Some(message) = self.with_store(id, QueueStore::pop)? {
            self.emit(records::queue::GET, &id.index().to_le_bytes());
            self.post_or_process(PostEvent::QueueSpace(id));
            return Ok(Poll::Ready(message));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::Resource);
        }

        self.with_state(|st| {
            st.queues.get(id.key())?;
            if let Some(message) = self.with_store(id, QueueStore::pop)? {
                self.queue_accept(st, id);
                return Ok(Poll::Ready(message));
            }
            let me = self.begin_wait(st)?;
            st.queues
                .at_mut(id.index())
                .getters
                .insert_by(&mut st.threads, me, |t| t.priority);
            let wait = Wait {
                reason: WaitReason::MessageGet,
                object: id.index(),
                flags: None,
            };
            self.suspend(st, me, wait, timeout);
            Ok(Poll::Pending)
        })
    }

    pub fn queue_count(&self, id: QueueId) -> KernelResult<usize> {
        self.with_store(id, |store| store.count())
    }

    pub fn queue_space(&self, id: QueueId) -> KernelResult<usize> {
        self.with_store(id, |store| store.space())
    }

    pub fn queue_capacity(&self, id: QueueId) -> KernelResult<usize> {
        self.with_store(id, |store| store.capacity())
    }

    pub fn queue_msg_size(&self, id: QueueId) -> KernelResult<usize> {
        self.with_store(id, |store| store.msg_size())
    }

    /// Discards every queued message; blocked putters may then deposit theirs.
    pub fn queue_reset(&self, id: QueueId) -> KernelResult<()> {
        self.thread_context()?;
        self.with_state(|st| {
            st.queues.get(id.key())?;
            self.with_store(id, QueueStore::reset)?;
            self.emit(records::queue::RESET, &id.index().to_le_bytes());
            self.queue_accept(st, id);
            Ok(())
        })
    }

    pub fn queue_delete(&self, id: QueueId) -> KernelResult<()> {
        self.thread_context()?;
        self.with_state(|st| {
            if st.timer_queue == Some(id) {
                return Err(KernelError::Parameter);
            }
            let mut cb = st.queues.remove(id.key())?;
            self.queue_leaves.at(id.index())?.unbind();
            while let Some(waiter) = cb.getters.pop_front(&mut st.threads) {
                self.wake(st, waiter, Err(KernelError::Deleted));
            }
            while let Some(waiter) = cb.putters.pop_front(&mut st.threads) {
                st.threads.at_mut(waiter).outgoing = None;
                self.wake(st, waiter, Err(KernelError::Deleted));
            }
            self.emit(records::queue::DELETE, &id.index().to_le_bytes());
            log::debug!("queue '{}' deleted", cb.name);
            Ok(())
        })
    }

    /// Hands queued messages to blocked getters, highest priority first.
    pub(crate) fn queue_deliver(&self, st: &mut KernelState, id: QueueId) {
        let mut delivered = false;
        loop {
            let Ok(cb) = st.queues.get_mut(id.key()) else {
                return;
            };
            let Some(head) = cb.getters.front() else {
                break;
            };
            let Ok(Some(message)) = self.with_store(id, QueueStore::pop) else {
                break;
            };
            cb.getters.remove(&mut st.threads, head);
            self.wake(st, head, Ok(WaitValue::Message(message)));
            delivered = true;
        }
        if delivered {
            self.queue_accept(st, id);
        }
    }

    /// Lets blocked putters deposit their messages while space remains.
    pub(crate) fn queue_accept(&self, st: &mut KernelState, id: QueueId) {
        loop {
            let Ok(cb) = st.queues.get_mut(id.key()) else {
                return;
            };
            let Some(head) = cb.putters.front() else {
                return;
            };
            let Some(message) = st.threads.at(head).outgoing.as_ref() else {
                cb.putters.remove(&mut st.threads, head);
                continue;
            };
            let pushed = self.with_store(id, |store| store.push(message.priority, &message.data));
            if !matches!(pushed, Ok(Ok(()))) {
                return;
            }
            cb.putters.remove(&mut st.threads, head);
            st.threads.at_mut(head).outgoing = None;
            self.wake(st, head, Ok(WaitValue::Unit));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_first_fifo_within_priority() {
        let mut store = QueueStore::new(4, 4).unwrap();
        store.push(5, b"A").unwrap();
        store.push(1, b"B").unwrap();
        store.push(5, b"C").unwrap();
        store.push(9, b"D").unwrap();
        assert_eq!(store.push(9, b"E"), Err(KernelError::Resource));

        let order: Vec<u8> = core::iter::from_fn(|| store.pop()).map(|m| m.data[0]).collect();
        assert_eq!(order, b"DACB");
        assert_eq!(store.count(), 0);
        assert_eq!(store.space(), 4);
    }

    #[test]
    fn envelopes_are_recycled() {
        let mut store = QueueStore::new(2, 8).unwrap();
        for round in 0..10u8 {
            store.push(0, &[round, round]).unwrap();
            let message = store.pop().unwrap();
            assert_eq!(message.data(), &[round, round]);
        }
        assert!(store.pop().is_none());
    }

    #[test]
    fn oversized_messages_are_rejected() {
        assert!(QueueStore::new(1, MAX_MESSAGE_SIZE + 1).is_err());
        let mut store = QueueStore::new(1, 4).unwrap();
        assert_eq!(store.push(0, b"too long"), Err(KernelError::Parameter));
    }

    #[test]
    fn reset_discards_messages() {
        let mut store = QueueStore::new(3, 4).unwrap();
        store.push(1, b"x").unwrap();
        store.push(2, b"y").unwrap();
        store.reset();
        assert_eq!(store.count(), 0);
        assert!(store.pop().is_none());
        store.push(3, b"z").unwrap();
        assert_eq!(store.pop().unwrap().data(), b"z");
    }
}
