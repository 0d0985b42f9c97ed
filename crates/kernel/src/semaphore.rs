//! Counting semaphores.
//!
//! The token count lives in an atomic side table so `release` and zero-wait
//! `acquire` work from interrupt handlers without the scheduler lock; waking a
//! blocked acquirer is the deferred half.
//!
//! A woken acquirer does not own a token yet. It claims one when it is next
//! dispatched, so a thread that runs in between may take the token first. A
//! waiter that loses goes back to waiting for what is left of its timeout.

use core::task::Poll;

use crate::atomic::{Atomic16, AtomicWord};
use crate::error::{KernelError, KernelResult};
use crate::isr::PostEvent;
use crate::kernel::{Kernel, KernelState, Timeout, WaitValue};
use crate::list::List;
use crate::port::Port;
use crate::slots::{object_id, Tag};
use crate::thread::{Wait, WaitReason};
use crate::trace::records;

object_id!(
    /// Handle to a counting semaphore.
    SemaphoreId
);

pub(crate) struct SemaphoreCounter {
    pub tag: Tag,
    pub tokens: Atomic16,
    pub max: Atomic16,
}

impl SemaphoreCounter {
    pub fn new() -> Self {
        Self {
            tag: Tag::new(),
            tokens: Atomic16::new(0),
            max: Atomic16::new(0),
        }
    }
}

pub(crate) struct SemaphoreCb {
    pub name: &'static str,
    pub waiters: List,
    /// Woken acquirers that have not run yet.
    pub claims: u16,
}

impl<P: Port> Kernel<P> {
    pub fn semaphore_new(&self, name: &'static str, max: u16, initial: u16) -> KernelResult<SemaphoreId> {
        self.thread_context()?;
        if max == 0 || initial > max {
            return Err(KernelError::Parameter);
        }
        self.with_state(|st| {
            let key = st.semaphores.insert(SemaphoreCb {
                name,
                waiters: List::new(),
                claims: 0,
            })?;
            let counter = self.sem_counters.at(key.index())?;
            counter.tokens.store(initial);
            counter.max.store(max);
            counter.tag.bind(key);

            let [lo, hi] = key.index().to_le_bytes();
            self.emit(records::sem::CREATE, &[lo, hi, initial as u8, max as u8]);
            log::debug!("semaphore '{}' created ({}/{})", name, initial, max);
            Ok(SemaphoreId(key))
        })
    }

    fn counter(&self, id: SemaphoreId) -> KernelResult<&SemaphoreCounter> {
        let counter = self.sem_counters.at(id.index())?;
        if counter.tag.matches(id.key()) {
            Ok(counter)
        } else {
            Err(KernelError::InvalidHandle)
        }
    }

    /// Takes one token, blocking up to `timeout` while none is available.
    ///
    /// Interrupt handlers may call this; the timeout is then ignored.
    pub fn semaphore_acquire(&self, id: SemaphoreId, timeout: Timeout) -> KernelResult<Poll<()>> {
        self.check_alive()?;
        let timeout = self.wait_timeout(timeout)?;
        let counter = self.counter(id)?;
        if counter.tokens.decrement_nonzero().is_some() {
            self.emit(records::sem::ACQUIRE, &id.index().to_le_bytes());
            return Ok(Poll::Ready(()));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::Resource);
        }

        self.with_state(|st| {
            st.semaphores.get(id.key())?;
            if counter.tokens.decrement_nonzero().is_some() {
                return Ok(Poll::Ready(()));
            }
            let me = self.begin_wait(st)?;
            st.semaphores
                .at_mut(id.index())
                .waiters
                .insert_by(&mut st.threads, me, |t| t.priority);
            let wait = Wait {
                reason: WaitReason::Semaphore,
                object: id.index(),
                flags: None,
            };
            self.suspend(st, me, wait, timeout);
            Ok(Poll::Pending)
        })
    }

    /// Returns one token. Fails with [`KernelError::Overflow`] at the maximum
    /// count. Safe to call from interrupt handlers.
    pub fn semaphore_release(&self, id: SemaphoreId) -> KernelResult<()> {
        self.check_alive()?;
        let counter = self.counter(id)?;
        if counter.tokens.increment_below(counter.max.load()).is_none() {
            log::warn!("semaphore {} released above its maximum", id);
            return Err(KernelError::Overflow);
        }
        self.emit(records::sem::RELEASE, &id.index().to_le_bytes());
        self.post_or_process(PostEvent::Semaphore(id));
        Ok(())
    }

    pub fn semaphore_count(&self, id: SemaphoreId) -> KernelResult<u16> {
        Ok(self.counter(id)?.tokens.load())
    }

    pub fn semaphore_name(&self, id: SemaphoreId) -> KernelResult<&'static str> {
        self.inspect(|st| Ok(st.semaphores.get(id.key())?.name))
    }

    /// Deletes the semaphore; blocked acquirers fail with [`KernelError::Deleted`].
    pub fn semaphore_delete(&self, id: SemaphoreId) -> KernelResult<()> {
        self.thread_context()?;
        self.with_state(|st| {
            let mut cb = st.semaphores.remove(id.key())?;
            self.sem_counters.at(id.index())?.tag.unbind();
            while let Some(waiter) = cb.waiters.pop_front(&mut st.threads) {
                self.wake(st, waiter, Err(KernelError::Deleted));
            }
            self.emit(records::sem::DELETE, &id.index().to_le_bytes());
            log::debug!("semaphore '{}' deleted", cb.name);
            Ok(())
        })
    }

    /// Wakes one waiter per token not already spoken for, highest
    /// priority first.
    pub(crate) fn semaphore_wake(&self, st: &mut KernelState, id: SemaphoreId) {
        let Ok(counter) = self.counter(id) else {
            return;
        };
        loop {
            let Ok(cb) = st.semaphores.get_mut(id.key()) else {
                return;
            };
            let Some(head) = cb.waiters.front() else {
                return;
            };
            if counter.tokens.load() <= cb.claims {
                return;
            }
            cb.claims += 1;
            cb.waiters.remove(&mut st.threads, head);
            self.wake(st, head, Ok(WaitValue::Unit));
            let thread = st.threads.at_mut(head);
            thread.wait_result = None;
            thread.claim = Some(id);
        }
    }

    /// Settles the claim of a thread just taken off the ready queue. Returns
    /// false if the token was gone and the thread is waiting again.
    pub(crate) fn semaphore_claim(&self, st: &mut KernelState, index: u16) -> bool {
        let Some(id) = st.threads.at_mut(index).claim.take() else {
            return true;
        };
        let Ok(cb) = st.semaphores.get_mut(id.key()) else {
            st.threads.at_mut(index).wait_result = Some(Err(KernelError::Deleted));
            return true;
        };
        cb.claims = cb.claims.saturating_sub(1);

        let taken = self
            .counter(id)
            .map(|counter| counter.tokens.decrement_nonzero().is_some())
            .unwrap_or(false);
        if taken {
            st.threads.at_mut(index).wait_result = Some(Ok(WaitValue::Unit));
            self.emit(records::sem::ACQUIRE, &id.index().to_le_bytes());
            return true;
        }

        let timeout = match st.threads.at(index).deadline {
            None => Timeout::FOREVER,
            Some(deadline) => match deadline.saturating_sub(st.tick) {
                0 => {
                    st.threads.at_mut(index).wait_result = Some(Err(KernelError::Timeout));
                    return true;
                }
                // A finite wait never exceeds u32::MAX - 1 ticks.
                left => Timeout(u32::try_from(left).unwrap_or(u32::MAX - 1)),
            },
        };
        st.semaphores
            .at_mut(id.index())
            .waiters
            .insert_by(&mut st.threads, index, |t| t.priority);
        let wait = Wait {
            reason: WaitReason::Semaphore,
            object: id.index(),
            flags: None,
        };
        self.suspend(st, index, wait, timeout);
        false
    }

    /// A woken acquirer went away before running; its token is free for
    /// the next waiter.
    pub(crate) fn semaphore_unclaim(&self, st: &mut KernelState, index: u16) {
        let Some(id) = st.threads.at_mut(index).claim.take() else {
            return;
        };
        if let Ok(cb) = st.semaphores.get_mut(id.key()) {
            cb.claims = cb.claims.saturating_sub(1);
            self.semaphore_wake(st, id);
        }
    }
}
