//! Mutexes with ownership, recursion and priority inheritance.
//!
//! A thread's effective priority is never stored independently of what it
//! owns: it is recomputed by [`effective_priority`] whenever ownership or a
//! wait list changes, and the change is pushed along the chain of owners
//! (a raised owner that is itself blocked on a mutex raises that mutex's
//! owner in turn).

use core::task::Poll;

use crate::error::{KernelError, KernelResult};
use crate::kernel::{Kernel, KernelState, Timeout, WaitValue};
use crate::list::List;
use crate::port::Port;
use crate::slots::object_id;
use crate::thread::{Priority, ThreadId, ThreadState, Wait, WaitReason};
use crate::trace::records;

object_id!(
    /// Handle to a mutex.
    MutexId
);

/// Creation attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexConfig {
    pub name: &'static str,
    /// The owner may lock again; each lock needs a matching release.
    pub recursive: bool,
    pub priority_inherit: bool,
    /// Released automatically when the owner terminates.
    pub robust: bool,
}

impl MutexConfig {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            recursive: false,
            priority_inherit: true,
            robust: false,
        }
    }

    pub const fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub const fn priority_inherit(mut self, inherit: bool) -> Self {
        self.priority_inherit = inherit;
        self
    }

    pub const fn robust(mut self, robust: bool) -> Self {
        self.robust = robust;
        self
    }
}

pub(crate) struct MutexCb {
    pub attrs: MutexConfig,
    pub owner: Option<ThreadId>,
    pub count: u32,
    pub waiters: List,
    /// Next mutex in the owner's owned list.
    pub next_owned: Option<u16>,
}

/// `max(base, head waiter of every owned inheriting mutex)`.
pub(crate) fn effective_priority(st: &KernelState, thread: u16) -> Priority {
    let mut priority = st.threads.at(thread).base_priority;
    let mut cursor = st.threads.at(thread).owned_mutexes;
    while let Some(index) = cursor {
        let cb = st.mutexes.at(index);
        if cb.attrs.priority_inherit {
            if let Some(head) = cb.waiters.front() {
                priority = priority.max(st.threads.at(head).priority);
            }
        }
        cursor = cb.next_owned;
    }
    priority
}

/// Owner of `mutex` if it is still a live thread.
fn live_owner(st: &KernelState, mutex: u16) -> Option<u16> {
    let owner = st.mutexes.try_at(mutex)?.owner?;
    match st.threads.get(owner.key()) {
        Ok(thread) if thread.state != ThreadState::Terminated => Some(owner.index()),
        _ => None,
    }
}

fn link_owned(st: &mut KernelState, owner: u16, mutex: u16) {
    let thread = st.threads.at_mut(owner);
    st.mutexes.at_mut(mutex).next_owned = thread.owned_mutexes;
    thread.owned_mutexes = Some(mutex);
}

fn unlink_owned(st: &mut KernelState, owner: ThreadId, mutex: u16) {
    let next = st.mutexes.at(mutex).next_owned;
    st.mutexes.at_mut(mutex).next_owned = None;
    let Ok(thread) = st.threads.get_mut(owner.key()) else {
        return;
    };
    if thread.owned_mutexes == Some(mutex) {
        thread.owned_mutexes = next;
        return;
    }
    let mut cursor = thread.owned_mutexes;
    while let Some(index) = cursor {
        let cb = st.mutexes.at_mut(index);
        if cb.next_owned == Some(mutex) {
            cb.next_owned = next;
            return;
        }
        cursor = cb.next_owned;
    }
}

impl<P: Port> Kernel<P> {
    pub fn mutex_new(&self, config: MutexConfig) -> KernelResult<MutexId> {
        self.thread_context()?;
        self.with_state(|st| {
            let key = st.mutexes.insert(MutexCb {
                attrs: config,
                owner: None,
                count: 0,
                waiters: List::new(),
                next_owned: None,
            })?;
            self.emit(records::mutex::CREATE, &key.index().to_le_bytes());
            log::debug!("mutex '{}' created", config.name);
            Ok(MutexId(key))
        })
    }

    /// Locks the mutex, blocking up to `timeout` while another thread owns it.
    pub fn mutex_acquire(&self, id: MutexId, timeout: Timeout) -> KernelResult<Poll<()>> {
        self.thread_context()?;
        let timeout = self.wait_timeout(timeout)?;
        self.with_state(|st| {
            let me = st.current()?;
            let me_id = st.thread_id(me).ok_or(KernelError::InvalidState)?;
            let cb = st.mutexes.get_mut(id.key())?;
            let owner = cb.owner;

            match owner {
                None => {
                    cb.owner = Some(me_id);
                    cb.count = 1;
                    link_owned(st, me, id.index());
                    self.emit(records::mutex::ACQUIRE, &id.index().to_le_bytes());
                    return Ok(Poll::Ready(()));
                }
                Some(owner) if owner == me_id => {
                    if !cb.attrs.recursive {
                        log::warn!("thread {} relocked non-recursive mutex {}", me_id, id);
                        return Err(KernelError::Deadlock);
                    }
                    cb.count = cb.count.checked_add(1).ok_or(KernelError::Overflow)?;
                    return Ok(Poll::Ready(()));
                }
                Some(_) => {}
            }

            if timeout.is_no_wait() {
                return Err(KernelError::Resource);
            }
            let me = self.begin_wait(st)?;
            st.mutexes
                .at_mut(id.index())
                .waiters
                .insert_by(&mut st.threads, me, |t| t.priority);
            let wait = Wait {
                reason: WaitReason::Mutex,
                object: id.index(),
                flags: None,
            };
            self.suspend(st, me, wait, timeout);

            if st.mutexes.at(id.index()).attrs.priority_inherit {
                if let Some(owner) = live_owner(st, id.index()) {
                    let before = st.threads.at(owner).priority;
                    self.update_priority(st, owner);
                    let after = st.threads.at(owner).priority;
                    if after > before {
                        let [lo, hi] = owner.to_le_bytes();
                        self.emit(records::mutex::INHERIT, &[lo, hi, after.raw()]);
                    }
                }
            }
            Ok(Poll::Pending)
        })
    }

    /// Unlocks one level; the last level hands the mutex to the highest
    /// priority waiter.
    pub fn mutex_release(&self, id: MutexId) -> KernelResult<()> {
        self.thread_context()?;
        self.with_state(|st| {
            let me = st.running.and_then(|index| st.thread_id(index));
            let cb = st.mutexes.get_mut(id.key())?;
            if me.is_none() || cb.owner != me {
                log::warn!("mutex {} released by non-owner", id);
                return Err(KernelError::NotOwner);
            }
            cb.count -= 1;
            if cb.count > 0 {
                return Ok(());
            }

            let owner = me.ok_or(KernelError::NotOwner)?;
            unlink_owned(st, owner, id.index());
            self.hand_off(st, id.index());
            self.update_priority(st, owner.index());
            self.emit(records::mutex::RELEASE, &id.index().to_le_bytes());
            Ok(())
        })
    }

    pub fn mutex_owner(&self, id: MutexId) -> KernelResult<Option<ThreadId>> {
        self.inspect(|st| Ok(st.mutexes.get(id.key())?.owner))
    }

    /// Recursive lock depth held by the owner.
    pub fn mutex_lock_count(&self, id: MutexId) -> KernelResult<u32> {
        self.inspect(|st| Ok(st.mutexes.get(id.key())?.count))
    }

    /// Deletes the mutex; blocked threads fail with [`KernelError::Deleted`]
    /// and the owner loses any priority it inherited through it.
    pub fn mutex_delete(&self, id: MutexId) -> KernelResult<()> {
        self.thread_context()?;
        self.with_state(|st| {
            let owner = st.mutexes.get(id.key())?.owner;
            let live = live_owner(st, id.index());
            if let Some(owner) = owner {
                unlink_owned(st, owner, id.index());
            }

            let mut cb = st.mutexes.remove(id.key())?;
            while let Some(waiter) = cb.waiters.pop_front(&mut st.threads) {
                self.wake(st, waiter, Err(KernelError::Deleted));
            }
            if let Some(owner) = live {
                self.update_priority(st, owner);
            }
            self.emit(records::mutex::DELETE, &id.index().to_le_bytes());
            log::debug!("mutex '{}' deleted", cb.attrs.name);
            Ok(())
        })
    }

    /// Passes an unlocked mutex to its head waiter, or leaves it free.
    fn hand_off(&self, st: &mut KernelState, mutex: u16) {
        let cb = st.mutexes.at_mut(mutex);
        let Some(next) = cb.waiters.pop_front(&mut st.threads) else {
            cb.owner = None;
            cb.count = 0;
            return;
        };
        cb.owner = st.threads.key_at(next).map(ThreadId);
        cb.count = 1;
        link_owned(st, next, mutex);
        self.wake(st, next, Ok(WaitValue::Unit));
        // The new owner inherits from whoever still waits.
        self.update_priority(st, next);
    }

    /// Recomputes the effective priority of `thread` and of every owner
    /// along the chain of mutexes it waits on.
    pub(crate) fn update_priority(&self, st: &mut KernelState, thread: u16) {
        let mut current = thread;
        for _ in 0..st.threads.capacity() {
            let old = st.threads.at(current).priority;
            let new = effective_priority(st, current);
            if new == old {
                return;
            }
            st.threads.at_mut(current).priority = new;
            self.reposition(st, current, old);
            let [lo, hi] = current.to_le_bytes();
            self.emit(records::thread::PRIORITY, &[lo, hi, new.raw()]);

            let Some(wait) = st.threads.at(current).wait else {
                return;
            };
            if wait.reason != WaitReason::Mutex {
                return;
            }
            match st.mutexes.try_at(wait.object) {
                Some(cb) if cb.attrs.priority_inherit => {}
                _ => return,
            }
            match live_owner(st, wait.object) {
                Some(owner) => current = owner,
                None => return,
            }
        }
    }

    /// A waiter left `mutex` without acquiring it.
    pub(crate) fn mutex_waiters_changed(&self, st: &mut KernelState, mutex: u16) {
        if let Some(owner) = live_owner(st, mutex) {
            self.update_priority(st, owner);
        }
    }

    /// Called when `thread` terminates. Robust mutexes pass to their next
    /// waiter; others stay locked by the dead owner.
    pub(crate) fn release_owned_mutexes(&self, st: &mut KernelState, thread: u16) {
        while let Some(mutex) = st.threads.at(thread).owned_mutexes {
            let cb = st.mutexes.at_mut(mutex);
            st.threads.at_mut(thread).owned_mutexes = cb.next_owned;
            cb.next_owned = None;
            if cb.attrs.robust {
                log::debug!("robust mutex '{}' released by terminating owner", cb.attrs.name);
                self.hand_off(st, mutex);
            }
        }
        let base = st.threads.at(thread).base_priority;
        st.threads.at_mut(thread).priority = base;
    }
}
