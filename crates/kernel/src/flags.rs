//! Event flag groups and per-thread flags.
//!
//! Both are 31-bit words kept in atomic side tables. Setting bits is a plain
//! `fetch_or` that interrupt handlers may perform; re-evaluating the waiters
//! is the deferred half. A satisfied waiter consumes the bits it matched
//! (unless it asked for `no_clear`) and receives the word as it was just
//! before that clear.

use core::task::Poll;

use crate::atomic::{Atomic32, AtomicWord};
use crate::error::{KernelError, KernelResult};
use crate::isr::PostEvent;
use crate::kernel::{Kernel, KernelState, Timeout, WaitValue};
use crate::list::List;
use crate::port::Port;
use crate::slots::{object_id, Tag};
use crate::thread::{ThreadId, Wait, WaitReason};
use crate::trace::records;

object_id!(
    /// Handle to an event flag group.
    EventFlagsId
);

/// Bit 31 is reserved; masks using it are rejected.
pub const FLAGS_MASK: u32 = 0x7FFF_FFFF;

/// How a flag wait is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlagOptions {
    /// Require every bit of the mask instead of any one of them.
    pub wait_all: bool,
    /// Leave the matched bits set.
    pub no_clear: bool,
}

impl FlagOptions {
    pub const ANY: FlagOptions = FlagOptions {
        wait_all: false,
        no_clear: false,
    };
    pub const ALL: FlagOptions = FlagOptions {
        wait_all: true,
        no_clear: false,
    };

    pub const fn no_clear(mut self) -> Self {
        self.no_clear = true;
        self
    }

    pub const fn is_satisfied(self, flags: u32, mask: u32) -> bool {
        if self.wait_all {
            flags & mask == mask
        } else {
            flags & mask != 0
        }
    }
}

pub(crate) struct FlagWord {
    pub tag: Tag,
    pub word: Atomic32,
}

impl FlagWord {
    pub fn new() -> Self {
        Self {
            tag: Tag::new(),
            word: Atomic32::new(0),
        }
    }

    /// Consumes the flags if `mask` is satisfied; returns the word before
    /// clearing.
    fn take(&self, mask: u32, options: FlagOptions) -> Option<u32> {
        self.word.fetch_update(|flags| {
            if !options.is_satisfied(flags, mask) {
                None
            } else if options.no_clear {
                Some(flags)
            } else {
                Some(flags & !mask)
            }
        })
    }
}

pub(crate) struct EventFlagsCb {
    pub name: &'static str,
    pub waiters: List,
}

fn check_mask(mask: u32) -> KernelResult<()> {
    if mask == 0 || mask & !FLAGS_MASK != 0 {
        Err(KernelError::Parameter)
    } else {
        Ok(())
    }
}

impl<P: Port> Kernel<P> {
    pub fn event_flags_new(&self, name: &'static str) -> KernelResult<EventFlagsId> {
        self.thread_context()?;
        self.with_state(|st| {
            let key = st.event_flags.insert(EventFlagsCb {
                name,
                waiters: List::new(),
            })?;
            let word = self.event_words.at(key.index())?;
            word.word.store(0);
            word.tag.bind(key);
            self.emit(records::flags::CREATE, &key.index().to_le_bytes());
            log::debug!("event flags '{}' created", name);
            Ok(EventFlagsId(key))
        })
    }

    fn event_word(&self, id: EventFlagsId) -> KernelResult<&FlagWord> {
        let word = self.event_words.at(id.index())?;
        if word.tag.matches(id.key()) {
            Ok(word)
        } else {
            Err(KernelError::InvalidHandle)
        }
    }

    /// Sets bits and returns the word after setting. Safe from interrupts.
    pub fn event_flags_set(&self, id: EventFlagsId, mask: u32) -> KernelResult<u32> {
        self.check_alive()?;
        check_mask(mask)?;
        let word = self.event_word(id)?;
        let flags = word.word.fetch_or(mask) | mask;
        self.emit(records::flags::SET, &flags.to_le_bytes());
        self.post_or_process(PostEvent::EventFlags(id));
        Ok(flags)
    }

    /// Clears bits and returns the word before clearing. Wakes nobody.
    pub fn event_flags_clear(&self, id: EventFlagsId, mask: u32) -> KernelResult<u32> {
        self.check_alive()?;
        check_mask(mask)?;
        let word = self.event_word(id)?;
        let previous = word.word.fetch_and(!mask);
        self.emit(records::flags::CLEAR, &previous.to_le_bytes());
        Ok(previous)
    }

    pub fn event_flags_get(&self, id: EventFlagsId) -> KernelResult<u32> {
        Ok(self.event_word(id)?.word.load())
    }

    /// Waits until `mask` is satisfied according to `options`.
    ///
    /// The value returned (immediately or as the wait result) is a snapshot
    /// of the word taken when the wait was satisfied.
    pub fn event_flags_wait(
        &self,
        id: EventFlagsId,
        mask: u32,
        options: FlagOptions,
        timeout: Timeout,
    ) -> KernelResult<Poll<u32>> {
        self.check_alive()?;
        check_mask(mask)?;
        let timeout = self.wait_timeout(timeout)?;
        let word = self.event_word(id)?;
        if let Some(flags) = word.take(mask, options) {
            return Ok(Poll::Ready(flags));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::Resource);
        }

        self.with_state(|st| {
            st.event_flags.get(id.key())?;
            if let Some(flags) = word.take(mask, options) {
                return Ok(Poll::Ready(flags));
            }
            let me = self.begin_wait(st)?;
            st.event_flags
                .at_mut(id.index())
                .waiters
                .insert_by(&mut st.threads, me, |t| t.priority);
            let wait = Wait {
                reason: WaitReason::EventFlags,
                object: id.index(),
                flags: Some((mask, options)),
            };
            self.suspend(st, me, wait, timeout);
            Ok(Poll::Pending)
        })
    }

    pub fn event_flags_delete(&self, id: EventFlagsId) -> KernelResult<()> {
        self.thread_context()?;
        self.with_state(|st| {
            let mut cb = st.event_flags.remove(id.key())?;
            self.event_words.at(id.index())?.tag.unbind();
            while let Some(waiter) = cb.waiters.pop_front(&mut st.threads) {
                self.wake(st, waiter, Err(KernelError::Deleted));
            }
            self.emit(records::flags::DELETE, &id.index().to_le_bytes());
            log::debug!("event flags '{}' deleted", cb.name);
            Ok(())
        })
    }

    /// Re-evaluates every waiter in priority order.
    pub(crate) fn event_flags_wake(&self, st: &mut KernelState, id: EventFlagsId) {
        let Ok(word) = self.event_word(id) else {
            return;
        };
        let mut cursor = match st.event_flags.get(id.key()) {
            Ok(cb) => cb.waiters.front(),
            Err(_) => return,
        };
        while let Some(waiter) = cursor {
            cursor = List::next_of(&st.threads, waiter);
            let Some((mask, options)) = st.threads.at(waiter).wait.and_then(|w| w.flags) else {
                continue;
            };
            if let Some(flags) = word.take(mask, options) {
                st.event_flags
                    .at_mut(id.index())
                    .waiters
                    .remove(&mut st.threads, waiter);
                self.emit(records::flags::WAKE, &waiter.to_le_bytes());
                self.wake(st, waiter, Ok(WaitValue::Flags(flags)));
            }
        }
    }

    fn thread_word(&self, id: ThreadId) -> KernelResult<&FlagWord> {
        let word = self.thread_words.at(id.index())?;
        if word.tag.matches(id.key()) {
            Ok(word)
        } else {
            Err(KernelError::InvalidHandle)
        }
    }

    fn current_word(&self) -> KernelResult<(ThreadId, &FlagWord)> {
        self.thread_context()?;
        let id = self.current_thread().ok_or(KernelError::InvalidState)?;
        Ok((id, self.thread_word(id)?))
    }

    /// Sets flags of `thread`; returns its word after setting. Safe from
    /// interrupts.
    pub fn thread_flags_set(&self, thread: ThreadId, mask: u32) -> KernelResult<u32> {
        self.check_alive()?;
        check_mask(mask)?;
        let word = self.thread_word(thread)?;
        let flags = word.word.fetch_or(mask) | mask;
        self.emit(records::flags::THREAD_SET, &thread.index().to_le_bytes());
        self.post_or_process(PostEvent::ThreadFlags(thread));
        Ok(flags)
    }

    /// Clears flags of the calling thread; returns the word before clearing.
    pub fn thread_flags_clear(&self, mask: u32) -> KernelResult<u32> {
        check_mask(mask)?;
        let (_, word) = self.current_word()?;
        Ok(word.word.fetch_and(!mask))
    }

    pub fn thread_flags_get(&self) -> KernelResult<u32> {
        let (_, word) = self.current_word()?;
        Ok(word.word.load())
    }

    /// Waits on the calling thread's own flags.
    pub fn thread_flags_wait(&self, mask: u32, options: FlagOptions, timeout: Timeout) -> KernelResult<Poll<u32>> {
        check_mask(mask)?;
        let timeout = self.wait_timeout(timeout)?;
        let (id, word) = self.current_word()?;
        if let Some(flags) = word.take(mask, options) {
            return Ok(Poll::Ready(flags));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::Resource);
        }

        self.with_state(|st| {
            if let Some(flags) = word.take(mask, options) {
                return Ok(Poll::Ready(flags));
            }
            let me = self.begin_wait(st)?;
            if me != id.index() {
                return Err(KernelError::InvalidState);
            }
            let wait = Wait {
                reason: WaitReason::ThreadFlags,
                object: me,
                flags: Some((mask, options)),
            };
            self.suspend(st, me, wait, timeout);
            Ok(Poll::Pending)
        })
    }

    pub(crate) fn thread_flags_wake(&self, st: &mut KernelState, id: ThreadId) {
        let Ok(word) = self.thread_word(id) else {
            return;
        };
        let Ok(thread) = st.threads.get(id.key()) else {
            return;
        };
        if !thread.is_blocked_on(WaitReason::ThreadFlags) {
            return;
        }
        let Some((mask, options)) = thread.wait.and_then(|w| w.flags) else {
            return;
        };
        if let Some(flags) = word.take(mask, options) {
            self.wake(st, id.index(), Ok(WaitValue::Flags(flags)));
        }
    }
}
