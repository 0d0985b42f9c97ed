//! Software timers.
//!
//! Active timers sit in a delta list ordered by expiry. The tick handler never
//! runs callbacks: it posts the expired timer's handle to the timer thread's
//! private queue, and the timer thread runs the callback through
//! [`Kernel::timer_service`] with no kernel lock held.

use core::task::Poll;

use crate::error::{KernelError, KernelResult};
use crate::kernel::{Kernel, KernelState, Timeout, WaitValue};
use crate::list::{DeltaLink, DeltaLinked};
use crate::port::Port;
use crate::queue::Message;
use crate::slots::{object_id, Key};
use crate::trace::records;

object_id!(
    /// Handle to a software timer.
    TimerId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerKind {
    OneShot,
    /// Re-armed with the same period after every expiry.
    Periodic,
}

pub(crate) struct TimerCb {
    pub name: &'static str,
    pub kind: TimerKind,
    pub callback: fn(usize),
    pub arg: usize,
    pub period: u32,
    pub running: bool,
    pub link: DeltaLink,
}

impl DeltaLinked for TimerCb {
    fn delta_link(&self) -> &DeltaLink {
        &self.link
    }

    fn delta_link_mut(&mut self) -> &mut DeltaLink {
        &mut self.link
    }
}

impl<P: Port> Kernel<P> {
    pub fn timer_new(
        &self,
        name: &'static str,
        kind: TimerKind,
        callback: fn(usize),
        arg: usize,
    ) -> KernelResult<TimerId> {
        self.thread_context()?;
        self.with_state(|st| {
            let key = st.timers.insert(TimerCb {
                name,
                kind,
                callback,
                arg,
                period: 0,
                running: false,
                link: DeltaLink::default(),
            })?;
            self.emit(records::timer::CREATE, &key.index().to_le_bytes());
            log::debug!("timer '{}' created ({:?})", name, kind);
            Ok(TimerId(key))
        })
    }

    /// Arms the timer to expire after `ticks`; a running timer is re-armed.
    pub fn timer_start(&self, id: TimerId, ticks: u32) -> KernelResult<()> {
        self.thread_context()?;
        if ticks == 0 || ticks == u32::MAX {
            return Err(KernelError::Parameter);
        }
        self.with_state(|st| {
            st.timers.get(id.key())?;
            st.active_timers.remove(&mut st.timers, id.index());
            let cb = st.timers.at_mut(id.index());
            cb.period = ticks;
            cb.running = true;
            st.active_timers.insert(&mut st.timers, id.index(), ticks);
            self.emit(records::timer::START, &id.index().to_le_bytes());
            Ok(())
        })
    }

    pub fn timer_stop(&self, id: TimerId) -> KernelResult<()> {
        self.thread_context()?;
        self.with_state(|st| {
            let cb = st.timers.get_mut(id.key())?;
            if !cb.running {
                return Err(KernelError::Resource);
            }
            cb.running = false;
            st.active_timers.remove(&mut st.timers, id.index());
            self.emit(records::timer::STOP, &id.index().to_le_bytes());
            Ok(())
        })
    }

    pub fn timer_is_running(&self, id: TimerId) -> KernelResult<bool> {
        self.inspect(|st| Ok(st.timers.get(id.key())?.running))
    }

    /// Ticks until the next expiry of a running timer.
    pub fn timer_remaining(&self, id: TimerId) -> KernelResult<Option<u32>> {
        self.inspect(|st| {
            st.timers.get(id.key())?;
            Ok(st.active_timers.remaining(&st.timers, id.index()))
        })
    }

    pub fn timer_name(&self, id: TimerId) -> KernelResult<&'static str> {
        self.inspect(|st| Ok(st.timers.get(id.key())?.name))
    }

    pub fn timer_delete(&self, id: TimerId) -> KernelResult<()> {
        self.thread_context()?;
        self.with_state(|st| {
            st.timers.get(id.key())?;
            st.active_timers.remove(&mut st.timers, id.index());
            let cb = st.timers.remove(id.key())?;
            self.emit(records::timer::DELETE, &id.index().to_le_bytes());
            log::debug!("timer '{}' deleted", cb.name);
            Ok(())
        })
    }

    /// Tick step: expires due timers and posts them to the timer thread.
    pub(crate) fn advance_timers(&self, st: &mut KernelState) {
        st.active_timers.tick(&mut st.timers);
        let mut posted = false;
        while let Some(index) = st.active_timers.pop_expired(&mut st.timers) {
            let Some(key) = st.timers.key_at(index) else {
                continue;
            };
            let cb = st.timers.at_mut(index);
            match cb.kind {
                TimerKind::Periodic => {
                    let period = cb.period;
                    st.active_timers.insert(&mut st.timers, index, period);
                }
                TimerKind::OneShot => cb.running = false,
            }
            self.emit(records::timer::EXPIRE, &index.to_le_bytes());

            let Some(queue) = st.timer_queue else {
                continue;
            };
            let queued = self
                .queue_leaves
                .at(queue.index())
                .and_then(|leaf| leaf.with(queue.key(), |store| store.push(0, &key.to_bytes())));
            match queued {
                Ok(Ok(())) => posted = true,
                _ => log::warn!("timer queue full, expiry of timer {} dropped", TimerId(key)),
            }
        }
        if posted {
            if let Some(queue) = st.timer_queue {
                self.queue_deliver(st, queue);
            }
        }
    }

    /// Body of the timer thread: runs the callbacks of every expired timer
    /// queued so far, then blocks on the timer queue again.
    ///
    /// Returns the number of callbacks run. Only the timer thread may call it.
    pub fn timer_service(&self) -> KernelResult<usize> {
        self.thread_context()?;
        let (me, queue) = self.inspect(|st| {
            let me = st
                .running
                .filter(|running| Some(*running) == st.timer_thread)
                .and_then(|index| st.thread_id(index));
            (me, st.timer_queue)
        });
        let (Some(me), Some(queue)) = (me, queue) else {
            return Err(KernelError::InvalidState);
        };

        let mut fired = 0;
        let mut next = match self.take_wait_result(me) {
            Some(Ok(WaitValue::Message(message))) => Some(message),
            _ => None,
        };
        loop {
            if let Some(message) = next.take() {
                if self.fire(&message) {
                    fired += 1;
                }
            }
            match self.queue_get(queue, Timeout::FOREVER)? {
                Poll::Ready(message) => next = Some(message),
                Poll::Pending => return Ok(fired),
            }
        }
    }

    fn fire(&self, message: &Message) -> bool {
        let Some(key) = Key::from_bytes(message.data()) else {
            return false;
        };
        let target = self.inspect(|st| st.timers.get(key).ok().map(|cb| (cb.callback, cb.arg)));
        let Some((callback, arg)) = target else {
            return false;
        };
        self.emit(records::timer::CALLBACK, &key.index().to_le_bytes());
        callback(arg);
        true
    }
}
