//! Thread control blocks, priorities and creation parameters.

use alloc::vec::Vec;
use core::fmt;
use core::task::Poll;

use crate::config::MAX_PRIORITY;
use crate::error::{KernelError, KernelResult};
use crate::flags::FlagOptions;
use crate::kernel::{Kernel, KernelState, Timeout, WaitValue};
use crate::list::{DeltaLink, DeltaLinked, Link, Linked};
use crate::pool::Block;
use crate::port::Port;
use crate::queue::Message;
use crate::semaphore::SemaphoreId;
use crate::slots::object_id;
use crate::trace::records;

object_id!(
    /// Handle to a thread.
    ThreadId
);

/// Scheduling priority; higher values run first.
///
/// Priority 0 belongs to the idle thread. Application threads use
/// `1..=MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Priority(pub u8);

impl Priority {
    pub const IDLE: Priority = Priority(0);
    pub const LOW: Priority = Priority(8);
    pub const NORMAL: Priority = Priority(24);
    pub const HIGH: Priority = Priority(40);
    pub const REALTIME: Priority = Priority(48);
    pub const MAX: Priority = Priority(MAX_PRIORITY);

    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Valid for application threads.
    pub const fn is_valid(self) -> bool {
        self.0 >= 1 && self.0 <= MAX_PRIORITY
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Priority({})", self.0)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Priority {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Priority({})", self.0);
    }
}

/// Why a thread is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaitReason {
    Delay,
    Join,
    ThreadFlags,
    EventFlags,
    Mutex,
    Semaphore,
    Pool,
    MessageGet,
    MessagePut,
}

impl WaitReason {
    pub(crate) fn code(self) -> u8 {
        self as u8
    }
}

/// Thread lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThreadState {
    Inactive,
    Ready,
    Running,
    Blocked(WaitReason),
    Terminated,
}

/// Code the port starts a thread at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadEntry {
    User { entry: fn(usize), arg: usize },
    Idle,
    TimerService,
}

/// Where a thread's stack comes from.
pub enum StackSource {
    /// A block of the kernel stack pool.
    Pool,
    /// A caller-provided buffer, owned by the kernel until the thread is
    /// reclaimed.
    Owned(Vec<u8>),
}

impl fmt::Debug for StackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pool => f.write_str("Pool"),
            Self::Owned(buf) => write!(f, "Owned({} bytes)", buf.len()),
        }
    }
}

/// Parameters for [`crate::Kernel::thread_new`].
#[derive(Debug)]
pub struct ThreadConfig {
    pub name: &'static str,
    pub entry: fn(usize),
    pub arg: usize,
    pub priority: Priority,
    /// Requested stack size; 0 selects the pool block size.
    pub stack_size: usize,
    pub stack: StackSource,
    pub joinable: bool,
}

impl ThreadConfig {
    pub fn new(name: &'static str, entry: fn(usize), arg: usize) -> Self {
        Self {
            name,
            entry,
            arg,
            priority: Priority::NORMAL,
            stack_size: 0,
            stack: StackSource::Pool,
            joinable: false,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Uses `buffer` as the stack instead of a pool block.
    pub fn with_stack(mut self, buffer: Vec<u8>) -> Self {
        self.stack = StackSource::Owned(buffer);
        self
    }

    pub fn joinable(mut self, joinable: bool) -> Self {
        self.joinable = joinable;
        self
    }
}

/// Canary word written at the stack base.
pub(crate) const STACK_CANARY: u32 = 0xE25A_2EA5;
/// Fill pattern used for the high-water mark.
pub(crate) const STACK_FILL: u8 = 0xCC;
/// Smallest stack accepted from a caller buffer.
pub const MIN_STACK_SIZE: usize = 64;

pub(crate) enum Stack {
    Pool(Block),
    Owned(Vec<u8>),
}

/// What a blocked thread is waiting for.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Wait {
    pub reason: WaitReason,
    /// Slot index of the object whose wait list holds the thread.
    pub object: u16,
    pub flags: Option<(u32, FlagOptions)>,
}

/// Thread control block.
pub(crate) struct Thread {
    pub name: &'static str,
    pub entry: ThreadEntry,
    pub state: ThreadState,
    pub base_priority: Priority,
    pub priority: Priority,
    pub stack: Stack,
    pub stack_size: usize,
    pub link: Link,
    pub delay: DeltaLink,
    pub wait: Option<Wait>,
    pub wait_result: Option<KernelResult<WaitValue>>,
    /// Message a blocked producer deposits once space frees up.
    pub outgoing: Option<Message>,
    /// First mutex in this thread's owned list.
    pub owned_mutexes: Option<u16>,
    pub joinable: bool,
    pub join_waiter: Option<u16>,
    pub slice: u32,
    /// Tick at which the current timed wait gives up.
    pub deadline: Option<u64>,
    /// Semaphore whose token this woken thread takes when it next runs.
    pub claim: Option<SemaphoreId>,
}

impl Thread {
    pub fn new(name: &'static str, entry: ThreadEntry, priority: Priority, stack: Stack, stack_size: usize) -> Self {
        Self {
            name,
            entry,
            state: ThreadState::Inactive,
            base_priority: priority,
            priority,
            stack,
            stack_size,
            link: Link::default(),
            delay: DeltaLink::default(),
            wait: None,
            wait_result: None,
            outgoing: None,
            owned_mutexes: None,
            joinable: false,
            join_waiter: None,
            slice: 0,
            deadline: None,
            claim: None,
        }
    }

    pub fn is_blocked_on(&self, reason: WaitReason) -> bool {
        self.state == ThreadState::Blocked(reason)
    }
}

impl Linked for Thread {
    fn link(&self) -> &Link {
        &self.link
    }

    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

impl DeltaLinked for Thread {
    fn delta_link(&self) -> &DeltaLink {
        &self.delay
    }

    fn delta_link_mut(&mut self) -> &mut DeltaLink {
        &mut self.delay
    }
}

/// Writes the canary and watermark fill into a fresh stack.
pub(crate) fn init_stack(stack: &mut [u8], watermark: bool) {
    if watermark {
        stack.fill(STACK_FILL);
    }
    if let Some(base) = stack.get_mut(..4) {
        base.copy_from_slice(&STACK_CANARY.to_le_bytes());
    }
}

pub(crate) fn canary_intact(stack: &[u8]) -> bool {
    stack.get(..4) == Some(&STACK_CANARY.to_le_bytes()[..])
}

/// Bytes above the canary that still hold the fill pattern.
pub(crate) fn untouched_bytes(stack: &[u8]) -> usize {
    stack
        .iter()
        .skip(4)
        .take_while(|b| **b == STACK_FILL)
        .count()
}

/// Largest relative wake-up accepted by [`Kernel::delay_until`].
const MAX_DELAY_UNTIL: u64 = 0x7FFF_FFFF;

impl<P: Port> Kernel<P> {
    /// Creates a thread and makes it ready. May be called before [`Kernel::start`].
    pub fn thread_new(&self, config: ThreadConfig) -> KernelResult<ThreadId> {
        self.thread_context()?;
        let ThreadConfig {
            name,
            entry,
            arg,
            priority,
            stack_size,
            stack,
            joinable,
        } = config;
        if !priority.is_valid() {
            return Err(KernelError::Parameter);
        }

        self.with_state(|st| {
            let system = st.idle.is_some() as usize + st.timer_thread.is_some() as usize;
            if st.threads.len() - system >= self.config().max_threads as usize {
                return Err(KernelError::NoMemory);
            }

            let (stack, size) = match stack {
                StackSource::Pool => {
                    let block_size = st.stack_pool.block_size();
                    if stack_size > block_size {
                        return Err(KernelError::Parameter);
                    }
                    let block = st.stack_pool.alloc().ok_or(KernelError::NoMemory)?;
                    (Stack::Pool(block), block_size)
                }
                StackSource::Owned(buffer) => {
                    if buffer.len() < MIN_STACK_SIZE || buffer.len() < stack_size {
                        return Err(KernelError::Parameter);
                    }
                    let len = buffer.len();
                    (Stack::Owned(buffer), len)
                }
            };
            let pooled = match &stack {
                Stack::Pool(block) => Some(*block),
                Stack::Owned(_) => None,
            };

            match self.spawn(st, name, ThreadEntry::User { entry, arg }, priority, stack, size) {
                Ok(index) => {
                    st.threads.at_mut(index).joinable = joinable;
                    st.thread_id(index).ok_or(KernelError::InvalidHandle)
                }
                Err(err) => {
                    if let Some(block) = pooled {
                        if let Err(free_err) = st.stack_pool.free(block) {
                            log::warn!("stack of unborn thread '{}' not returned: {}", name, free_err);
                        }
                    }
                    Err(err)
                }
            }
        })
    }

    /// Terminates the calling thread.
    pub fn thread_exit(&self) -> KernelResult<()> {
        self.thread_context()?;
        self.with_state(|st| {
            let index = st.current()?;
            // The caller could not be switched away from.
            if is_system(st, index) || st.lock_depth > 0 {
                return Err(KernelError::InvalidState);
            }
            self.terminate(st, index, records::thread::EXIT);
            Ok(())
        })
    }

    pub fn thread_terminate(&self, id: ThreadId) -> KernelResult<()> {
        self.thread_context()?;
        self.with_state(|st| {
            let thread = st.threads.get(id.key())?;
            if thread.state == ThreadState::Terminated {
                return Err(KernelError::InvalidState);
            }
            if is_system(st, id.index()) {
                return Err(KernelError::Parameter);
            }
            if st.running == Some(id.index()) && st.lock_depth > 0 {
                return Err(KernelError::InvalidState);
            }
            self.terminate(st, id.index(), records::thread::TERMINATE);
            Ok(())
        })
    }

    fn terminate(&self, st: &mut KernelState, index: u16, record: u8) {
        match st.threads.at(index).state {
            ThreadState::Ready => {
                let prio = st.threads.at(index).priority;
                st.ready.remove(&mut st.threads, index, prio);
                self.semaphore_unclaim(st, index);
            }
            ThreadState::Blocked(_) => {
                self.unlink_waiter(st, index);
            }
            ThreadState::Running => st.switch_pending = true,
            ThreadState::Inactive | ThreadState::Terminated => {}
        }

        self.release_owned_mutexes(st, index);
        if let Ok(word) = self.thread_words.at(index) {
            word.tag.unbind();
        }

        let thread = st.threads.at_mut(index);
        thread.state = ThreadState::Terminated;
        thread.wait_result = None;
        thread.outgoing = None;
        let joiner = thread.join_waiter.take();
        let joinable = thread.joinable;
        self.emit(record, &index.to_le_bytes());
        log::debug!("thread {} '{}' terminated", index, thread.name);

        if let Some(joiner) = joiner {
            self.unlink_waiter(st, joiner);
            self.wake(st, joiner, Ok(WaitValue::Unit));
            self.retire(st, index);
        } else if !joinable {
            self.retire(st, index);
        }
    }

    /// Reclaims a terminated thread, deferring until the scheduler has
    /// switched away if it is still the running one.
    fn retire(&self, st: &mut KernelState, index: u16) {
        if st.running == Some(index) {
            st.terminated.push_back(&mut st.threads, index);
        } else {
            self.reclaim(st, index);
        }
    }

    /// Waits for a joinable thread to terminate, then reclaims it.
    pub fn thread_join(&self, id: ThreadId) -> KernelResult<Poll<()>> {
        self.thread_context()?;
        self.with_state(|st| {
            let target = st.threads.get(id.key())?;
            let index = id.index();
            if st.running == Some(index) {
                return Err(KernelError::Deadlock);
            }
            if !target.joinable || target.join_waiter.is_some() {
                return Err(KernelError::Resource);
            }
            if target.state == ThreadState::Terminated {
                self.emit(records::thread::JOIN, &index.to_le_bytes());
                self.reclaim(st, index);
                return Ok(Poll::Ready(()));
            }

            let me = self.begin_wait(st)?;
            st.threads.at_mut(index).join_waiter = Some(me);
            let wait = Wait {
                reason: WaitReason::Join,
                object: index,
                flags: None,
            };
            self.suspend(st, me, wait, Timeout::FOREVER);
            Ok(Poll::Pending)
        })
    }

    /// Makes a joinable thread detached; a terminated one is reclaimed.
    pub fn thread_detach(&self, id: ThreadId) -> KernelResult<()> {
        self.thread_context()?;
        self.with_state(|st| {
            let thread = st.threads.get_mut(id.key())?;
            if !thread.joinable || thread.join_waiter.is_some() {
                return Err(KernelError::Resource);
            }
            thread.joinable = false;
            if thread.state == ThreadState::Terminated {
                self.retire(st, id.index());
            }
            Ok(())
        })
    }

    /// Hands the processor to the next ready thread of equal priority.
    pub fn thread_yield(&self) -> KernelResult<()> {
        self.thread_context()?;
        self.with_state(|st| {
            let index = st.current()?;
            let prio = st.threads.at(index).priority;
            if st.ready.has_ready(prio) {
                st.threads.at_mut(index).state = ThreadState::Ready;
                st.ready.push_back(&mut st.threads, index);
                st.switch_pending = true;
            }
            Ok(())
        })
    }

    /// Suspends the caller for `ticks` ticks; 0 returns immediately.
    pub fn delay(&self, ticks: u32) -> KernelResult<Poll<()>> {
        self.thread_context()?;
        if ticks == 0 {
            return Ok(Poll::Ready(()));
        }
        self.wait_timeout(Timeout(ticks))?;
        self.with_state(|st| {
            let index = self.begin_wait(st)?;
            self.sleep(st, index, ticks.min(u32::MAX - 1));
            Ok(Poll::Pending)
        })
    }

    /// Suspends the caller until the tick counter reaches `tick`.
    pub fn delay_until(&self, tick: u64) -> KernelResult<Poll<()>> {
        self.thread_context()?;
        self.with_state(|st| {
            let ticks = tick.wrapping_sub(st.tick);
            if ticks == 0 || ticks > MAX_DELAY_UNTIL {
                return Err(KernelError::Parameter);
            }
            let index = self.begin_wait(st)?;
            self.sleep(st, index, ticks as u32);
            Ok(Poll::Pending)
        })
    }

    fn sleep(&self, st: &mut KernelState, index: u16, ticks: u32) {
        let wait = Wait {
            reason: WaitReason::Delay,
            object: 0,
            flags: None,
        };
        self.suspend(st, index, wait, Timeout(ticks));
    }

    /// Changes a thread's base priority. Inherited priority still applies.
    pub fn thread_set_priority(&self, id: ThreadId, priority: Priority) -> KernelResult<()> {
        self.thread_context()?;
        if !priority.is_valid() {
            return Err(KernelError::Parameter);
        }
        self.with_state(|st| {
            if st.threads.get(id.key())?.state == ThreadState::Terminated {
                return Err(KernelError::InvalidState);
            }
            if is_system(st, id.index()) {
                return Err(KernelError::Parameter);
            }
            st.threads.at_mut(id.index()).base_priority = priority;
            self.update_priority(st, id.index());
            Ok(())
        })
    }

    /// Effective priority, including inheritance.
    pub fn thread_priority(&self, id: ThreadId) -> KernelResult<Priority> {
        self.inspect(|st| Ok(st.threads.get(id.key())?.priority))
    }

    pub fn thread_base_priority(&self, id: ThreadId) -> KernelResult<Priority> {
        self.inspect(|st| Ok(st.threads.get(id.key())?.base_priority))
    }

    pub fn thread_state(&self, id: ThreadId) -> KernelResult<ThreadState> {
        self.inspect(|st| Ok(st.threads.get(id.key())?.state))
    }

    pub fn thread_name(&self, id: ThreadId) -> KernelResult<&'static str> {
        self.inspect(|st| Ok(st.threads.get(id.key())?.name))
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        self.inspect(|st| st.running.and_then(|index| st.thread_id(index)))
    }

    /// Threads that have not terminated, system threads included.
    pub fn thread_count(&self) -> usize {
        self.inspect(|st| {
            st.threads
                .iter()
                .filter(|(_, t)| t.state != ThreadState::Terminated)
                .count()
        })
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        self.inspect(|st| {
            st.threads
                .iter()
                .filter(|(_, t)| t.state != ThreadState::Terminated)
                .map(|(key, _)| ThreadId(key))
                .collect()
        })
    }

    /// Stack bytes never written since creation; 0 without watermarking.
    pub fn thread_stack_space(&self, id: ThreadId) -> KernelResult<usize> {
        self.inspect(|st| {
            st.threads.get(id.key())?;
            if !self.config().stack_watermark {
                return Ok(0);
            }
            Ok(untouched_bytes(st.stack(id.index())))
        })
    }

    /// Runs `f` over a thread's stack memory, as the thread itself would
    /// write it.
    pub fn with_thread_stack<R>(&self, id: ThreadId, f: impl FnOnce(&mut [u8]) -> R) -> KernelResult<R> {
        self.with_state(|st| {
            st.threads.get(id.key())?;
            Ok(f(st.stack_mut(id.index())))
        })
    }

    /// Takes the result of the thread's last completed blocking call.
    pub fn take_wait_result(&self, id: ThreadId) -> Option<KernelResult<WaitValue>> {
        self.with_state(|st| st.threads.get_mut(id.key()).ok()?.wait_result.take())
    }
}

fn is_system(st: &KernelState, index: u16) -> bool {
    st.idle == Some(index) || st.timer_thread == Some(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: usize) {}

    #[test]
    fn config_builder_sets_fields() {
        let config = ThreadConfig::new("worker", noop, 7)
            .priority(Priority::HIGH)
            .stack_size(512)
            .joinable(true);
        assert_eq!(config.arg, 7);
        assert_eq!(config.priority, Priority::HIGH);
        assert_eq!(config.stack_size, 512);
        assert!(config.joinable);
        assert!(matches!(config.stack, StackSource::Pool));
    }

    #[test]
    fn priority_range() {
        assert!(!Priority::IDLE.is_valid());
        assert!(Priority::LOW.is_valid());
        assert!(Priority::MAX.is_valid());
        assert!(!Priority(64).is_valid());
        assert!(Priority::HIGH > Priority::NORMAL);
    }

    #[test]
    fn stack_watermark_counts_untouched_fill() {
        let mut stack = vec![0u8; 64];
        init_stack(&mut stack, true);
        assert!(canary_intact(&stack));
        assert_eq!(untouched_bytes(&stack), 60);

        stack[40..].fill(0);
        assert_eq!(untouched_bytes(&stack), 36);

        stack[1] = 0;
        assert!(!canary_intact(&stack));
    }
}
