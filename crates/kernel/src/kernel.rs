//! Kernel instance: scheduler state, dispatch, tick and interrupt entry.
//!
//! All mutable scheduling state sits in one [`KernelState`] behind the state
//! lock. Service calls follow the same shape: validate, do the lock-free part
//! of the operation, then either process the object under the state lock
//! (thread context) or queue it for the outermost interrupt exit (interrupt
//! context). A context switch is requested by setting `switch_pending`; it is
//! carried out when the lock is released, unless an interrupt is active or the
//! scheduler is locked, in which case it waits for whichever ends last.

use alloc::vec;
use core::marker::PhantomData;

use crate::atomic::{Atomic8, AtomicWord};
use crate::config::{KernelConfig, MAX_INTERRUPT_NESTING};
use crate::critical::{CriticalGuard, CriticalSection};
use crate::error::{FatalError, KernelError, KernelResult};
use crate::flags::{EventFlagsCb, FlagWord};
use crate::isr::{PostEvent, PostQueue};
use crate::list::{DeltaList, List};
use crate::mempool::PoolCb;
use crate::mutex::MutexCb;
use crate::pool::{Block, MemoryPool};
use crate::port::Port;
use crate::queue::{Message, QueueCb, QueueId, QueueStore};
use crate::scheduler::ReadyQueue;
use crate::semaphore::{SemaphoreCb, SemaphoreCounter};
use crate::slots::{Leaf, ObjectPool, SlotTable};
use crate::sync::Mutex;
use crate::thread::{self, Priority, Stack, Thread, ThreadEntry, ThreadId, ThreadState, Wait, WaitReason};
use crate::timer::TimerCb;
use crate::trace::{records, TraceHook};

/// Wait duration in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timeout(pub u32);

impl Timeout {
    /// Fail immediately instead of blocking.
    pub const NO_WAIT: Timeout = Timeout(0);
    /// Block until the wait is satisfied.
    pub const FOREVER: Timeout = Timeout(u32::MAX);

    pub const fn ticks(ticks: u32) -> Self {
        Self(ticks)
    }

    pub const fn is_no_wait(self) -> bool {
        self.0 == 0
    }

    pub const fn is_forever(self) -> bool {
        self.0 == u32::MAX
    }
}

impl From<u32> for Timeout {
    fn from(ticks: u32) -> Self {
        Self(ticks)
    }
}

/// Value delivered to a thread whose blocking call completed after it was
/// suspended. Fetch it with [`Kernel::take_wait_result`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitValue {
    Unit,
    Flags(u32),
    Block(Block),
    Message(Message),
}

impl WaitValue {
    pub fn flags(&self) -> Option<u32> {
        match self {
            Self::Flags(flags) => Some(*flags),
            _ => None,
        }
    }

    pub fn block(&self) -> Option<Block> {
        match self {
            Self::Block(block) => Some(*block),
            _ => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            Self::Message(message) => Some(message),
            _ => None,
        }
    }
}

/// Coarse kernel status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KernelStatus {
    /// Built but not started.
    Ready,
    Running,
    /// Scheduler locked; no context switches until unlocked.
    Locked,
    /// A fatal error stopped the kernel.
    Halted,
}

pub(crate) struct KernelState {
    pub started: bool,
    pub running: Option<u16>,
    pub threads: ObjectPool<Thread>,
    pub ready: ReadyQueue,
    pub delays: DeltaList,
    /// Detached threads that exited and wait to be reclaimed.
    pub terminated: List,
    pub idle: Option<u16>,
    pub timer_thread: Option<u16>,
    pub timer_queue: Option<QueueId>,
    pub tick: u64,
    pub lock_depth: u8,
    pub switch_pending: bool,
    pub stack_pool: MemoryPool,
    pub mutexes: ObjectPool<MutexCb>,
    pub semaphores: ObjectPool<SemaphoreCb>,
    pub event_flags: ObjectPool<EventFlagsCb>,
    pub pools: ObjectPool<PoolCb>,
    pub queues: ObjectPool<QueueCb>,
    pub timers: ObjectPool<TimerCb>,
    pub active_timers: DeltaList,
}

impl KernelState {
    fn new(config: &KernelConfig) -> KernelResult<Self> {
        Ok(Self {
            started: false,
            running: None,
            threads: ObjectPool::with_capacity(config.max_threads as usize + 2),
            ready: ReadyQueue::new(),
            delays: DeltaList::new(),
            terminated: List::new(),
            idle: None,
            timer_thread: None,
            timer_queue: None,
            tick: 0,
            lock_depth: 0,
            switch_pending: false,
            stack_pool: MemoryPool::new(config.stack_pool_blocks, config.default_stack_size)?,
            mutexes: ObjectPool::with_capacity(config.max_mutexes as usize),
            semaphores: ObjectPool::with_capacity(config.max_semaphores as usize),
            event_flags: ObjectPool::with_capacity(config.max_event_flags as usize),
            pools: ObjectPool::with_capacity(config.max_pools as usize),
            queues: ObjectPool::with_capacity(config.max_queues as usize + 1),
            timers: ObjectPool::with_capacity(config.max_timers as usize),
            active_timers: DeltaList::new(),
        })
    }

    pub fn thread_id(&self, index: u16) -> Option<ThreadId> {
        self.threads.key_at(index).map(ThreadId)
    }

    /// Index of the running thread if it may block right now.
    pub fn current(&self) -> KernelResult<u16> {
        let index = self.running.ok_or(KernelError::InvalidState)?;
        if self.threads.at(index).state != ThreadState::Running {
            return Err(KernelError::InvalidState);
        }
        Ok(index)
    }

    /// Object wait list a blocked thread sits in, with the thread slab.
    pub fn wait_list(&mut self, wait: &Wait) -> (Option<&mut List>, &mut ObjectPool<Thread>) {
        let KernelState {
            threads,
            mutexes,
            semaphores,
            event_flags,
            pools,
            queues,
            ..
        } = self;
        let list = match wait.reason {
            WaitReason::Mutex => mutexes.try_at_mut(wait.object).map(|m| &mut m.waiters),
            WaitReason::Semaphore => semaphores.try_at_mut(wait.object).map(|s| &mut s.waiters),
            WaitReason::EventFlags => event_flags.try_at_mut(wait.object).map(|e| &mut e.waiters),
            WaitReason::Pool => pools.try_at_mut(wait.object).map(|p| &mut p.waiters),
            WaitReason::MessageGet => queues.try_at_mut(wait.object).map(|q| &mut q.getters),
            WaitReason::MessagePut => queues.try_at_mut(wait.object).map(|q| &mut q.putters),
            WaitReason::Delay | WaitReason::Join | WaitReason::ThreadFlags => None,
        };
        (list, threads)
    }

    pub fn stack(&self, index: u16) -> &[u8] {
        match &self.threads.at(index).stack {
            Stack::Pool(block) => self.stack_pool.block(block).unwrap_or(&[]),
            Stack::Owned(buffer) => buffer.as_slice(),
        }
    }

    pub fn stack_mut(&mut self, index: u16) -> &mut [u8] {
        let KernelState {
            threads, stack_pool, ..
        } = self;
        match &mut threads.at_mut(index).stack {
            Stack::Pool(block) => stack_pool.block_mut(block).unwrap_or(&mut []),
            Stack::Owned(buffer) => buffer.as_mut_slice(),
        }
    }
}

/// Builder for [`Kernel`].
pub struct KernelBuilder<P: Port> {
    config: KernelConfig,
    trace: Option<TraceHook>,
    _port: PhantomData<fn() -> P>,
}

impl<P: Port> KernelBuilder<P> {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            trace: None,
            _port: PhantomData,
        }
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_trace_hook(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }

    pub fn build(self, port: P) -> KernelResult<Kernel<P>> {
        Kernel::new(self.config, port, self.trace)
    }
}

pub struct Kernel<P: Port> {
    port: P,
    config: KernelConfig,
    trace: Option<TraceHook>,
    critical: Mutex<CriticalSection>,
    state: Mutex<KernelState>,
    posts: Mutex<PostQueue>,
    isr_nesting: Atomic8,
    halted: Atomic8,
    pub(crate) sem_counters: SlotTable<SemaphoreCounter>,
    pub(crate) event_words: SlotTable<FlagWord>,
    pub(crate) thread_words: SlotTable<FlagWord>,
    pub(crate) pool_leaves: SlotTable<Leaf<MemoryPool>>,
    pub(crate) queue_leaves: SlotTable<Leaf<QueueStore>>,
}

impl<P: Port> Kernel<P> {
    pub fn builder() -> KernelBuilder<P> {
        KernelBuilder::new(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> KernelBuilder<P> {
        KernelBuilder::new(config)
    }

    fn new(config: KernelConfig, port: P, trace: Option<TraceHook>) -> KernelResult<Self> {
        if !config.timer_thread_priority.is_valid()
            || config.tick_hz == 0
            || config.timer_queue_depth == 0
            || config.max_threads > u16::MAX - 2
            || config.idle_stack_size < thread::MIN_STACK_SIZE
            || config.timer_stack_size < thread::MIN_STACK_SIZE
        {
            return Err(KernelError::Parameter);
        }

        let state = KernelState::new(&config)?;
        let threads = state.threads.capacity();
        let queues = state.queues.capacity();

        Ok(Self {
            sem_counters: SlotTable::new(config.max_semaphores as usize, SemaphoreCounter::new),
            event_words: SlotTable::new(config.max_event_flags as usize, FlagWord::new),
            thread_words: SlotTable::new(threads, FlagWord::new),
            pool_leaves: SlotTable::new(config.max_pools as usize, Leaf::new),
            queue_leaves: SlotTable::new(queues, Leaf::new),
            port,
            config,
            trace,
            critical: Mutex::new(CriticalSection::new()),
            state: Mutex::new(state),
            posts: Mutex::new(PostQueue::new()),
            isr_nesting: Atomic8::new(0),
            halted: Atomic8::new(0),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn trace_hook(&self) -> Option<TraceHook> {
        self.trace.clone()
    }

    /// Creates the idle and timer threads and switches to the highest
    /// priority ready thread.
    pub fn start(&self) -> KernelResult<()> {
        self.thread_context()?;
        self.with_state(|st| {
            if st.started {
                return Err(KernelError::InvalidState);
            }

            let idle = self.spawn(
                st,
                "idle",
                ThreadEntry::Idle,
                Priority::IDLE,
                Stack::Owned(vec![0; self.config.idle_stack_size]),
                self.config.idle_stack_size,
            )?;
            st.idle = Some(idle);

            let queue = self.create_queue(st, "timer", self.config.timer_queue_depth, 4)?;
            st.timer_queue = Some(queue);
            let timer = self.spawn(
                st,
                "timer",
                ThreadEntry::TimerService,
                self.config.timer_thread_priority,
                Stack::Owned(vec![0; self.config.timer_stack_size]),
                self.config.timer_stack_size,
            )?;
            st.timer_thread = Some(timer);
            self.park_on_queue(st, timer, queue);

            st.started = true;
            st.switch_pending = true;
            #[cfg(feature = "trace")]
            self.announce(st);
            self.emit(records::kernel::START, &(st.threads.len() as u16).to_le_bytes());
            log::info!("kernel '{}' started with {} threads", self.config.name, st.threads.len());
            Ok(())
        })
    }

    /// Blocks a freshly created thread on `queue` without it ever running.
    fn park_on_queue(&self, st: &mut KernelState, index: u16, queue: QueueId) {
        let prio = st.threads.at(index).priority;
        st.ready.remove(&mut st.threads, index, prio);
        let thread = st.threads.at_mut(index);
        thread.state = ThreadState::Blocked(WaitReason::MessageGet);
        thread.wait = Some(Wait {
            reason: WaitReason::MessageGet,
            object: queue.index(),
            flags: None,
        });
        if let Ok(cb) = st.queues.get_mut(queue.key()) {
            cb.getters.insert_by(&mut st.threads, index, |t| t.priority);
        }
    }

    /// Sends the target description and the thread dictionary to the tracer.
    #[cfg(feature = "trace")]
    fn announce(&self, st: &KernelState) {
        use ember_trace::predefined::{self, ObjectKind};

        if self.trace.is_none() {
            return;
        }
        let info = predefined::target_info_payload(&self.config.to_target_info());
        self.emit(predefined::TARGET_INFO, &info);
        for (key, thread) in st.threads.iter() {
            let entry = predefined::obj_dict_payload(ObjectKind::Thread, key.index(), thread.name);
            self.emit(predefined::OBJ_DICT, &entry);
        }
    }

    pub fn kernel_state(&self) -> KernelStatus {
        if self.is_halted() {
            return KernelStatus::Halted;
        }
        self.inspect(|st| {
            if !st.started {
                KernelStatus::Ready
            } else if st.lock_depth > 0 {
                KernelStatus::Locked
            } else {
                KernelStatus::Running
            }
        })
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load() != 0
    }

    pub fn tick_count(&self) -> u64 {
        self.inspect(|st| st.tick)
    }

    /// Tick entry point, called once per tick from the timer interrupt.
    ///
    /// Order within a tick: tick counter, delay expiry, round-robin budget,
    /// software timers. Any resulting switch happens at the interrupt exit.
    pub fn tick(&self) {
        if self.is_halted() {
            return;
        }
        self.interrupt_enter();
        self.with_state(|st| {
            st.tick = st.tick.wrapping_add(1);
            self.emit(records::kernel::TICK, &(st.tick as u32).to_le_bytes());

            st.delays.tick(&mut st.threads);
            while let Some(index) = st.delays.pop_expired(&mut st.threads) {
                self.expire_wait(st, index);
            }

            self.round_robin(st);
            self.advance_timers(st);
        });
        self.interrupt_exit();
    }

    fn round_robin(&self, st: &mut KernelState) {
        let slice = self.config.round_robin;
        if slice == 0 {
            return;
        }
        let Some(current) = st.running else {
            return;
        };
        let thread = st.threads.at_mut(current);
        if thread.state != ThreadState::Running {
            return;
        }
        thread.slice = thread.slice.saturating_sub(1);
        // An exhausted slice under the scheduler lock rotates on the first
        // tick after the last unlock.
        if thread.slice > 0 || st.lock_depth > 0 {
            return;
        }
        thread.slice = slice;
        let prio = thread.priority;
        if st.ready.has_ready(prio) {
            st.threads.at_mut(current).state = ThreadState::Ready;
            st.ready.push_back(&mut st.threads, current);
            st.switch_pending = true;
        }
    }

    pub fn in_interrupt(&self) -> bool {
        self.isr_nesting.load() > 0
    }

    pub fn interrupt_enter(&self) {
        match self.isr_nesting.increment_below(MAX_INTERRUPT_NESTING) {
            Some(depth) => self.emit(records::isr::ENTER, &[depth + 1]),
            None => self.fatal(FatalError::InterruptNesting),
        }
    }

    /// Leaves an interrupt. The outermost exit drains the post-processing
    /// queue and performs at most one context switch.
    pub fn interrupt_exit(&self) {
        match self.isr_nesting.decrement_nonzero() {
            None => self.fatal(FatalError::InterruptNesting),
            Some(1) => {
                self.emit(records::isr::EXIT, &[0]);
                self.drain_posts();
            }
            Some(depth) => self.emit(records::isr::EXIT, &[depth - 1]),
        }
    }

    fn drain_posts(&self) {
        self.with_state(|st| loop {
            let next = self.posts.lock().pop();
            let Some(event) = next else {
                break;
            };
            let [lo, hi] = event.index().to_le_bytes();
            self.emit(records::isr::POST, &[event.code(), lo, hi]);
            self.process(st, event);
        });
    }

    /// Runs the deferred half of an object operation now, or queues it when
    /// called from an interrupt.
    pub(crate) fn post_or_process(&self, event: PostEvent) {
        if self.in_interrupt() {
            let pushed = self.posts.lock().push(event);
            if let Err(fatal) = pushed {
                self.fatal(fatal);
            }
        } else {
            self.with_state(|st| self.process(st, event));
        }
    }

    fn process(&self, st: &mut KernelState, event: PostEvent) {
        match event {
            PostEvent::Semaphore(id) => self.semaphore_wake(st, id),
            PostEvent::EventFlags(id) => self.event_flags_wake(st, id),
            PostEvent::ThreadFlags(id) => self.thread_flags_wake(st, id),
            PostEvent::Pool(id) => self.pool_wake(st, id),
            PostEvent::QueueData(id) => self.queue_deliver(st, id),
            PostEvent::QueueSpace(id) => self.queue_accept(st, id),
        }
    }

    /// Locks the scheduler; returns the previous lock depth.
    pub fn lock(&self) -> KernelResult<u8> {
        self.thread_context()?;
        self.with_state(|st| {
            let previous = st.lock_depth;
            st.lock_depth = previous.checked_add(1).ok_or(KernelError::Resource)?;
            self.emit(records::kernel::LOCK, &[st.lock_depth]);
            Ok(previous)
        })
    }

    /// Releases one scheduler lock level; a switch requested while locked
    /// happens when the last level is released.
    pub fn unlock(&self) -> KernelResult<u8> {
        self.thread_context()?;
        self.with_state(|st| {
            let previous = st.lock_depth;
            if previous == 0 {
                return Err(KernelError::InvalidState);
            }
            st.lock_depth -= 1;
            self.emit(records::kernel::UNLOCK, &[st.lock_depth]);
            Ok(previous)
        })
    }

    pub fn critical(&self) -> CriticalGuard<'_, P> {
        CriticalGuard::new(self)
    }

    pub fn critical_enter(&self) {
        let entered = self.critical.lock().enter(&self.port);
        if let Err(fatal) = entered {
            self.fatal(fatal);
        }
    }

    pub fn critical_exit(&self) {
        let exited = self.critical.lock().exit(&self.port);
        if let Err(fatal) = exited {
            self.fatal(fatal);
        }
    }

    pub(crate) fn kernel_critical_enter(&self) {
        let entered = self.critical.lock().enter_kernel(&self.port);
        if let Err(fatal) = entered {
            self.fatal(fatal);
        }
    }

    pub(crate) fn kernel_critical_exit(&self) {
        let exited = self.critical.lock().exit_kernel(&self.port);
        if let Err(fatal) = exited {
            self.fatal(fatal);
        }
    }

    pub fn in_critical_section(&self) -> bool {
        self.critical.lock().is_active()
    }

    /// Runs the idle hook; only valid while the idle thread is running.
    pub fn run_idle(&self) -> KernelResult<()> {
        self.thread_context()?;
        let is_idle = self.inspect(|st| st.running.is_some() && st.running == st.idle);
        if !is_idle {
            return Err(KernelError::InvalidState);
        }
        if let Some(callback) = self.config.idle_callback {
            callback();
        }
        self.port.idle();
        Ok(())
    }
}

// Internal plumbing shared by the service modules.
impl<P: Port> Kernel<P> {
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        let _cs = CriticalGuard::internal(self);
        let mut st = self.state.lock();
        let result = f(&mut st);
        if st.switch_pending {
            self.dispatch(&mut st);
        }
        result
    }

    pub(crate) fn inspect<R>(&self, f: impl FnOnce(&KernelState) -> R) -> R {
        let _cs = CriticalGuard::internal(self);
        let st = self.state.lock();
        f(&st)
    }

    pub(crate) fn check_alive(&self) -> KernelResult<()> {
        if self.is_halted() {
            Err(KernelError::InvalidState)
        } else {
            Ok(())
        }
    }

    /// Fails for calls that may not come from an interrupt handler.
    pub(crate) fn thread_context(&self) -> KernelResult<()> {
        self.check_alive()?;
        if self.in_interrupt() {
            Err(KernelError::Isr)
        } else {
            Ok(())
        }
    }

    /// Interrupt handlers never wait; a thread may not wait inside a
    /// critical section it entered itself.
    pub(crate) fn wait_timeout(&self, timeout: Timeout) -> KernelResult<Timeout> {
        if self.in_interrupt() {
            return Ok(Timeout::NO_WAIT);
        }
        if !timeout.is_no_wait() && self.in_critical_section() {
            return Err(KernelError::InvalidState);
        }
        Ok(timeout)
    }

    /// Running thread, if it is allowed to block.
    pub(crate) fn begin_wait(&self, st: &KernelState) -> KernelResult<u16> {
        if !st.started || st.lock_depth > 0 {
            return Err(KernelError::InvalidState);
        }
        st.current()
    }

    /// Blocks `index`; the caller has already linked it into the object's
    /// wait list.
    pub(crate) fn suspend(&self, st: &mut KernelState, index: u16, wait: Wait, timeout: Timeout) {
        let deadline = (!timeout.is_forever()).then(|| st.tick + u64::from(timeout.0));
        let thread = st.threads.at_mut(index);
        thread.state = ThreadState::Blocked(wait.reason);
        thread.wait = Some(wait);
        thread.wait_result = None;
        thread.deadline = deadline;
        if !timeout.is_forever() {
            st.delays.insert(&mut st.threads, index, timeout.0);
        }
        let [lo, hi] = index.to_le_bytes();
        self.emit(records::thread::BLOCK, &[lo, hi, wait.reason.code()]);
        st.switch_pending = true;
    }

    /// Completes a wait: the thread leaves the delay list and becomes ready
    /// with `result`. The caller has already unlinked it from any object list.
    pub(crate) fn wake(&self, st: &mut KernelState, index: u16, result: KernelResult<WaitValue>) {
        st.delays.remove(&mut st.threads, index);
        st.threads.at_mut(index).wait = None;
        self.make_ready(st, index, result);
    }

    fn make_ready(&self, st: &mut KernelState, index: u16, result: KernelResult<WaitValue>) {
        let thread = st.threads.at_mut(index);
        thread.wait_result = Some(result);
        thread.state = ThreadState::Ready;
        st.ready.push_back(&mut st.threads, index);
        self.emit(records::thread::READY, &index.to_le_bytes());
        st.switch_pending = true;
    }

    /// Removes a blocked thread from whatever it waits on, fixing up the
    /// object side. Returns the wait record it had.
    pub(crate) fn unlink_waiter(&self, st: &mut KernelState, index: u16) -> Option<Wait> {
        let wait = st.threads.at(index).wait?;
        st.delays.remove(&mut st.threads, index);
        if let (Some(list), threads) = st.wait_list(&wait) {
            list.remove(threads, index);
        }
        let thread = st.threads.at_mut(index);
        thread.wait = None;
        thread.outgoing = None;

        match wait.reason {
            WaitReason::Mutex => self.mutex_waiters_changed(st, wait.object),
            WaitReason::Join => {
                if let Some(target) = st.threads.try_at_mut(wait.object) {
                    target.join_waiter = None;
                }
            }
            _ => {}
        }
        Some(wait)
    }

    fn expire_wait(&self, st: &mut KernelState, index: u16) {
        let result = match self.unlink_waiter(st, index) {
            Some(Wait {
                reason: WaitReason::Delay,
                ..
            })
            | None => Ok(WaitValue::Unit),
            Some(_) => {
                self.emit(records::thread::TIMEOUT, &index.to_le_bytes());
                Err(KernelError::Timeout)
            }
        };
        self.make_ready(st, index, result);
    }

    /// Moves a thread whose effective priority changed from `old`.
    pub(crate) fn reposition(&self, st: &mut KernelState, index: u16, old: Priority) {
        match st.threads.at(index).state {
            ThreadState::Ready => {
                st.ready.remove(&mut st.threads, index, old);
                st.ready.push_back(&mut st.threads, index);
                st.switch_pending = true;
            }
            ThreadState::Running => st.switch_pending = true,
            ThreadState::Blocked(_) => {
                if let Some(wait) = st.threads.at(index).wait {
                    if let (Some(list), threads) = st.wait_list(&wait) {
                        list.remove(threads, index);
                        list.insert_by(threads, index, |t| t.priority);
                    }
                }
            }
            ThreadState::Inactive | ThreadState::Terminated => {}
        }
    }

    /// Switches to the best ready thread if it should run now.
    fn dispatch(&self, st: &mut KernelState) {
        if !st.started || self.in_interrupt() || st.lock_depth > 0 {
            return;
        }
        st.switch_pending = false;

        loop {
            let Some(top) = st.ready.highest() else {
                return;
            };
            let current = st
                .running
                .filter(|index| st.threads.at(*index).state == ThreadState::Running);
            if let Some(current) = current {
                if top <= st.threads.at(current).priority {
                    return;
                }
            }
            let Some(next) = st.ready.pop_highest(&mut st.threads) else {
                return;
            };
            // A thread that lost its semaphore token went back to waiting.
            if !self.semaphore_claim(st, next) {
                continue;
            }
            if let Some(current) = current {
                st.threads.at_mut(current).state = ThreadState::Ready;
                st.ready.push_front(&mut st.threads, current);
            }
            self.switch_to(st, next);
            return;
        }
    }

    fn switch_to(&self, st: &mut KernelState, next: u16) {
        let from = st.running;
        if let Some(previous) = from {
            if self.config.stack_check && !thread::canary_intact(st.stack(previous)) {
                let id = st
                    .thread_id(previous)
                    .expect("running thread has no slot: kernel invariant broken");
                self.fatal(FatalError::StackOverflow(id));
            }
        }

        let from_id = from.and_then(|index| st.thread_id(index));
        let to_id = st
            .thread_id(next)
            .expect("ready thread has no slot: kernel invariant broken");

        let thread = st.threads.at_mut(next);
        thread.state = ThreadState::Running;
        thread.slice = self.config.round_robin;
        st.running = Some(next);

        let from_raw = from.unwrap_or(u16::MAX).to_le_bytes();
        let to_raw = next.to_le_bytes();
        self.emit(
            records::thread::SWITCH,
            &[from_raw[0], from_raw[1], to_raw[0], to_raw[1]],
        );
        log::trace!("switch {:?} -> {}", from_id, to_id);
        self.port.switch_context(from_id, to_id);

        if st.idle == Some(next) {
            self.emit(records::kernel::IDLE, &[]);
        }
        while let Some(index) = st.terminated.pop_front(&mut st.threads) {
            self.reclaim(st, index);
        }
    }

    /// Frees a terminated thread's stack and control block.
    pub(crate) fn reclaim(&self, st: &mut KernelState, index: u16) {
        let Some(key) = st.threads.key_at(index) else {
            return;
        };
        if let Ok(thread) = st.threads.remove(key) {
            if let Stack::Pool(block) = thread.stack {
                if let Err(err) = st.stack_pool.free(block) {
                    log::warn!("stack block of thread {} not returned: {}", ThreadId(key), err);
                }
            }
            if let Ok(word) = self.thread_words.at(index) {
                word.tag.unbind();
            }
            self.emit(records::thread::RECLAIM, &index.to_le_bytes());
            log::debug!("reclaimed thread {} '{}'", ThreadId(key), thread.name);
        }
    }

    /// Creates a thread control block, prepares its stack and makes it ready.
    pub(crate) fn spawn(
        &self,
        st: &mut KernelState,
        name: &'static str,
        entry: ThreadEntry,
        priority: Priority,
        stack: Stack,
        stack_size: usize,
    ) -> KernelResult<u16> {
        let key = st
            .threads
            .insert(Thread::new(name, entry, priority, stack, stack_size))?;
        let index = key.index();
        let id = ThreadId(key);

        let watermark = self.config.stack_watermark;
        let bytes = st.stack_mut(index);
        thread::init_stack(bytes, watermark);
        self.port.prepare_stack(id, bytes, &entry);

        if let Ok(word) = self.thread_words.at(index) {
            word.word.store(0);
            word.tag.bind(key);
        }

        let thread = st.threads.at_mut(index);
        thread.state = ThreadState::Ready;
        st.ready.push_back(&mut st.threads, index);
        st.switch_pending = true;

        let [lo, hi] = index.to_le_bytes();
        self.emit(records::thread::CREATE, &[lo, hi, priority.raw()]);
        log::debug!("created thread {} '{}' at {}", id, name, priority);
        Ok(index)
    }

    pub(crate) fn emit(&self, record: u8, payload: &[u8]) {
        if let Some(trace) = &self.trace {
            if let Err(err) = trace(record, payload, true) {
                log::warn!("trace record {:#04x} dropped: {}", record, err);
            }
        }
    }

    /// Logs, traces and reports `error`, marks the kernel halted and panics.
    pub(crate) fn fatal(&self, error: FatalError) -> ! {
        log::error!("kernel halted: {}", error);
        let detail = match error {
            FatalError::StackOverflow(id) => id.index().to_le_bytes(),
            _ => [0, 0],
        };
        self.emit(records::kernel::FATAL, &[error.code(), detail[0], detail[1]]);
        if let Some(hook) = self.config.fatal_hook {
            hook(&error);
        }
        self.halted.store(1);
        panic!("kernel halted: {error}");
    }
}
