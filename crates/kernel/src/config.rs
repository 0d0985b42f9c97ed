//! Kernel configuration.
//!
//! Sizing decisions are made once, when the kernel is built: every object
//! table, the stack pool and the system threads are allocated up front and
//! never grow.

use crate::error::FatalError;
use crate::thread::Priority;

/// Highest thread priority.
pub const MAX_PRIORITY: u8 = 63;
/// Number of distinct priority levels, including idle.
pub const PRIORITY_LEVELS: usize = MAX_PRIORITY as usize + 1;
/// Depth of the interrupt post-processing queue.
pub const ISR_QUEUE_DEPTH: usize = 16;
/// Largest message a queue accepts, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 64;
/// Deepest critical-section nesting.
pub const MAX_CRITICAL_NESTING: u8 = 255;
/// Deepest interrupt nesting.
pub const MAX_INTERRUPT_NESTING: u8 = 32;

/// Runtime configuration for [`crate::Kernel`].
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub name: &'static str,
    /// Tick frequency in Hz.
    pub tick_hz: u32,
    /// Round-robin slice in ticks; 0 disables time slicing.
    pub round_robin: u32,
    pub max_threads: u16,
    pub max_mutexes: u16,
    pub max_semaphores: u16,
    pub max_event_flags: u16,
    pub max_pools: u16,
    pub max_queues: u16,
    pub max_timers: u16,
    /// Size of each block in the thread stack pool.
    pub default_stack_size: usize,
    /// Number of blocks in the thread stack pool.
    pub stack_pool_blocks: usize,
    pub idle_stack_size: usize,
    pub timer_stack_size: usize,
    pub timer_thread_priority: Priority,
    /// Capacity of the timer thread's expiry queue.
    pub timer_queue_depth: u16,
    /// Verify the stack canary whenever a thread is switched out.
    pub stack_check: bool,
    /// Fill stacks with a pattern so unused space can be measured.
    pub stack_watermark: bool,
    pub fatal_hook: Option<fn(&FatalError)>,
    pub idle_callback: Option<fn()>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: "ember",
            tick_hz: 1000,
            round_robin: 5,
            max_threads: 16,
            max_mutexes: 8,
            max_semaphores: 8,
            max_event_flags: 8,
            max_pools: 4,
            max_queues: 4,
            max_timers: 8,
            default_stack_size: 1024,
            stack_pool_blocks: 16,
            idle_stack_size: 256,
            timer_stack_size: 512,
            timer_thread_priority: Priority::HIGH,
            timer_queue_depth: 8,
            stack_check: true,
            stack_watermark: true,
            fatal_hook: None,
            idle_callback: None,
        }
    }
}

impl KernelConfig {
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }

    /// Converts milliseconds to ticks, rounding up so a non-zero duration
    /// never becomes a zero-tick wait.
    pub fn ms_to_ticks(&self, ms: u32) -> u32 {
        let ticks = (ms as u64 * self.tick_hz as u64).div_ceil(1000);
        ticks.min(u32::MAX as u64 - 1) as u32
    }

    /// Converts this configuration to a trace target-info description.
    #[cfg(feature = "trace")]
    pub fn to_target_info(&self) -> ember_trace::TargetInfo {
        ember_trace::TargetInfo {
            is_reset: true,
            version: 10,
            tick_hz: self.tick_hz,
            max_priority: MAX_PRIORITY,
            max_threads: self.max_threads,
            isr_queue_depth: ISR_QUEUE_DEPTH as u8,
            max_message_size: MAX_MESSAGE_SIZE as u8,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct KernelConfigBuilder {
    config: KernelConfig,
}

impl KernelConfigBuilder {
    pub fn name(mut self, name: &'static str) -> Self {
        self.config.name = name;
        self
    }

    pub fn tick_hz(mut self, hz: u32) -> Self {
        self.config.tick_hz = hz;
        self
    }

    /// Sets the round-robin slice; 0 disables time slicing.
    pub fn round_robin(mut self, ticks: u32) -> Self {
        self.config.round_robin = ticks;
        self
    }

    pub fn max_threads(mut self, max: u16) -> Self {
        self.config.max_threads = max;
        self
    }

    /// Sets the capacity of every object table at once.
    pub fn max_objects(mut self, max: u16) -> Self {
        self.config.max_mutexes = max;
        self.config.max_semaphores = max;
        self.config.max_event_flags = max;
        self.config.max_pools = max;
        self.config.max_queues = max;
        self.config.max_timers = max;
        self
    }

    pub fn max_mutexes(mut self, max: u16) -> Self {
        self.config.max_mutexes = max;
        self
    }

    pub fn max_semaphores(mut self, max: u16) -> Self {
        self.config.max_semaphores = max;
        self
    }

    pub fn max_timers(mut self, max: u16) -> Self {
        self.config.max_timers = max;
        self
    }

    /// Sizes the thread stack pool.
    pub fn stack_pool(mut self, blocks: usize, block_size: usize) -> Self {
        self.config.stack_pool_blocks = blocks;
        self.config.default_stack_size = block_size;
        self
    }

    pub fn system_stacks(mut self, idle: usize, timer: usize) -> Self {
        self.config.idle_stack_size = idle;
        self.config.timer_stack_size = timer;
        self
    }

    pub fn timer_thread(mut self, priority: Priority, queue_depth: u16) -> Self {
        self.config.timer_thread_priority = priority;
        self.config.timer_queue_depth = queue_depth;
        self
    }

    pub fn stack_check(mut self, enabled: bool) -> Self {
        self.config.stack_check = enabled;
        self
    }

    pub fn stack_watermark(mut self, enabled: bool) -> Self {
        self.config.stack_watermark = enabled;
        self
    }

    pub fn fatal_hook(mut self, hook: fn(&FatalError)) -> Self {
        self.config.fatal_hook = Some(hook);
        self
    }

    pub fn idle_callback(mut self, callback: fn()) -> Self {
        self.config.idle_callback = Some(callback);
        self
    }

    pub fn build(self) -> KernelConfig {
        self.config
    }
}
