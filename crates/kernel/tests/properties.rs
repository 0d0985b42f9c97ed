//! Kernel-wide properties exercised through the public API only.

use std::task::Poll;

use ember_kernel::{
    FlagOptions, Kernel, KernelConfig, KernelError, MemoryPool, MutexConfig, Priority, SimPort, ThreadConfig,
    ThreadId, ThreadState, Timeout, WaitReason, WaitValue,
};

fn noop(_: usize) {}

fn kernel(round_robin: u32) -> Kernel<SimPort> {
    let config = KernelConfig::builder().round_robin(round_robin).build();
    Kernel::with_config(config).build(SimPort::new()).unwrap()
}

fn spawn(kernel: &Kernel<SimPort>, name: &'static str, prio: u8) -> ThreadId {
    kernel
        .thread_new(ThreadConfig::new(name, noop, 0).priority(Priority(prio)))
        .unwrap()
}

/// Small deterministic generator so property loops are reproducible.
struct Lcg(u32);

impl Lcg {
    fn next(&mut self, bound: u32) -> u32 {
        self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        (self.0 >> 16) % bound
    }
}

#[test]
fn mutex_has_one_owner_and_inheritance_never_lowers_priority() {
    let kernel = kernel(0);
    let threads: Vec<ThreadId> = (0..4).map(|i| spawn(&kernel, "worker", 4 + i * 3)).collect();
    kernel.start().unwrap();
    let mutex = kernel.mutex_new(MutexConfig::new("shared")).unwrap();
    let mut rng = Lcg(7);

    for _ in 0..400 {
        let Some(current) = kernel.current_thread() else {
            break;
        };
        if threads.contains(&current) {
            if kernel.mutex_owner(mutex) == Ok(Some(current)) {
                // Sometimes sleep while holding it so others contend.
                if rng.next(2) == 0 {
                    let _ = kernel.delay(1 + rng.next(3));
                } else {
                    kernel.mutex_release(mutex).unwrap();
                }
            } else {
                let timeout = Timeout(1 + rng.next(4));
                let _ = kernel.mutex_acquire(mutex, timeout);
            }
        }
        kernel.tick();
        let _ = kernel.take_wait_result(current);

        let owner = kernel.mutex_owner(mutex).unwrap();
        let holders = threads
            .iter()
            .filter(|t| owner == Some(**t))
            .count();
        assert!(holders <= 1);
        for thread in &threads {
            let base = kernel.thread_base_priority(*thread).unwrap();
            assert!(kernel.thread_priority(*thread).unwrap() >= base);
        }
    }
}

#[test]
fn semaphore_count_stays_within_bounds() {
    let kernel = kernel(0);
    spawn(&kernel, "t", 10);
    kernel.start().unwrap();
    let sem = kernel.semaphore_new("bounded", 5, 2).unwrap();
    let mut rng = Lcg(42);

    for _ in 0..1000 {
        if rng.next(2) == 0 {
            match kernel.semaphore_release(sem) {
                Ok(()) | Err(KernelError::Overflow) => {}
                Err(other) => panic!("unexpected release error {other:?}"),
            }
        } else {
            match kernel.semaphore_acquire(sem, Timeout::NO_WAIT) {
                Ok(Poll::Ready(())) | Err(KernelError::Resource) => {}
                other => panic!("unexpected acquire result {other:?}"),
            }
        }
        let count = kernel.semaphore_count(sem).unwrap();
        assert!(count <= 5);
    }

    while kernel.semaphore_count(sem).unwrap() < 5 {
        kernel.semaphore_release(sem).unwrap();
    }
    assert_eq!(kernel.semaphore_release(sem), Err(KernelError::Overflow));
}

#[test]
fn wait_all_needs_every_bit_and_wait_any_the_first() {
    let kernel = kernel(0);
    let group = kernel.event_flags_new("g").unwrap();
    let all = spawn(&kernel, "all", 10);
    kernel.start().unwrap();
    assert_eq!(
        kernel.event_flags_wait(group, 0b111, FlagOptions::ALL, Timeout::FOREVER),
        Ok(Poll::Pending)
    );
    let any = spawn(&kernel, "any", 5);
    assert_eq!(
        kernel.event_flags_wait(group, 0b1000_0000, FlagOptions::ANY, Timeout::FOREVER),
        Ok(Poll::Pending)
    );

    for bit in [0b001, 0b100] {
        kernel.event_flags_set(group, bit).unwrap();
        assert_ne!(kernel.thread_state(all), Ok(ThreadState::Ready));
    }
    kernel.event_flags_set(group, 0b1000_0000).unwrap();
    assert_eq!(kernel.take_wait_result(any), Some(Ok(WaitValue::Flags(0b1000_0101))));

    kernel.event_flags_set(group, 0b010).unwrap();
    assert_eq!(kernel.take_wait_result(all), Some(Ok(WaitValue::Flags(0b111))));
}

#[test]
fn round_robin_turns_are_cyclic() {
    const N: usize = 4;
    let kernel = kernel(1);
    let threads: Vec<ThreadId> = (0..N).map(|_| spawn(&kernel, "peer", 12)).collect();
    kernel.start().unwrap();

    let mut turns = vec![kernel.current_thread().unwrap()];
    for _ in 0..40 {
        kernel.tick();
        turns.push(kernel.current_thread().unwrap());
    }

    for (i, window) in turns.windows(N).enumerate() {
        let mut seen = window.to_vec();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), N, "window at slice {i} starved a thread");
    }
    assert!(turns.iter().all(|t| threads.contains(t)));
    assert_eq!(&turns[..N], &threads[..]);
}

#[test]
fn pool_round_trip_never_exhausts() {
    let mut pool = MemoryPool::new(8, 24).unwrap();
    let (base, limit) = (pool.base(), pool.limit());

    for _ in 0..3 {
        for _ in 0..pool.block_count() {
            let block = pool.alloc().expect("pool exhausted by a round trip");
            assert!(block.address() >= base && block.address() < limit);
            pool.free(block).unwrap();
        }
    }
    assert_eq!(pool.stats().free_blocks, 8);
    assert_eq!(pool.stats().min_free_blocks, 7);
}

#[test]
fn queue_dequeues_by_priority_then_fifo() {
    let kernel = kernel(0);
    spawn(&kernel, "t", 10);
    kernel.start().unwrap();
    let queue = kernel.queue_new("q", 3, 1).unwrap();

    for (data, prio) in [(b"A", 5), (b"B", 1), (b"C", 5)] {
        assert_eq!(kernel.queue_put(queue, data, prio, Timeout::NO_WAIT), Ok(Poll::Ready(())));
    }
    let mut order = Vec::new();
    while let Ok(Poll::Ready(message)) = kernel.queue_get(queue, Timeout::NO_WAIT) {
        order.push(message.data()[0]);
    }
    assert_eq!(order, b"ACB");
}

#[test]
fn interrupt_release_lets_the_next_thread_race_the_waiter() {
    let kernel = kernel(0);
    let sem = kernel.semaphore_new("irq", 1, 0).unwrap();
    let waiter = spawn(&kernel, "waiter", 10);
    kernel.start().unwrap();
    assert_eq!(kernel.semaphore_acquire(sem, Timeout::FOREVER), Ok(Poll::Pending));
    let other = spawn(&kernel, "other", 20);

    kernel.interrupt_enter();
    kernel.semaphore_release(sem).unwrap();
    kernel.interrupt_exit();

    assert_eq!(kernel.thread_state(waiter), Ok(ThreadState::Ready));
    assert_eq!(kernel.current_thread(), Some(other));
    // The thread scheduled first may take the token ahead of the waiter.
    assert_eq!(kernel.semaphore_acquire(sem, Timeout::NO_WAIT), Ok(Poll::Ready(())));

    assert_eq!(kernel.delay(5), Ok(Poll::Pending));
    assert_eq!(kernel.thread_state(waiter), Ok(ThreadState::Blocked(WaitReason::Semaphore)));
    assert_eq!(kernel.take_wait_result(waiter), None);

    kernel.semaphore_release(sem).unwrap();
    assert_eq!(kernel.current_thread(), Some(waiter));
    assert_eq!(kernel.take_wait_result(waiter), Some(Ok(WaitValue::Unit)));
    assert_eq!(kernel.semaphore_count(sem), Ok(0));
}

#[test]
fn acquire_times_out_after_exactly_its_timeout() {
    let kernel = kernel(0);
    let sem = kernel.semaphore_new("never", 1, 0).unwrap();
    let waiter = spawn(&kernel, "waiter", 10);
    kernel.start().unwrap();
    assert_eq!(kernel.semaphore_acquire(sem, Timeout(100)), Ok(Poll::Pending));

    for _ in 0..99 {
        kernel.tick();
        assert_ne!(kernel.thread_state(waiter), Ok(ThreadState::Running));
    }
    kernel.tick();
    assert_eq!(kernel.current_thread(), Some(waiter));
    assert_eq!(kernel.take_wait_result(waiter), Some(Err(KernelError::Timeout)));
}

#[test]
fn critical_sections_restore_interrupts_at_the_outermost_exit() {
    let kernel = kernel(0);
    let outer = kernel.critical();
    {
        let _inner = kernel.critical();
        assert!(!kernel.port().interrupts_enabled());
    }
    assert!(!kernel.port().interrupts_enabled());
    drop(outer);
    assert!(kernel.port().interrupts_enabled());
}
