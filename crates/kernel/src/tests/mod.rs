mod scheduler;

use core::task::Poll;

use crate::{Kernel, KernelConfig, KernelResult, Priority, SimPort, ThreadConfig, ThreadId, WaitValue};

fn noop(_: usize) {}

fn kernel() -> Kernel<SimPort> {
    kernel_with(KernelConfig::builder().round_robin(0).build())
}

fn kernel_with(config: KernelConfig) -> Kernel<SimPort> {
    Kernel::with_config(config).build(SimPort::new()).unwrap()
}

fn spawn(kernel: &Kernel<SimPort>, name: &'static str, prio: u8) -> ThreadId {
    kernel
        .thread_new(ThreadConfig::new(name, noop, 0).priority(Priority(prio)))
        .unwrap()
}

fn ticks(kernel: &Kernel<SimPort>, n: u32) {
    for _ in 0..n {
        kernel.tick();
    }
}

fn idle_thread(kernel: &Kernel<SimPort>) -> ThreadId {
    kernel
        .threads()
        .into_iter()
        .find(|t| kernel.thread_name(*t) == Ok("idle"))
        .unwrap()
}

fn timer_thread(kernel: &Kernel<SimPort>) -> ThreadId {
    kernel
        .threads()
        .into_iter()
        .find(|t| kernel.thread_name(*t) == Ok("timer"))
        .unwrap()
}

fn assert_pending<T: core::fmt::Debug>(result: KernelResult<Poll<T>>) {
    assert!(matches!(result, Ok(Poll::Pending)), "expected to block, got {result:?}");
}

fn ready<T: core::fmt::Debug>(result: KernelResult<Poll<T>>) -> T {
    match result {
        Ok(Poll::Ready(value)) => value,
        other => panic!("expected immediate completion, got {other:?}"),
    }
}

fn result_of(kernel: &Kernel<SimPort>, thread: ThreadId) -> KernelResult<WaitValue> {
    kernel.take_wait_result(thread).expect("no wait result delivered")
}
