//! A kernel living in a `static`, shared with an interrupt running on
//! another host thread.

use std::task::Poll;
use std::thread;

use ember_kernel::{Kernel, KernelConfig, Priority, SimPort, ThreadConfig, ThreadState, Timeout, WaitValue};
use once_cell::sync::Lazy;

fn noop(_: usize) {}

static KERNEL: Lazy<Kernel<SimPort>> = Lazy::new(|| {
    let config = KernelConfig::builder()
        .name("static")
        .round_robin(0)
        .build();
    Kernel::with_config(config)
        .build(SimPort::new())
        .expect("static kernel config is valid")
});

#[test]
fn static_kernel_serves_an_interrupt_from_another_thread() {
    let kernel: &'static Kernel<SimPort> = &KERNEL;
    let sem = kernel.semaphore_new("irq", 1, 0).unwrap();
    let waiter = kernel
        .thread_new(ThreadConfig::new("waiter", noop, 0).priority(Priority(10)))
        .unwrap();
    kernel.start().unwrap();
    assert_eq!(kernel.semaphore_acquire(sem, Timeout::FOREVER), Ok(Poll::Pending));

    thread::spawn(move || {
        kernel.interrupt_enter();
        kernel.semaphore_release(sem).unwrap();
        kernel.tick();
        kernel.interrupt_exit();
    })
    .join()
    .unwrap();

    assert_eq!(kernel.tick_count(), 1);
    assert_eq!(kernel.current_thread(), Some(waiter));
    assert_eq!(kernel.thread_state(waiter), Ok(ThreadState::Running));
    assert_eq!(kernel.take_wait_result(waiter), Some(Ok(WaitValue::Unit)));
    assert_eq!(kernel.config().name, "static");
}
