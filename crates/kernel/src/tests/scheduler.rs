use super::*;
use crate::port::SIM_FRAME_SIZE;
use crate::{KernelError, KernelStatus, MutexConfig, ThreadState, Timeout, WaitReason};

#[test]
fn highest_priority_thread_runs_and_preempts() {
    let kernel = kernel();
    let low = spawn(&kernel, "low", 5);
    assert_eq!(kernel.kernel_state(), KernelStatus::Ready);
    assert_eq!(kernel.current_thread(), None);

    kernel.start().unwrap();
    assert_eq!(kernel.kernel_state(), KernelStatus::Running);
    assert_eq!(kernel.current_thread(), Some(low));

    let high = spawn(&kernel, "high", 20);
    assert_eq!(kernel.current_thread(), Some(high));
    assert_eq!(kernel.thread_state(low), Ok(ThreadState::Ready));
    assert_eq!(kernel.port().last_switch(), Some((Some(low), high)));
}

#[test]
fn timer_thread_is_parked_until_needed() {
    let kernel = kernel();
    kernel.start().unwrap();
    let timer = timer_thread(&kernel);
    assert_eq!(kernel.thread_state(timer), Ok(ThreadState::Blocked(WaitReason::MessageGet)));
    assert_eq!(kernel.current_thread(), Some(idle_thread(&kernel)));
    assert_eq!(kernel.thread_count(), 2);
    assert_eq!(kernel.start(), Err(KernelError::InvalidState));
}

#[test]
fn round_robin_rotates_equal_priorities() {
    let kernel = kernel_with(KernelConfig::builder().round_robin(2).build());
    let a = spawn(&kernel, "a", 10);
    let b = spawn(&kernel, "b", 10);
    let c = spawn(&kernel, "c", 10);
    kernel.start().unwrap();

    let mut order = vec![kernel.current_thread().unwrap()];
    for _ in 0..10 {
        kernel.tick();
        let current = kernel.current_thread().unwrap();
        if order.last() != Some(&current) {
            order.push(current);
        }
    }
    assert_eq!(order, vec![a, b, c, a, b, c]);
}

#[test]
fn yield_hands_over_to_equal_priority_only() {
    let kernel = kernel();
    let a = spawn(&kernel, "a", 10);
    let b = spawn(&kernel, "b", 10);
    let low = spawn(&kernel, "low", 3);
    kernel.start().unwrap();

    kernel.thread_yield().unwrap();
    assert_eq!(kernel.current_thread(), Some(b));
    kernel.thread_yield().unwrap();
    assert_eq!(kernel.current_thread(), Some(a));

    kernel.thread_terminate(b).unwrap();
    kernel.thread_yield().unwrap();
    assert_eq!(kernel.current_thread(), Some(a));
    assert_eq!(kernel.thread_state(low), Ok(ThreadState::Ready));
}

#[test]
fn delay_expires_on_the_nth_tick() {
    let kernel = kernel();
    let a = spawn(&kernel, "a", 10);
    kernel.start().unwrap();

    assert_eq!(kernel.delay(0), Ok(Poll::Ready(())));
    assert_pending(kernel.delay(5));
    assert_eq!(kernel.thread_state(a), Ok(ThreadState::Blocked(WaitReason::Delay)));
    assert_eq!(kernel.current_thread(), Some(idle_thread(&kernel)));

    ticks(&kernel, 4);
    assert_eq!(kernel.thread_state(a), Ok(ThreadState::Blocked(WaitReason::Delay)));
    kernel.tick();
    assert_eq!(kernel.current_thread(), Some(a));
    assert_eq!(result_of(&kernel, a), Ok(WaitValue::Unit));
}

#[test]
fn delay_until_targets_an_absolute_tick() {
    let kernel = kernel();
    let a = spawn(&kernel, "a", 10);
    kernel.start().unwrap();
    ticks(&kernel, 2);

    assert_eq!(kernel.delay_until(2), Err(KernelError::Parameter));
    assert_eq!(kernel.delay_until(1), Err(KernelError::Parameter));
    assert_pending(kernel.delay_until(5));
    ticks(&kernel, 2);
    assert_ne!(kernel.current_thread(), Some(a));
    kernel.tick();
    assert_eq!(kernel.tick_count(), 5);
    assert_eq!(kernel.current_thread(), Some(a));
}

#[test]
fn scheduler_lock_defers_the_switch() {
    let kernel = kernel();
    let a = spawn(&kernel, "a", 10);
    kernel.start().unwrap();

    assert_eq!(kernel.lock(), Ok(0));
    assert_eq!(kernel.kernel_state(), KernelStatus::Locked);
    let high = spawn(&kernel, "high", 30);
    assert_eq!(kernel.current_thread(), Some(a));
    assert_eq!(kernel.delay(3), Err(KernelError::InvalidState));

    assert_eq!(kernel.unlock(), Ok(1));
    assert_eq!(kernel.current_thread(), Some(high));
    assert_eq!(kernel.unlock(), Err(KernelError::InvalidState));
}

#[test]
fn slice_expiring_under_lock_rotates_after_unlock() {
    let kernel = kernel_with(KernelConfig::builder().round_robin(2).build());
    let a = spawn(&kernel, "a", 10);
    let b = spawn(&kernel, "b", 10);
    kernel.start().unwrap();
    let mutex = kernel.mutex_new(MutexConfig::new("m")).unwrap();

    kernel.lock().unwrap();
    ticks(&kernel, 3);
    assert_eq!(kernel.current_thread(), Some(a));
    assert_eq!(kernel.thread_state(a), Ok(ThreadState::Running));
    assert_eq!(kernel.thread_state(b), Ok(ThreadState::Ready));
    assert_eq!(kernel.mutex_acquire(mutex, Timeout::NO_WAIT), Ok(Poll::Ready(())));
    kernel.mutex_release(mutex).unwrap();

    kernel.unlock().unwrap();
    assert_eq!(kernel.current_thread(), Some(a));
    kernel.tick();
    assert_eq!(kernel.current_thread(), Some(b));
    assert_eq!(kernel.thread_state(a), Ok(ThreadState::Ready));
}

#[test]
fn running_thread_cannot_end_itself_while_locked() {
    let kernel = kernel();
    let a = spawn(&kernel, "a", 10);
    let b = spawn(&kernel, "b", 5);
    kernel.start().unwrap();

    kernel.lock().unwrap();
    assert_eq!(kernel.thread_exit(), Err(KernelError::InvalidState));
    assert_eq!(kernel.thread_terminate(a), Err(KernelError::InvalidState));
    assert_eq!(kernel.thread_state(a), Ok(ThreadState::Running));
    // Other threads may still be terminated.
    assert_eq!(kernel.thread_terminate(b), Ok(()));

    kernel.unlock().unwrap();
    assert_eq!(kernel.thread_exit(), Ok(()));
    assert_eq!(kernel.thread_state(a), Ok(ThreadState::Terminated));
    assert_eq!(kernel.current_thread(), Some(idle_thread(&kernel)));
}

#[test]
fn detached_thread_is_reclaimed_after_switch_away() {
    let kernel = kernel_with(KernelConfig::builder().round_robin(0).stack_pool(2, 512).build());
    let a = spawn(&kernel, "a", 10);
    let _b = spawn(&kernel, "b", 10);
    kernel.start().unwrap();
    assert_eq!(kernel.thread_count(), 4);

    kernel.thread_exit().unwrap();
    assert_eq!(kernel.thread_state(a), Err(KernelError::InvalidHandle));
    assert_eq!(kernel.thread_count(), 3);

    // The stack block went back to the pool.
    let c = spawn(&kernel, "c", 5);
    assert_eq!(kernel.thread_state(c), Ok(ThreadState::Ready));
}

#[test]
fn join_waits_for_termination_and_reclaims() {
    let kernel = kernel();
    let parent = spawn(&kernel, "parent", 10);
    let child = kernel
        .thread_new(ThreadConfig::new("child", noop, 7).priority(Priority(5)).joinable(true))
        .unwrap();
    kernel.start().unwrap();

    assert_eq!(kernel.thread_join(parent), Err(KernelError::Deadlock));
    assert_pending(kernel.thread_join(child));
    assert_eq!(kernel.thread_state(parent), Ok(ThreadState::Blocked(WaitReason::Join)));
    assert_eq!(kernel.current_thread(), Some(child));

    kernel.thread_exit().unwrap();
    assert_eq!(kernel.current_thread(), Some(parent));
    assert_eq!(result_of(&kernel, parent), Ok(WaitValue::Unit));
    assert_eq!(kernel.thread_state(child), Err(KernelError::InvalidHandle));
}

#[test]
fn join_of_already_terminated_thread_completes_immediately() {
    let kernel = kernel();
    let parent = spawn(&kernel, "parent", 10);
    let child = kernel
        .thread_new(ThreadConfig::new("child", noop, 0).priority(Priority(5)).joinable(true))
        .unwrap();
    let detached = spawn(&kernel, "detached", 5);
    kernel.start().unwrap();

    kernel.thread_terminate(child).unwrap();
    assert_eq!(kernel.thread_state(child), Ok(ThreadState::Terminated));
    assert_eq!(kernel.thread_join(detached), Err(KernelError::Resource));
    assert_eq!(kernel.thread_join(child), Ok(Poll::Ready(())));
    assert_eq!(kernel.thread_state(child), Err(KernelError::InvalidHandle));
    assert_eq!(kernel.current_thread(), Some(parent));
}

#[test]
fn detach_reclaims_a_terminated_joinable_thread() {
    let kernel = kernel();
    let _main = spawn(&kernel, "main", 10);
    let child = kernel
        .thread_new(ThreadConfig::new("child", noop, 0).priority(Priority(5)).joinable(true))
        .unwrap();
    kernel.start().unwrap();

    kernel.thread_terminate(child).unwrap();
    kernel.thread_detach(child).unwrap();
    assert_eq!(kernel.thread_state(child), Err(KernelError::InvalidHandle));
}

#[test]
fn priority_changes_reorder_the_ready_queue() {
    let kernel = kernel();
    let a = spawn(&kernel, "a", 10);
    let b = spawn(&kernel, "b", 5);
    kernel.start().unwrap();

    kernel.thread_set_priority(b, Priority(20)).unwrap();
    assert_eq!(kernel.current_thread(), Some(b));

    kernel.thread_set_priority(b, Priority(1)).unwrap();
    assert_eq!(kernel.current_thread(), Some(a));
    assert_eq!(kernel.thread_priority(b), Ok(Priority(1)));
    assert_eq!(kernel.thread_base_priority(b), Ok(Priority(1)));

    assert_eq!(kernel.thread_set_priority(b, Priority(0)), Err(KernelError::Parameter));
    let idle = idle_thread(&kernel);
    assert_eq!(kernel.thread_set_priority(idle, Priority(3)), Err(KernelError::Parameter));
}

#[test]
fn thread_creation_validates_parameters() {
    let kernel = kernel_with(KernelConfig::builder().stack_pool(1, 256).build());
    let config = |prio| ThreadConfig::new("t", noop, 0).priority(Priority(prio));

    assert_eq!(kernel.thread_new(config(0)).err(), Some(KernelError::Parameter));
    assert_eq!(kernel.thread_new(config(64)).err(), Some(KernelError::Parameter));
    assert_eq!(
        kernel.thread_new(config(5).stack_size(1024)).err(),
        Some(KernelError::Parameter)
    );
    assert_eq!(
        kernel.thread_new(config(5).with_stack(vec![0; 16])).err(),
        Some(KernelError::Parameter)
    );

    kernel.thread_new(config(5)).unwrap();
    assert_eq!(kernel.thread_new(config(5)).err(), Some(KernelError::NoMemory));
    let owned = kernel.thread_new(config(5).with_stack(vec![0; 256])).unwrap();
    assert_eq!(kernel.thread_name(owned), Ok("t"));
}

#[test]
fn stack_watermark_reports_untouched_bytes() {
    let kernel = kernel_with(KernelConfig::builder().stack_pool(2, 512).build());
    let a = spawn(&kernel, "a", 10);
    assert_eq!(kernel.thread_stack_space(a), Ok(512 - 4 - SIM_FRAME_SIZE));

    kernel
        .with_thread_stack(a, |stack| {
            let len = stack.len();
            stack[len - 200..].fill(0);
        })
        .unwrap();
    assert_eq!(kernel.thread_stack_space(a), Ok(512 - 200 - 4));

    let quiet = kernel_with(KernelConfig::builder().stack_watermark(false).build());
    let b = spawn(&quiet, "b", 10);
    assert_eq!(quiet.thread_stack_space(b), Ok(0));
}

#[test]
fn thread_only_services_reject_missing_context() {
    let kernel = kernel();
    assert_eq!(kernel.delay(1), Err(KernelError::InvalidState));
    assert_eq!(kernel.thread_yield(), Err(KernelError::InvalidState));
    assert_eq!(kernel.run_idle(), Err(KernelError::InvalidState));

    kernel.start().unwrap();
    assert_eq!(kernel.thread_exit(), Err(KernelError::InvalidState));
    assert_eq!(kernel.run_idle(), Ok(()));
    assert_eq!(kernel.port().idle_calls(), 1);
}
