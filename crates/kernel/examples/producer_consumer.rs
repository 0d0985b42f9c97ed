//! Producer-consumer over a message queue, driven tick by tick on the host.
//!
//! The host loop plays the part of the CPU: whatever thread the kernel has
//! made current gets to "run" its next step, and the idle thread advances
//! time. Blocked calls report their outcome once the thread runs again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::Poll;

use ember_kernel::{Kernel, KernelConfig, KernelResult, Priority, SimPort, ThreadConfig, TimerKind, Timeout};

const ITEMS: u32 = 10;

fn noop(_: usize) {}

static BEATS: AtomicUsize = AtomicUsize::new(0);

fn heartbeat(_: usize) {
    let beat = BEATS.fetch_add(1, Ordering::Relaxed) + 1;
    println!("  [timer] heartbeat #{beat}");
}

fn main() -> KernelResult<()> {
    println!("=== Ember Producer-Consumer Example ===\n");

    let config = KernelConfig::builder().name("demo").round_robin(0).build();
    let kernel = Kernel::with_config(config).build(SimPort::new())?;

    let queue = kernel.queue_new("items", 3, 4)?;
    let producer = kernel.thread_new(ThreadConfig::new("producer", noop, 0).priority(Priority(12)))?;
    let consumer = kernel.thread_new(ThreadConfig::new("consumer", noop, 0).priority(Priority(10)))?;
    let timer = kernel.timer_new("heartbeat", TimerKind::Periodic, heartbeat, 0)?;
    kernel.timer_start(timer, 5)?;
    kernel.start()?;

    let mut produced = 0;
    let mut consumed = 0;
    let mut put_blocked = false;
    while consumed < ITEMS {
        let Some(current) = kernel.current_thread() else {
            break;
        };

        if current == producer {
            let resumed = kernel.take_wait_result(producer);
            if produced == ITEMS {
                println!("Producer: finished ({produced} items)");
                kernel.thread_exit()?;
                continue;
            }
            let sent = if put_blocked {
                put_blocked = false;
                matches!(resumed, Some(Ok(_)))
            } else {
                let item = produced + 1;
                match kernel.queue_put(queue, &item.to_le_bytes(), 0, Timeout::FOREVER)? {
                    Poll::Ready(()) => true,
                    Poll::Pending => {
                        println!("Producer: queue full, waiting");
                        put_blocked = true;
                        false
                    }
                }
            };
            if sent {
                produced += 1;
                println!("Producer: sent item #{produced}");
                if produced % 3 == 0 {
                    let _ = kernel.delay(2)?;
                }
            }
        } else if current == consumer {
            let message = match kernel.take_wait_result(consumer) {
                Some(result) => result?.into_message(),
                None => match kernel.queue_get(queue, Timeout::FOREVER)? {
                    Poll::Ready(message) => Some(message),
                    Poll::Pending => None,
                },
            };
            if let Some(message) = message {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(message.data());
                consumed += 1;
                println!("Consumer: received item #{}", u32::from_le_bytes(raw));
            }
        } else if kernel.thread_name(current)? == "timer" {
            kernel.timer_service()?;
        } else {
            kernel.run_idle()?;
            kernel.tick();
        }
    }

    kernel.timer_stop(timer)?;
    println!(
        "\nDone after {} ticks and {} context switches",
        kernel.tick_count(),
        kernel.port().switch_count()
    );
    Ok(())
}
