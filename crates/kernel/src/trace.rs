#[cfg(feature = "trace")]
pub use ember_trace::{records, TraceError, TraceHook};

#[cfg(feature = "trace")]
pub type TraceResult = Result<(), TraceError>;

#[cfg(not(feature = "trace"))]
use crate::sync::Arc;

#[cfg(not(feature = "trace"))]
pub type TraceError = core::convert::Infallible;

#[cfg(not(feature = "trace"))]
pub type TraceResult = Result<(), TraceError>;

#[cfg(not(feature = "trace"))]
pub type TraceHook = Arc<dyn Fn(u8, &[u8], bool) -> TraceResult + Send + Sync>;

// Record ids still name every emission point when the trace crate is absent.
#[cfg(not(feature = "trace"))]
pub mod records {
    pub mod kernel {
        pub const START: u8 = 1;
        pub const TICK: u8 = 2;
        pub const LOCK: u8 = 3;
        pub const UNLOCK: u8 = 4;
        pub const FATAL: u8 = 5;
        pub const IDLE: u8 = 6;
    }
    pub mod thread {
        pub const CREATE: u8 = 16;
        pub const SWITCH: u8 = 17;
        pub const READY: u8 = 18;
        pub const BLOCK: u8 = 19;
        pub const TIMEOUT: u8 = 20;
        pub const EXIT: u8 = 21;
        pub const TERMINATE: u8 = 22;
        pub const JOIN: u8 = 23;
        pub const PRIORITY: u8 = 24;
        pub const RECLAIM: u8 = 25;
    }
    pub mod mutex {
        pub const CREATE: u8 = 32;
        pub const ACQUIRE: u8 = 33;
        pub const RELEASE: u8 = 34;
        pub const INHERIT: u8 = 35;
        pub const DELETE: u8 = 36;
    }
    pub mod sem {
        pub const CREATE: u8 = 48;
        pub const ACQUIRE: u8 = 49;
        pub const RELEASE: u8 = 50;
        pub const DELETE: u8 = 51;
    }
    pub mod flags {
        pub const CREATE: u8 = 64;
        pub const SET: u8 = 65;
        pub const CLEAR: u8 = 66;
        pub const WAKE: u8 = 67;
        pub const DELETE: u8 = 68;
        pub const THREAD_SET: u8 = 69;
    }
    pub mod pool {
        pub const CREATE: u8 = 80;
        pub const ALLOC: u8 = 81;
        pub const FREE: u8 = 82;
        pub const DELETE: u8 = 83;
    }
    pub mod queue {
        pub const CREATE: u8 = 96;
        pub const PUT: u8 = 97;
        pub const GET: u8 = 98;
        pub const RESET: u8 = 99;
        pub const DELETE: u8 = 100;
    }
    pub mod timer {
        pub const CREATE: u8 = 112;
        pub const START: u8 = 113;
        pub const STOP: u8 = 114;
        pub const EXPIRE: u8 = 115;
        pub const CALLBACK: u8 = 116;
        pub const DELETE: u8 = 117;
    }
    pub mod isr {
        pub const ENTER: u8 = 128;
        pub const EXIT: u8 = 129;
        pub const POST: u8 = 130;
    }
}
