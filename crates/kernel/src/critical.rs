//! Nestable critical sections.
//!
//! Entering masks interrupts through the port every time, but only the
//! outermost entry remembers whether they were enabled; only the matching
//! outermost exit restores that state. Sections the kernel opens around its
//! own state are counted apart from the application's, so a caller nested to
//! the limit can still make service calls.

use crate::config::MAX_CRITICAL_NESTING;
use crate::error::FatalError;
use crate::kernel::Kernel;
use crate::port::Port;

#[derive(Debug, Default)]
pub struct CriticalSection {
    depth: u8,
    kernel_depth: u8,
    saved: bool,
}

impl CriticalSection {
    pub const fn new() -> Self {
        Self {
            depth: 0,
            kernel_depth: 0,
            saved: false,
        }
    }

    fn mask<P: Port + ?Sized>(&mut self, port: &P) {
        let was_enabled = port.disable_interrupts();
        if self.depth == 0 && self.kernel_depth == 0 {
            self.saved = was_enabled;
        }
    }

    fn unmask<P: Port + ?Sized>(&self, port: &P) {
        if self.depth == 0 && self.kernel_depth == 0 {
            port.restore_interrupts(self.saved);
        }
    }

    pub fn enter<P: Port + ?Sized>(&mut self, port: &P) -> Result<(), FatalError> {
        self.mask(port);
        if self.depth == MAX_CRITICAL_NESTING {
            return Err(FatalError::CriticalNesting);
        }
        self.depth += 1;
        Ok(())
    }

    pub fn exit<P: Port + ?Sized>(&mut self, port: &P) -> Result<(), FatalError> {
        if self.depth == 0 {
            return Err(FatalError::Invariant("critical section exit without enter"));
        }
        self.depth -= 1;
        self.unmask(port);
        Ok(())
    }

    pub(crate) fn enter_kernel<P: Port + ?Sized>(&mut self, port: &P) -> Result<(), FatalError> {
        self.mask(port);
        self.kernel_depth = self
            .kernel_depth
            .checked_add(1)
            .ok_or(FatalError::CriticalNesting)?;
        Ok(())
    }

    pub(crate) fn exit_kernel<P: Port + ?Sized>(&mut self, port: &P) -> Result<(), FatalError> {
        if self.kernel_depth == 0 {
            return Err(FatalError::Invariant("kernel critical section exit without enter"));
        }
        self.kernel_depth -= 1;
        self.unmask(port);
        Ok(())
    }

    /// True while the application holds a critical section.
    pub fn is_active(&self) -> bool {
        self.depth > 0
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }
}

/// Leaves the critical section on drop.
#[must_use = "the critical section ends when the guard is dropped"]
pub struct CriticalGuard<'k, P: Port> {
    kernel: &'k Kernel<P>,
    internal: bool,
}

impl<'k, P: Port> CriticalGuard<'k, P> {
    pub(crate) fn new(kernel: &'k Kernel<P>) -> Self {
        kernel.critical_enter();
        Self {
            kernel,
            internal: false,
        }
    }

    /// Section held by the kernel itself around its state.
    pub(crate) fn internal(kernel: &'k Kernel<P>) -> Self {
        kernel.kernel_critical_enter();
        Self {
            kernel,
            internal: true,
        }
    }
}

impl<P: Port> Drop for CriticalGuard<'_, P> {
    fn drop(&mut self) {
        if self.internal {
            self.kernel.kernel_critical_exit();
        } else {
            self.kernel.critical_exit();
        }
    }
}
