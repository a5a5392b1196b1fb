//! Ambient per-thread execution modes: gradient tracking and ahead-of-time
//! trace capture.
//!
//! Both modes are plain thread-local flags. They are flipped through RAII
//! guards so the previous value is restored on every exit path, including
//! unwinding:
//!
//! ```rust
//! use rmsgrad::autograd;
//!
//! assert!(autograd::is_grad_enabled());
//! {
//!     let _guard = autograd::no_grad();
//!     assert!(!autograd::is_grad_enabled());
//! }
//! assert!(autograd::is_grad_enabled());
//! ```

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = Cell::new(true);
    static TRACING: Cell<bool> = Cell::new(false);
}

/// Whether gradient tracking is currently enabled on this thread.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|flag| flag.get())
}

/// Whether this thread is currently capturing a traced program.
///
/// While tracing, heterogeneous batched dispatch is unavailable; update
/// engines that need it refuse to run instead of silently falling back.
pub fn is_tracing() -> bool {
    TRACING.with(|flag| flag.get())
}

/// Restores the previous gradient-tracking flag when dropped.
#[must_use = "the mode reverts as soon as the guard is dropped"]
#[derive(Debug)]
pub struct GradGuard {
    prev: bool,
    marker: PhantomData<*const ()>,
}

impl Drop for GradGuard {
    fn drop(&mut self) {
        GRAD_ENABLED.with(|flag| flag.set(self.prev));
    }
}

fn set_grad_enabled(enabled: bool) -> GradGuard {
    let prev = GRAD_ENABLED.with(|flag| flag.replace(enabled));
    GradGuard {
        prev,
        marker: PhantomData,
    }
}

/// Enables gradient tracking until the returned guard is dropped.
pub fn enable_grad() -> GradGuard {
    set_grad_enabled(true)
}

/// Disables gradient tracking until the returned guard is dropped.
pub fn no_grad() -> GradGuard {
    set_grad_enabled(false)
}

/// Restores the previous trace flag when dropped.
#[must_use = "the mode reverts as soon as the guard is dropped"]
#[derive(Debug)]
pub struct TraceGuard {
    prev: bool,
    marker: PhantomData<*const ()>,
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        TRACING.with(|flag| flag.set(self.prev));
    }
}

/// Marks this thread as capturing a traced program until the returned guard
/// is dropped.
pub fn trace() -> TraceGuard {
    let prev = TRACING.with(|flag| flag.replace(true));
    TraceGuard {
        prev,
        marker: PhantomData,
    }
}
