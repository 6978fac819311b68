//! Fiber execution contexts.
//!
//! A fiber is a stackful coroutine (via `corosensei`) running one user function
//! to completion. The scheduler resumes it; the fiber suspends itself through
//! its [`Context`] whenever it has to wait.

use crate::context::Context;
use crate::error::{Result, SimError};
use crate::group::GroupCore;
use crate::simulation::FiberFn;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Everything a fiber needs to find its scheduler state. Passed on first resume,
/// once the group has a stable address.
pub(crate) struct FiberStart {
    pub core: *mut GroupCore,
    pub index: usize,
}

pub(crate) enum FiberInput {
    Start(FiberStart),
    Resume,
}

pub(crate) type FiberYielder = Yielder<FiberInput, ()>;

pub(crate) enum FiberState {
    /// Parked itself; will be resumed by a later pass.
    Suspended,
    /// The user function returned.
    Complete,
    Panic(Box<dyn Any + Send>),
}

pub(crate) struct Fiber {
    coroutine: Coroutine<FiberInput, (), (), DefaultStack>,
    started: bool,
    finished: bool,
}

// SAFETY: a fiber is only resumed by the thread holding its group's lock.
unsafe impl Send for Fiber {}

impl Fiber {
    /// Allocates the stack and wraps `body`. Nothing runs until the first resume.
    pub fn new(stack_size: usize, body: FiberFn) -> Result<Self> {
        let stack = DefaultStack::new(stack_size).map_err(|_| SimError::Alloc)?;
        let coroutine = Coroutine::with_stack(stack, move |yielder: &FiberYielder, input| {
            if let FiberInput::Start(start) = input {
                let mut ctx = Context::new(start, yielder);
                body(&mut ctx);
            }
        });
        Ok(Self {
            coroutine,
            started: false,
            finished: false,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Switches into the fiber until it suspends, returns or panics.
    pub fn resume(&mut self, core: *mut GroupCore, index: usize) -> FiberState {
        if self.finished {
            return FiberState::Complete;
        }
        let input = if self.started {
            FiberInput::Resume
        } else {
            self.started = true;
            FiberInput::Start(FiberStart { core, index })
        };

        let coroutine = &mut self.coroutine;
        match catch_unwind(AssertUnwindSafe(|| coroutine.resume(input))) {
            Ok(CoroutineResult::Yield(())) => FiberState::Suspended,
            Ok(CoroutineResult::Return(())) => {
                self.finished = true;
                FiberState::Complete
            }
            Err(payload) => {
                self.finished = true;
                FiberState::Panic(payload)
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
