//! Fiber-side API.
//!
//! Every fiber function receives a [`Context`]. It exposes the scheduling
//! primitives (delay, wait/wake, input peeks, output production) and is the
//! only way a fiber can suspend itself.

use crate::GroupId;
use crate::config::{FiberRunConfig, RunFlags};
use crate::error::{Result, SimError};
use crate::fiber::{FiberStart, FiberYielder};
use crate::group::{FiberStatus, GroupCore, seek_match};
use crate::out_queue::OutputData;
use crate::pattern;
use crate::state_queue::Queue;
use crate::time::Timepoint;
use std::sync::atomic::{AtomicI64, Ordering};

/// How long a peek may block.
#[derive(Clone, Copy)]
enum PeekWait {
    NonBlocking,
    Forever,
    Until(Timepoint),
}

/// Handle passed to a fiber function.
///
/// Payload slices returned by the peek functions borrow the context, so a fiber
/// cannot keep one across a call that may drop or evict the input head.
pub struct Context<'a> {
    core: *mut GroupCore,
    index: usize,
    yielder: &'a FiberYielder,
}

impl<'a> Context<'a> {
    pub(crate) fn new(start: FiberStart, yielder: &'a FiberYielder) -> Self {
        Context {
            core: start.core,
            index: start.index,
            yielder,
        }
    }

    fn core(&self) -> &GroupCore {
        // SAFETY: the scheduler holds no reference to the core while this fiber runs.
        unsafe { &*self.core }
    }

    fn core_mut(&mut self) -> &mut GroupCore {
        // SAFETY: as above; the borrow never spans a context switch.
        unsafe { &mut *self.core }
    }

    fn switch(&mut self) {
        let idx = self.index;
        self.core_mut().before_switch(idx);
        self.yielder.suspend(());
    }

    /// Parks in `queue` and switches out. Returns true if the fiber's timer woke it.
    fn park(&mut self, queue: Queue, status: FiberStatus, deadline: Option<Timepoint>) -> bool {
        let idx = self.index;
        self.core_mut().park(idx, queue, status, deadline);
        self.switch();
        self.core_mut().unpark(idx)
    }

    /// Suspends until group time catches up with this fiber's time.
    fn park_until_own_time(&mut self) {
        let at = self.timestamp();
        let by_timer = self.park(Queue::Blocked, FiberStatus::Running, Some(at));
        debug_assert!(by_timer);
    }

    /// Counts one scheduler call and suspends if the fiber ran too far ahead
    /// or made too many calls without switching.
    fn progress(&mut self) {
        let idx = self.index;
        let (ahead, exhausted) = {
            let core = self.core_mut();
            let now = core.now;
            let slot = &mut core.slots[idx];
            slot.func_count += 1;
            (
                slot.time >= now.saturating_add(slot.run_cfg.look_ahead_offset_us),
                slot.func_count > slot.run_cfg.max_func_count,
            )
        };
        if ahead {
            self.park_until_own_time();
        } else if exhausted {
            self.switch();
        }
    }

    // ==== time and signals ====

    /// Id of the group this fiber belongs to.
    pub fn group(&self) -> GroupId {
        self.core().id
    }

    /// This fiber's logical time in microseconds.
    pub fn timestamp(&self) -> Timepoint {
        self.core().slots[self.index].time
    }

    /// Scheduler calls since the last switch.
    pub fn func_count(&self) -> u32 {
        self.core().slots[self.index].func_count
    }

    /// Suspends until the scheduler's next pass over the run queue.
    pub fn yield_now(&mut self) {
        self.switch();
    }

    /// Advances this fiber's clock by `us`. Only switches out if the fiber gets
    /// too far ahead of its group or exhausts its call budget.
    pub fn delay(&mut self, us: u64) {
        let idx = self.index;
        let slot = &mut self.core_mut().slots[idx];
        slot.time = slot.time.saturating_add(us);
        self.progress();
    }

    /// Waits for `wake(signal)`. A `timeout_us` of 0 waits forever.
    /// Returns false if the timeout expired first.
    pub fn wait(&mut self, signal: u32, timeout_us: u64) -> bool {
        let since = self.timestamp();
        let deadline = (timeout_us != 0).then(|| since.saturating_add(timeout_us));
        !self.park(Queue::Blocked, FiberStatus::Waiting { signal, since }, deadline)
    }

    /// Wakes up to `count` fibers waiting on `signal`.
    ///
    /// Runs immediately when this fiber is level with group time. A fiber ahead
    /// of its group defers the wake until group time catches up.
    pub fn wake(&mut self, signal: u32, count: u32) {
        loop {
            let time = self.timestamp();
            let core = self.core_mut();
            if time == core.now {
                core.run_wake(signal, count);
                break;
            }
            if time > core.now && core.defer_wake(time, signal, count) {
                break;
            }
            // behind group time, or no room to defer
            self.park_until_own_time();
        }
        self.progress();
    }

    // ==== input ====

    fn head(&self) -> &[u8] {
        match self.core().slots[self.index].queue.head() {
            Some(handle) => handle.payload(),
            None => &[],
        }
    }

    fn has_match(&mut self, pattern: Option<&[u8]>, mask: Option<&[u8]>) -> bool {
        let idx = self.index;
        seek_match(&mut self.core_mut().slots[idx].queue, pattern, mask)
    }

    fn head_matches(&self, pattern: Option<&[u8]>, mask: Option<&[u8]>) -> bool {
        match (self.core().slots[self.index].queue.head(), pattern) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(head), Some(p)) => pattern::matches(head.payload(), p, mask),
        }
    }

    fn peek(&mut self, pattern: Option<&[u8]>, mask: Option<&[u8]>, wait: PeekWait) -> bool {
        loop {
            if self.has_match(pattern, mask) {
                self.progress();
                // the head may have been evicted while switched out
                if self.head_matches(pattern, mask) {
                    return true;
                }
                continue;
            }
            let deadline = match wait {
                PeekWait::Forever => None,
                PeekWait::Until(at) if at > self.timestamp() => Some(at),
                // non-blocking, or the timeout already passed
                _ => {
                    self.progress();
                    return false;
                }
            };
            let status = FiberStatus::BlockedOnRead {
                pattern: pattern.map(Box::from),
                mask: mask.map(Box::from),
            };
            if self.park(Queue::OnQueue, status, deadline) {
                return self.has_match(pattern, mask);
            }
        }
    }

    fn timed_wait(&self, timeout_us: u64) -> PeekWait {
        match timeout_us {
            0 => PeekWait::NonBlocking,
            us => PeekWait::Until(self.timestamp().saturating_add(us)),
        }
    }

    /// Head of this fiber's input queue, if any. Never switches out.
    pub fn try_peek_input_head(&mut self) -> Option<&[u8]> {
        if self.core().slots[self.index].queue.is_empty() {
            return None;
        }
        Some(self.head())
    }

    /// Head of this fiber's input queue, blocking until there is one.
    pub fn peek_input_head(&mut self) -> &[u8] {
        self.peek(None, None, PeekWait::Forever);
        self.head()
    }

    /// Like [`peek_input_head`](Self::peek_input_head) but gives up after
    /// `timeout_us`. A timeout of 0 never blocks.
    pub fn timed_peek_input_head(&mut self, timeout_us: u64) -> Option<&[u8]> {
        let wait = self.timed_wait(timeout_us);
        if self.peek(None, None, wait) {
            Some(self.head())
        } else {
            None
        }
    }

    /// Drops input until the head starts with `pattern`, blocking until one arrives.
    pub fn peek_input_head_match(&mut self, pattern: &[u8]) -> &[u8] {
        self.peek(Some(pattern), None, PeekWait::Forever);
        self.head()
    }

    pub fn timed_peek_input_head_match(&mut self, pattern: &[u8], timeout_us: u64) -> Option<&[u8]> {
        let wait = self.timed_wait(timeout_us);
        if self.peek(Some(pattern), None, wait) {
            Some(self.head())
        } else {
            None
        }
    }

    /// Drops input until the head matches `pattern` under `mask`, blocking until one arrives.
    /// See [`pattern::matches`](crate::pattern::matches) for the masking rules.
    pub fn peek_input_head_match_mask(&mut self, pattern: &[u8], mask: &[u8]) -> &[u8] {
        self.peek(Some(pattern), Some(mask), PeekWait::Forever);
        self.head()
    }

    pub fn timed_peek_input_head_match_mask(
        &mut self,
        pattern: &[u8],
        mask: &[u8],
        timeout_us: u64,
    ) -> Option<&[u8]> {
        let wait = self.timed_wait(timeout_us);
        if self.peek(Some(pattern), Some(mask), wait) {
            Some(self.head())
        } else {
            None
        }
    }

    /// Releases the head of this fiber's input queue.
    pub fn drop_input_head(&mut self) {
        let idx = self.index;
        let slot = &mut self.core_mut().slots[idx];
        debug_assert!(!slot.run_cfg.is_produce_only());
        slot.queue.drop_head();
        self.progress();
    }

    /// Releases everything queued for this fiber.
    pub fn drop_all_input(&mut self) {
        let idx = self.index;
        self.core_mut().slots[idx].queue.clear();
        self.progress();
    }

    // ==== output ====

    fn produce(&mut self, data: OutputData) {
        let idx = self.index;
        self.core_mut().produce(idx, data);
        self.progress();
    }

    pub fn produce_static_output(&mut self, bytes: &'static [u8]) {
        self.produce(OutputData::StaticBytes(bytes));
    }

    /// The bytes are handed to [`Simulation::dealloc`](crate::Simulation::dealloc) once read.
    pub fn produce_dynamic_output(&mut self, bytes: impl Into<Box<[u8]>>) {
        self.produce(OutputData::DynamicBytes(bytes.into()));
    }

    pub fn produce_static_string(&mut self, s: &'static str) {
        self.produce(OutputData::StaticString(s));
    }

    pub fn produce_dynamic_string(&mut self, s: impl Into<String>) {
        self.produce(OutputData::DynamicString(s.into()));
    }

    pub fn produce_error(&mut self, code: SimError, message: &'static str) {
        self.produce(OutputData::Error { code, message });
    }

    // ==== run policy ====

    pub fn run_config(&self) -> FiberRunConfig {
        self.core().slots[self.index].run_cfg
    }

    /// Replaces this fiber's run policy. Fails with `Invalid` for a zero call
    /// budget or an attempt to clear the produce-only flag.
    pub fn set_run_config(&mut self, cfg: FiberRunConfig) -> Result<()> {
        let idx = self.index;
        self.core_mut().set_run_config(idx, cfg)
    }

    /// Declares that this fiber never reads input. Queued input is released.
    pub fn set_produce_only(&mut self) -> Result<()> {
        let mut cfg = self.run_config();
        cfg.flags.insert(RunFlags::PRODUCE_ONLY);
        self.set_run_config(cfg)
    }

    /// Removes look-ahead: the fiber switches out whenever it gets ahead of group time.
    pub fn set_real_time(&mut self) -> Result<()> {
        let cfg = FiberRunConfig {
            look_ahead_offset_us: 0,
            ..self.run_config()
        };
        self.set_run_config(cfg)
    }
}

/// Counting semaphore for fibers of one group, built on wait/wake.
///
/// Share it between fibers with an `Arc`. Fibers of a group never run
/// concurrently, so the count only needs atomic access to be `Sync`.
#[derive(Debug)]
pub struct Semaphore {
    count: AtomicI64,
    signal: u32,
}

impl Semaphore {
    pub fn new(count: i64, signal: u32) -> Self {
        Self {
            count: AtomicI64::new(count),
            signal,
        }
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns one unit, waking a waiter if the count shows one may be blocked.
    pub fn release(&self, ctx: &mut Context<'_>) {
        if self.count() < 1 {
            ctx.wake(self.signal, 1);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes one unit, waiting up to `timeout_us` (0 waits forever).
    /// Returns false on timeout.
    pub fn acquire(&self, ctx: &mut Context<'_>, timeout_us: u64) -> bool {
        if self.count.fetch_sub(1, Ordering::Relaxed) > 0 {
            return true;
        }
        if ctx.wait(self.signal, timeout_us) {
            true
        } else {
            self.count.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}
