//! Group scheduler.
//!
//! A group is a set of fibers sharing one input channel and one logical clock.
//! Its main loop runs as a task on the simulator's task queue; at most one pass
//! per group runs at a time, guarded by a try-lock around [`GroupCore`]. While a
//! fiber runs, it reaches the same core through a raw pointer held by its
//! [`Context`](crate::Context), so the pass never keeps a reference to the core
//! alive across a resume.

use crate::GroupId;
use crate::buffer::BufferHandle;
use crate::config::{FiberRunConfig, SimulatorConfig};
use crate::deadlines::Deadlines;
use crate::error::{Result, SimError};
use crate::fiber::{Fiber, FiberState, panic_message};
use crate::in_queue::{InputChannel, Signal};
use crate::local_queue::LocalQueue;
use crate::out_queue::{OutputData, OutputRecord};
use crate::pattern;
use crate::simulation::{FiberConfig, SetupFn, TeardownFn};
use crate::simulator::Shared;
use crate::state_queue::{Queue, StateQueues};
use crate::sync::Exclusive;
use crate::task_queue::TaskId;
use crate::time::{self, Timepoint};
use std::cell::UnsafeCell;
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

/// What a parked fiber is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FiberStatus {
    Running,
    Waiting {
        signal: u32,
        since: Timepoint,
    },
    BlockedOnRead {
        pattern: Option<Box<[u8]>>,
        mask: Option<Box<[u8]>>,
    },
    /// Resumed because its own timer fired.
    TimerRescheduled,
}

pub(crate) struct FiberSlot {
    pub time: Timepoint,
    pub func_count: u32,
    pub run_cfg: FiberRunConfig,
    pub status: FiberStatus,
    /// Armed timer, if any. Mirrors the entry in `GroupCore::timed`.
    pub deadline: Option<Timepoint>,
    pub queue: LocalQueue,
    setup: Option<SetupFn>,
    teardown: Option<TeardownFn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WakeRequest {
    signal: u32,
    count: u32,
}

#[derive(Debug, Clone, Copy)]
struct Programmed {
    task: TaskId,
    time: Timepoint,
}

/// Why a pass was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    Immediate,
    Timer(TaskId),
}

/// Scheduler state of one group.
pub(crate) struct GroupCore {
    pub id: GroupId,
    pub shared: Arc<Shared>,
    pub slots: Vec<FiberSlot>,
    pub queues: StateQueues,
    timed: Deadlines<usize>,
    future_wakes: Deadlines<WakeRequest>,
    active_fibers: usize,
    produce_only_fibers: usize,
    /// Group logical time.
    pub now: Timepoint,
    unhandled: Option<BufferHandle>,
    programmed: Option<Programmed>,
    running: bool,
    batch_size: usize,
}

/// Drops non-matching heads until a match is at the head or the queue is empty.
/// Without a pattern, any head matches.
pub(crate) fn seek_match(queue: &mut LocalQueue, pattern: Option<&[u8]>, mask: Option<&[u8]>) -> bool {
    let Some(pattern) = pattern else {
        return !queue.is_empty();
    };
    loop {
        let matched = match queue.head() {
            None => return false,
            Some(head) => pattern::matches(head.payload(), pattern, mask),
        };
        if matched {
            return true;
        }
        queue.drop_head();
    }
}

impl GroupCore {
    fn new(id: GroupId, shared: Arc<Shared>, slots: Vec<FiberSlot>, config: &SimulatorConfig) -> Self {
        let fibers = slots.len();
        Self {
            id,
            shared,
            queues: StateQueues::new(fibers),
            timed: Deadlines::new(fibers.max(1).next_power_of_two()),
            future_wakes: Deadlines::new(config.future_wakes_capacity),
            active_fibers: 0,
            produce_only_fibers: 0,
            now: time::now(),
            unhandled: None,
            programmed: None,
            running: false,
            batch_size: config.input_batch_size,
            slots,
        }
    }

    // ==== fiber-side operations ====

    /// Called right before a fiber switches back to the scheduler.
    pub fn before_switch(&mut self, idx: usize) {
        self.slots[idx].func_count = 0;
        count!(self.shared, context_switches);
        self.shared.simulation.before_fiber_context_switch();
    }

    /// Moves a fiber into `queue` with `status`, arming a timer at `deadline`.
    pub fn park(&mut self, idx: usize, queue: Queue, status: FiberStatus, deadline: Option<Timepoint>) {
        let slot = &mut self.slots[idx];
        slot.status = status;
        if let Some(at) = deadline {
            debug_assert!(slot.deadline.is_none());
            // one timer per fiber and the structure holds one per fiber
            if self.timed.insert(at, idx).is_ok() {
                slot.deadline = Some(at);
            } else {
                error!(group = self.id, fiber = idx, "timer structure full, timeout dropped");
            }
        }
        self.queues.move_to(idx, queue);
    }

    /// Called when a parked fiber resumes. Returns true if its timer woke it.
    /// Any timer still armed is cancelled.
    pub fn unpark(&mut self, idx: usize) -> bool {
        let slot = &mut self.slots[idx];
        let by_timer = slot.status == FiberStatus::TimerRescheduled;
        slot.status = FiberStatus::Running;
        if let Some(at) = slot.deadline.take() {
            let removed = self.timed.remove(at, &idx);
            debug_assert!(removed);
        }
        by_timer
    }

    /// Wakes up to `count` fibers waiting on `signal` whose wait began at or before `now`.
    pub fn run_wake(&mut self, signal: u32, count: u32) {
        let mut left = count;
        for idx in self.queues.members(Queue::Blocked) {
            if left == 0 {
                break;
            }
            let ready = matches!(
                self.slots[idx].status,
                FiberStatus::Waiting { signal: s, since } if s == signal && since <= self.now
            );
            if ready {
                self.queues.move_to(idx, Queue::Run);
                left -= 1;
            }
        }
    }

    /// Defers a wake until group time reaches `at`. Returns false when full.
    pub fn defer_wake(&mut self, at: Timepoint, signal: u32, count: u32) -> bool {
        self.future_wakes.insert(at, WakeRequest { signal, count }).is_ok()
    }

    pub fn produce(&mut self, idx: usize, data: OutputData) {
        let record = OutputRecord {
            data,
            group: self.id,
            time: self.slots[idx].time,
        };
        match self.shared.output.produce(record) {
            Ok(()) => {
                count!(self.shared, outputs_produced);
            }
            Err(record) => {
                count!(self.shared, outputs_dropped);
                error!(
                    group = self.id,
                    fiber = idx,
                    time = record.time,
                    "output channel full, record dropped"
                );
                if record.data.is_dynamic() {
                    self.shared.simulation.dealloc(record.data, record.group);
                }
            }
        }
    }

    pub fn set_run_config(&mut self, idx: usize, cfg: FiberRunConfig) -> Result<()> {
        let slot = &mut self.slots[idx];
        slot.run_cfg.validate_transition(&cfg)?;
        if cfg.is_produce_only() && !slot.run_cfg.is_produce_only() {
            slot.queue.clear();
            self.produce_only_fibers += 1;
        }
        slot.run_cfg = cfg;
        Ok(())
    }

    // ==== main-loop operations ====

    /// Drains up to one batch from the input channel and fans each buffer out
    /// to every input-reading fiber. Returns the number of buffers consumed and
    /// the newest timestamp among them.
    fn consume_inputs(&mut self, input: &InputChannel) -> (usize, Timepoint) {
        let mut batch = Vec::with_capacity(self.batch_size);
        if let Some(carried) = self.unhandled.take() {
            batch.push(carried);
        }
        while batch.len() < self.batch_size {
            match input.try_consume() {
                Some(handle) => batch.push(handle),
                None => break,
            }
        }
        if batch.is_empty() {
            return (0, self.now);
        }

        let readers: Vec<usize> = [Queue::Run, Queue::Blocked, Queue::OnQueue]
            .into_iter()
            .flat_map(|q| self.queues.members(q))
            .filter(|&idx| !self.slots[idx].run_cfg.is_produce_only())
            .collect();
        debug_assert_eq!(readers.len(), self.active_fibers - self.produce_only_fibers);

        let consumed = batch.len();
        let mut newest = self.now;
        for handle in batch {
            newest = handle.timestamp();
            if readers.is_empty() {
                // nobody reads this group anymore
                continue;
            }
            for (handle, &idx) in handle.fan_out(readers.len() as u8).zip(&readers) {
                count!(self.shared, inputs_delivered);
                if self.slots[idx].queue.push_evicting(handle) {
                    trace!(group = self.id, fiber = idx, "local queue full, dropped oldest input");
                }
            }
        }
        (consumed, newest)
    }

    fn replay_deferred_wakes(&mut self) {
        while let Some((_, wake)) = self.future_wakes.pop_expired(self.now) {
            self.run_wake(wake.signal, wake.count);
        }
    }

    /// Promotes fibers whose timer expired. Returns how many timers fired.
    fn fire_timers(&mut self) -> usize {
        let mut fired = 0;
        while let Some((_, idx)) = self.timed.pop_expired(self.now) {
            fired += 1;
            count!(self.shared, timers_fired);
            let slot = &mut self.slots[idx];
            slot.deadline = None;
            // already woken for another reason during this pass
            if self.queues.queue_of(idx) == Queue::Run {
                continue;
            }
            slot.status = FiberStatus::TimerRescheduled;
            slot.time = slot.time.max(self.now);
            self.queues.move_to(idx, Queue::Run);
        }
        fired
    }

    fn process_blocked_on_queue(&mut self) {
        for idx in self.queues.members(Queue::OnQueue) {
            let slot = &mut self.slots[idx];
            let FiberStatus::BlockedOnRead { pattern, mask } = &slot.status else {
                continue;
            };
            if seek_match(&mut slot.queue, pattern.as_deref(), mask.as_deref()) {
                slot.time = slot.time.max(self.now);
                self.queues.move_to(idx, Queue::Run);
            }
        }
    }

    fn finish(&mut self, idx: usize) {
        self.queues.move_to(idx, Queue::Finished);
        let slot = &mut self.slots[idx];
        debug_assert!(slot.deadline.is_none());
        slot.queue.clear();
        if slot.run_cfg.is_produce_only() {
            self.produce_only_fibers -= 1;
        }
        self.active_fibers -= 1;
        debug!(group = self.id, fiber = idx, time = slot.time, "fiber finished");
    }

    fn nearest_event(&self) -> Option<Timepoint> {
        [self.timed.head_time(), self.future_wakes.head_time()]
            .into_iter()
            .flatten()
            .min()
    }

    fn setup_fibers(&mut self) -> Result<()> {
        if !self.queues.all_inactive() {
            return Err(SimError::NotAllowed);
        }
        let order = self.queues.members(Queue::Finished);
        for (n, &idx) in order.iter().enumerate() {
            let result = match self.slots[idx].setup.as_mut() {
                Some(setup) => setup(),
                None => Ok(()),
            };
            if let Err(err) = result {
                warn!(group = self.id, fiber = idx, %err, "fiber setup failed, rolling back");
                for &done in &order[..n] {
                    if let Some(teardown) = self.slots[done].teardown.as_mut() {
                        teardown();
                    }
                }
                self.queues.reset(self.slots.len());
                return Err(err);
            }
            self.queues.move_to(idx, Queue::Run);
        }

        self.now = self.now.max(time::now());
        for slot in &mut self.slots {
            slot.time = self.now;
            slot.func_count = 0;
        }
        self.active_fibers = self.slots.len();
        self.produce_only_fibers = self
            .slots
            .iter()
            .filter(|s| s.run_cfg.is_produce_only())
            .count();
        self.running = true;
        Ok(())
    }

    /// Undoes a successful `setup_fibers` before any fiber ran.
    fn rollback_setup(&mut self) {
        self.teardown_fibers();
        self.queues.reset(self.slots.len());
        self.active_fibers = 0;
        self.produce_only_fibers = 0;
    }

    fn teardown_fibers(&mut self) {
        self.running = false;
        if let Some(programmed) = self.programmed.take() {
            self.shared.tasks.cancel(programmed.task);
        }
        self.unhandled = None;
        for slot in &mut self.slots {
            slot.queue.clear();
            if let Some(teardown) = slot.teardown.as_mut() {
                teardown();
            }
        }
    }
}

struct FiberCell(UnsafeCell<Fiber>);

/// One group: its input channel, fibers and scheduler state.
pub(crate) struct GroupScheduler {
    id: GroupId,
    input: InputChannel,
    // declared before `core`: suspended fibers unwind before the state they point into goes away
    fibers: Box<[FiberCell]>,
    core: Exclusive<GroupCore>,
    shared: Arc<Shared>,
    self_ref: Weak<GroupScheduler>,
}

// SAFETY: `fibers` and `core` are only touched by the holder of the `core` lock.
unsafe impl Send for GroupScheduler {}
unsafe impl Sync for GroupScheduler {}

impl GroupScheduler {
    pub fn new(
        id: GroupId,
        configs: Vec<FiberConfig>,
        shared: Arc<Shared>,
        config: &SimulatorConfig,
    ) -> Result<Arc<Self>> {
        let mut fibers = Vec::with_capacity(configs.len());
        let mut slots = Vec::with_capacity(configs.len());
        for cfg in configs {
            cfg.validate()?;
            fibers.push(FiberCell(UnsafeCell::new(Fiber::new(cfg.stack_size, cfg.fiber)?)));
            slots.push(FiberSlot {
                time: 0,
                func_count: 0,
                run_cfg: cfg.run_cfg,
                status: FiberStatus::Running,
                deadline: None,
                queue: LocalQueue::new(cfg.queue_size),
                setup: cfg.setup,
                teardown: cfg.teardown,
            });
        }
        let input = InputChannel::new(config.group_queue_size);
        let core = GroupCore::new(id, shared.clone(), slots, config);
        debug!(group = id, fibers = fibers.len(), "group created");

        Ok(Arc::new_cyclic(|self_ref| Self {
            id,
            input,
            fibers: fibers.into_boxed_slice(),
            core: Exclusive::new(core),
            shared,
            self_ref: self_ref.clone(),
        }))
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn input(&self) -> &InputChannel {
        &self.input
    }

    /// Runs every fiber's setup hook and posts the first pass.
    pub fn run_setup(&self) -> Result<()> {
        let mut core = self.core.lock_spinning();
        core.setup_fibers()?;
        if let Err(err) = self.post(Trigger::Immediate) {
            core.rollback_setup();
            return Err(err);
        }
        debug!(group = self.id, "group set up");
        Ok(())
    }

    /// Tears down a group whose setup succeeded but whose fibers never ran.
    pub fn rollback_setup(&self) {
        let mut core = self.core.lock_spinning();
        core.rollback_setup();
    }

    /// Drops queued input and runs every fiber's teardown hook.
    pub fn run_teardown(&self) {
        let mut core = self.core.lock_spinning();
        core.teardown_fibers();
    }

    fn post(&self, trigger: Trigger) -> Result<()> {
        let weak = self.self_ref.clone();
        self.shared.tasks.post(move |_| {
            if let Some(group) = weak.upgrade() {
                group.run_pass(trigger);
            }
        })?;
        Ok(())
    }

    fn post_at(&self, at: Timepoint) -> Result<TaskId> {
        let weak = self.self_ref.clone();
        self.shared.tasks.post_at(at, move |id| {
            if let Some(group) = weak.upgrade() {
                group.run_pass(Trigger::Timer(id));
            }
        })
    }

    /// Schedules an immediate pass after a producer found the channel idle.
    pub fn schedule(&self) -> Result<()> {
        self.post(Trigger::Immediate)
    }

    /// One main-loop pass.
    pub fn run_pass(&self, trigger: Trigger) {
        let Some(guard) = self.core.try_lock() else {
            // another pass is running; retry after it
            if let Err(err) = self.post(trigger) {
                trace!(group = self.id, %err, "could not repost busy pass");
            }
            return;
        };
        let core = guard.as_ptr();
        // SAFETY: the guard is held for the whole pass.
        unsafe { self.pass(core, trigger) };
        drop(guard);
    }

    /// # Safety
    ///
    /// Caller holds the `core` lock and `core` points into it.
    unsafe fn pass(&self, core: *mut GroupCore, trigger: Trigger) {
        {
            let c = unsafe { &mut *core };
            if !c.running || c.queues.all_inactive() {
                return;
            }
            count!(c.shared, passes);

            let (consumed, newest) = c.consume_inputs(&self.input);
            let timer_pass = if let Trigger::Timer(task) = trigger {
                if c.programmed.is_some_and(|p| p.task == task) {
                    c.programmed = None;
                }
                true
            } else {
                false
            };
            let now = if consumed == 0 || timer_pass { time::now() } else { newest };
            c.now = c.now.max(now);
            trace!(group = c.id, now = c.now, consumed, ?trigger, "pass");

            c.replay_deferred_wakes();
            if c.fire_timers() > 0 {
                if let Some(programmed) = c.programmed.take() {
                    c.shared.tasks.cancel(programmed.task);
                }
            }
            if consumed > 0 {
                c.process_blocked_on_queue();
            }
        }

        unsafe { self.resume_runnable(core) };

        let c = unsafe { &mut *core };
        if !c.queues.is_empty(Queue::Run) {
            self.repost(c);
            return;
        }
        if let Some(handle) = self.input.try_consume() {
            c.unhandled = Some(handle);
            self.repost(c);
            return;
        }
        match self.input.try_switch_to_idle() {
            Err(Signal::Ok) => self.repost(c),
            _ => self.schedule_nearest(c),
        }
    }

    /// Resumes every fiber in the run queue once, in order.
    ///
    /// # Safety
    ///
    /// Caller holds the `core` lock and `core` points into it.
    unsafe fn resume_runnable(&self, core: *mut GroupCore) {
        let mut cursor = unsafe { (*core).queues.first(Queue::Run) };
        while let Some(idx) = cursor {
            {
                let c = unsafe { &mut *core };
                cursor = c.queues.next(idx);
                let now = c.now;
                let slot = &mut c.slots[idx];
                slot.time = slot.time.max(now);
            }

            // SAFETY: no reference into the core is alive while the fiber runs.
            let fiber = unsafe { &mut *self.fibers[idx].0.get() };
            let state = fiber.resume(core, idx);

            let c = unsafe { &mut *core };
            match state {
                FiberState::Suspended => {}
                FiberState::Complete => c.finish(idx),
                FiberState::Panic(payload) => {
                    error!(
                        group = c.id,
                        fiber = idx,
                        panic = panic_message(payload.as_ref()),
                        "fiber panicked"
                    );
                    // the fiber may have died with a timer armed
                    c.unpark(idx);
                    c.finish(idx);
                }
            }
        }
    }

    fn repost(&self, core: &mut GroupCore) {
        if let Err(err) = self.post(Trigger::Immediate) {
            debug!(group = core.id, %err, "pass not reposted");
        }
    }

    /// Programs a timer task for the nearest timeout or deferred wake, unless
    /// an earlier one is already programmed.
    fn schedule_nearest(&self, core: &mut GroupCore) {
        let Some(at) = core.nearest_event() else {
            return;
        };
        if let Some(programmed) = core.programmed {
            if programmed.time <= at {
                return;
            }
            core.shared.tasks.cancel(programmed.task);
            core.programmed = None;
        }
        match self.post_at(at) {
            Ok(task) => core.programmed = Some(Programmed { task, time: at }),
            Err(err) => debug!(group = core.id, %err, "timer not programmed"),
        }
    }
}
