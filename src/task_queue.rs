//! Task facility driving the group main loops.
//!
//! Tasks are posted to run as soon as possible or at an absolute deadline.
//! Any thread may call [`TaskQueue::run_one`]; whichever caller wins the timer
//! try-lock moves expired delayed tasks onto the ready queue, so no caller ever
//! blocks on another.

use crate::error::{Result, SimError};
use crate::sync::{Exclusive, SleepBackoff};
use crate::time::{self, Timepoint};
use crossbeam::deque::{Injector, Steal};
use crossbeam::queue::SegQueue;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub type TaskId = u64;

type TaskFn = Box<dyn FnOnce(TaskId) + Send + 'static>;

struct Task {
    id: TaskId,
    func: TaskFn,
}

struct Delayed {
    deadline: Timepoint,
    task: Task,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.task.id == other.task.id
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.task.id).cmp(&(other.deadline, other.task.id))
    }
}

#[derive(Default)]
struct Timers {
    heap: BinaryHeap<Reverse<Delayed>>,
    /// Ids still in `heap`.
    live: HashSet<TaskId>,
    /// Live ids whose cancel arrived before they fired.
    cancelled: HashSet<TaskId>,
}

/// Longest single sleep while waiting for work.
const MAX_BACKOFF_US: u64 = 1000;

pub struct TaskQueue {
    ready: Injector<Task>,
    incoming: SegQueue<Delayed>,
    cancels: SegQueue<TaskId>,
    timers: Exclusive<Timers>,
    /// Earliest known delayed deadline, `u64::MAX` when none.
    next_deadline: AtomicU64,
    next_id: AtomicU64,
    blocked: AtomicBool,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            ready: Injector::new(),
            incoming: SegQueue::new(),
            cancels: SegQueue::new(),
            timers: Exclusive::new(Timers::default()),
            next_deadline: AtomicU64::new(u64::MAX),
            next_id: AtomicU64::new(1),
            blocked: AtomicBool::new(false),
        }
    }

    fn make_task<F>(&self, func: F) -> Result<Task>
    where
        F: FnOnce(TaskId) + Send + 'static,
    {
        if self.blocked.load(Ordering::Acquire) {
            return Err(SimError::Locked);
        }
        Ok(Task {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            func: Box::new(func),
        })
    }

    /// Posts a task to run as soon as possible.
    pub fn post<F>(&self, func: F) -> Result<TaskId>
    where
        F: FnOnce(TaskId) + Send + 'static,
    {
        let task = self.make_task(func)?;
        let id = task.id;
        self.ready.push(task);
        Ok(id)
    }

    /// Posts a task to run once the clock reaches `deadline`.
    pub fn post_at<F>(&self, deadline: Timepoint, func: F) -> Result<TaskId>
    where
        F: FnOnce(TaskId) + Send + 'static,
    {
        let task = self.make_task(func)?;
        let id = task.id;
        self.incoming.push(Delayed { deadline, task });
        self.next_deadline.fetch_min(deadline, Ordering::AcqRel);
        Ok(id)
    }

    /// Cancels a delayed task that has not fired yet. Cancelling a task that
    /// already fired or ran is a no-op.
    pub fn cancel(&self, id: TaskId) {
        self.cancels.push(id);
    }

    /// Rejects all further posts. Already queued tasks still run.
    pub fn block(&self) {
        self.blocked.store(true, Ordering::Release);
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    /// Moves expired delayed tasks to the ready queue. Skipped if another
    /// caller is already doing it.
    fn advance_timers(&self) {
        let Some(mut timers) = self.timers.try_lock() else {
            return;
        };
        // a cancel is pushed after its post, so draining cancels first
        // guarantees the matching post is visible below
        let cancels: Vec<TaskId> = std::iter::from_fn(|| self.cancels.pop()).collect();
        while let Some(delayed) = self.incoming.pop() {
            timers.live.insert(delayed.task.id);
            timers.heap.push(Reverse(delayed));
        }
        for id in cancels {
            // ids that already fired are dropped here
            if timers.live.contains(&id) {
                timers.cancelled.insert(id);
            }
        }

        let now = time::now();
        while let Some(Reverse(head)) = timers.heap.peek() {
            if head.deadline > now {
                break;
            }
            let Some(Reverse(delayed)) = timers.heap.pop() else {
                break;
            };
            timers.live.remove(&delayed.task.id);
            if !timers.cancelled.remove(&delayed.task.id) {
                self.ready.push(delayed.task);
            }
        }

        let earliest = timers
            .heap
            .peek()
            .map(|Reverse(d)| d.deadline)
            .unwrap_or(u64::MAX);
        self.next_deadline.store(earliest, Ordering::Release);
        // posts that raced with the store above
        if !self.incoming.is_empty() {
            self.next_deadline.store(now, Ordering::Release);
        }
    }

    fn pop_ready(&self) -> Option<Task> {
        loop {
            match self.ready.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Runs one ready task without waiting.
    pub fn try_run_one(&self) -> Result<()> {
        self.advance_timers();
        match self.pop_ready() {
            Some(task) => {
                (task.func)(task.id);
                Ok(())
            }
            None => Err(SimError::NothingToDo),
        }
    }

    /// Runs one task, waiting up to `timeout_us` for one to become ready.
    pub fn run_one(&self, timeout_us: u64) -> Result<()> {
        let deadline = time::now().saturating_add(timeout_us);
        let mut backoff = SleepBackoff::new(1, MAX_BACKOFF_US);
        loop {
            match self.try_run_one() {
                Err(SimError::NothingToDo) => {}
                done => return done,
            }
            let now = time::now();
            if now >= deadline {
                return Err(SimError::Timeout);
            }
            let next_timer = self.next_deadline.load(Ordering::Acquire);
            let limit = (deadline - now).min(next_timer.saturating_sub(now));
            backoff.wait(limit);
        }
    }

    /// Drops every queued task without running it.
    pub fn clear(&self) {
        while self.pop_ready().is_some() {}
        while self.incoming.pop().is_some() {}
        while self.cancels.pop().is_some() {}
        let mut timers = self.timers.lock_spinning();
        timers.heap.clear();
        timers.live.clear();
        timers.cancelled.clear();
    }
}
