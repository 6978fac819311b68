//! The embedding side of a simulator: the [`Simulation`] callbacks and the
//! per-fiber registration data handed to [`SimulationSetup::add_fiber`].

use crate::GroupId;
use crate::config::{DEFAULT_FIBER_QUEUE_SIZE, FiberRunConfig, default_stack_size};
use crate::context::Context;
use crate::error::{Result, SimError};
use crate::out_queue::OutputData;

/// Body of a fiber. Runs once; the fiber finishes when it returns.
pub type FiberFn = Box<dyn FnOnce(&mut Context<'_>) + Send + 'static>;
/// Runs during [`Simulator::run_setup`](crate::Simulator::run_setup), before the fiber starts.
pub type SetupFn = Box<dyn FnMut() -> Result<()> + Send + 'static>;
/// Runs during [`Simulator::run_teardown`](crate::Simulator::run_teardown).
pub type TeardownFn = Box<dyn FnMut() + Send + 'static>;

/// Registration data for one fiber.
pub struct FiberConfig {
    pub group: GroupId,
    pub fiber: FiberFn,
    pub setup: Option<SetupFn>,
    pub teardown: Option<TeardownFn>,
    pub stack_size: usize,
    /// Fiber-local queue capacity, rounded up to a power of two.
    pub queue_size: usize,
    pub run_cfg: FiberRunConfig,
}

impl FiberConfig {
    pub fn new<F>(group: GroupId, fiber: F) -> Self
    where
        F: FnOnce(&mut Context<'_>) + Send + 'static,
    {
        Self {
            group,
            fiber: Box::new(fiber),
            setup: None,
            teardown: None,
            stack_size: default_stack_size(),
            queue_size: DEFAULT_FIBER_QUEUE_SIZE,
            run_cfg: FiberRunConfig::default(),
        }
    }

    pub fn with_setup<F>(mut self, setup: F) -> Self
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        self.setup = Some(Box::new(setup));
        self
    }

    pub fn with_teardown<F>(mut self, teardown: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.teardown = Some(Box::new(teardown));
        self
    }

    pub fn with_run_config(mut self, run_cfg: FiberRunConfig) -> Self {
        self.run_cfg = run_cfg;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.stack_size == 0 || self.queue_size == 0 {
            return Err(SimError::Invalid);
        }
        self.run_cfg.validate()
    }
}

impl std::fmt::Debug for FiberConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberConfig")
            .field("group", &self.group)
            .field("stack_size", &self.stack_size)
            .field("queue_size", &self.queue_size)
            .field("run_cfg", &self.run_cfg)
            .field("has_setup", &self.setup.is_some())
            .field("has_teardown", &self.teardown.is_some())
            .finish()
    }
}

/// Callbacks of a simulation plugged into a [`Simulator`](crate::Simulator).
///
/// `dealloc` and `before_fiber_context_switch` may be called concurrently from
/// different groups.
pub trait Simulation: Send + Sync + 'static {
    /// Registers fiber groups. Must add at least one fiber.
    fn on_setup(&self, setup: &mut SimulationSetup) -> Result<()>;

    fn on_teardown(&self) {}

    /// Receives dynamic output data once it has been read or discarded.
    fn dealloc(&self, _data: OutputData, _group: GroupId) {}

    /// Called on the fiber's stack right before it suspends.
    fn before_fiber_context_switch(&self) {}
}

/// Collects fiber registrations during [`Simulation::on_setup`].
///
/// The first invalid registration sticks: later calls keep failing and
/// simulator creation fails with the same error.
#[derive(Debug, Default)]
pub struct SimulationSetup {
    groups: Vec<Vec<FiberConfig>>,
    error: Option<SimError>,
}

impl SimulationSetup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers one fiber. Group ids start at 0 and are consecutive: a fiber
    /// either joins the latest group or opens the next one.
    pub fn add_fiber(&mut self, cfg: FiberConfig) -> Result<()> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let group = cfg.group as usize;
        let result = cfg.validate().and_then(|()| {
            if group == self.groups.len() {
                self.groups.push(vec![cfg]);
                Ok(())
            } else if group + 1 == self.groups.len() {
                self.groups[group].push(cfg);
                Ok(())
            } else {
                Err(SimError::Invalid)
            }
        });
        if let Err(err) = result {
            self.error = Some(err);
        }
        result
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub(crate) fn finish(self) -> Result<Vec<Vec<FiberConfig>>> {
        match self.error {
            Some(err) => Err(err),
            None if self.groups.is_empty() => Err(SimError::Generic),
            None => Ok(self.groups),
        }
    }
}
