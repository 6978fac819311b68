//! Simulator lifecycle: create, setup, run, teardown, plus the external
//! write/read surface.

use crate::GroupId;
use crate::buffer::WriteBuffer;
use crate::config::SimulatorConfig;
use crate::error::{Result, SimError};
use crate::group::GroupScheduler;
#[cfg(feature = "metrics")]
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::out_queue::{OutputChannel, OutputRecord};
use crate::simulation::{Simulation, SimulationSetup};
use crate::task_queue::TaskQueue;
use crate::time;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, warn};

/// Refcounts are 8 bits wide.
const MAX_READERS_PER_GROUP: usize = u8::MAX as usize;

/// State shared by the simulator and all of its groups.
pub(crate) struct Shared {
    pub tasks: TaskQueue,
    pub output: OutputChannel,
    pub simulation: Box<dyn Simulation>,
    #[cfg(feature = "metrics")]
    pub metrics: Metrics,
}

/// Where a simulator is in its lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// Inside [`Simulation::on_setup`].
    OnSetup = 0,
    /// Created; fibers not started.
    Initialized = 1,
    /// Fibers set up and scheduled.
    Running = 2,
    /// Torn down.
    Stopped = 3,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LifecycleState::OnSetup,
            1 => LifecycleState::Initialized,
            2 => LifecycleState::Running,
            _ => LifecycleState::Stopped,
        }
    }
}

/// A set of fiber groups driven by an external caller.
///
/// All methods take `&self`: groups can be driven by several threads calling
/// [`run_some`](Self::run_some) while another thread writes and reads.
pub struct Simulator {
    shared: Arc<Shared>,
    groups: Vec<Arc<GroupScheduler>>,
    state: AtomicU8,
}

impl Simulator {
    /// Creates a simulator with the default sizing.
    pub fn create<S: Simulation>(simulation: S) -> Result<Self> {
        Self::create_with_config(simulation, SimulatorConfig::default())
    }

    pub fn create_with_config<S: Simulation>(simulation: S, config: SimulatorConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            tasks: TaskQueue::new(),
            output: OutputChannel::new(config.out_queue_size),
            simulation: Box::new(simulation),
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
        });

        let mut setup = SimulationSetup::new();
        shared.simulation.on_setup(&mut setup)?;

        let groups = match Self::build_groups(setup, &shared, &config) {
            Ok(groups) => groups,
            Err(err) => {
                debug!(%err, "simulator creation failed, tearing down simulation");
                shared.simulation.on_teardown();
                return Err(err);
            }
        };
        debug!(groups = groups.len(), "simulator created");

        Ok(Self {
            shared,
            groups,
            state: AtomicU8::new(LifecycleState::Initialized as u8),
        })
    }

    fn build_groups(
        setup: SimulationSetup,
        shared: &Arc<Shared>,
        config: &SimulatorConfig,
    ) -> Result<Vec<Arc<GroupScheduler>>> {
        let registered = setup.finish()?;
        for configs in &registered {
            let readers = configs.iter().filter(|c| !c.run_cfg.is_produce_only()).count();
            if readers > MAX_READERS_PER_GROUP {
                return Err(SimError::Invalid);
            }
        }
        registered
            .into_iter()
            .enumerate()
            .map(|(id, configs)| {
                let id = GroupId::try_from(id).map_err(|_| SimError::Invalid)?;
                GroupScheduler::new(id, configs, shared.clone(), config)
            })
            .collect()
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn expect_state(&self, expected: LifecycleState) -> Result<()> {
        if self.state() == expected {
            Ok(())
        } else {
            Err(SimError::NotAllowed)
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Runs every fiber's setup hook and schedules the first pass of each group.
    ///
    /// If a group fails, the groups already set up are rolled back and the
    /// simulator stays `Initialized`.
    pub fn run_setup(&self) -> Result<()> {
        self.expect_state(LifecycleState::Initialized)?;
        for (n, group) in self.groups.iter().enumerate() {
            if let Err(err) = group.run_setup() {
                warn!(group = group.id(), %err, "group setup failed, rolling back");
                for done in self.groups[..n].iter().rev() {
                    done.rollback_setup();
                }
                return Err(err);
            }
        }
        self.set_state(LifecycleState::Running);
        debug!("simulator running");
        Ok(())
    }

    /// Runs every fiber's teardown hook and the simulation's `on_teardown`.
    pub fn run_teardown(&self) -> Result<()> {
        self.expect_state(LifecycleState::Running)?;
        for group in &self.groups {
            group.run_teardown();
        }
        self.shared.simulation.on_teardown();
        self.set_state(LifecycleState::Stopped);
        debug!("simulator stopped");
        Ok(())
    }

    /// Runs one unit of scheduler work, waiting up to `timeout_us` for some.
    pub fn run_some(&self, timeout_us: u64) -> Result<()> {
        self.expect_state(LifecycleState::Running)?;
        self.shared.tasks.run_one(timeout_us)
    }

    /// Runs one unit of scheduler work if any is ready.
    pub fn try_run_some(&self) -> Result<()> {
        self.expect_state(LifecycleState::Running)?;
        self.shared.tasks.try_run_one()
    }

    /// Irreversibly rejects further writes and scheduling. Work already queued
    /// still runs.
    pub fn block(&self) {
        for group in &self.groups {
            group.input().block();
        }
        self.shared.tasks.block();
        debug!("simulator blocked");
    }

    /// Allocates a buffer for [`write`](Self::write).
    pub fn alloc_write_buffer(&self, capacity: usize) -> Result<WriteBuffer> {
        WriteBuffer::alloc(capacity)
    }

    /// Sends the first `size` bytes of `buf` to `group`, stamped with the
    /// current time. The buffer is consumed whether or not this succeeds.
    pub fn write(&self, group: GroupId, buf: WriteBuffer, size: usize) -> Result<()> {
        let target = self.groups.get(group as usize).ok_or(SimError::Invalid)?;
        let handle = buf.publish(size, time::now())?;
        if target.input().produce(handle)? {
            // the group had gone idle: nothing else will drain it
            target.schedule()?;
        }
        Ok(())
    }

    /// Copies `bytes` into a new buffer and writes it to `group`.
    pub fn write_bytes(&self, group: GroupId, bytes: &[u8]) -> Result<()> {
        let buf = WriteBuffer::from_slice(bytes)?;
        self.write(group, buf, bytes.len())
    }

    /// Reads up to `capacity` records in timestamp order, waiting at most
    /// `timeout_us`. Pass each record to
    /// [`dealloc_read_record`](Self::dealloc_read_record) when done with it.
    pub fn read(&self, capacity: usize, timeout_us: u64) -> Result<Vec<OutputRecord>> {
        let shared = &self.shared;
        shared.output.consume(capacity, timeout_us, |record| {
            count!(shared, outputs_evicted);
            if record.data.is_dynamic() {
                shared.simulation.dealloc(record.data, record.group);
            }
        })
    }

    /// Releases a record obtained from [`read`](Self::read).
    pub fn dealloc_read_record(&self, record: OutputRecord) {
        if record.data.is_dynamic() {
            self.shared.simulation.dealloc(record.data, record.group);
        }
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Brings the simulator to `Stopped`, running setup first if it never ran.
    fn shutdown(&self) -> Result<()> {
        let result = match self.state() {
            LifecycleState::Initialized => self.run_setup().and_then(|()| self.run_teardown()),
            LifecycleState::Running => self.run_teardown(),
            LifecycleState::OnSetup | LifecycleState::Stopped => Ok(()),
        };
        if self.state() != LifecycleState::Stopped {
            self.shared.simulation.on_teardown();
            self.set_state(LifecycleState::Stopped);
        }
        result
    }

    /// Tears the simulator down and releases it.
    pub fn destroy(self) -> Result<()> {
        self.shutdown()
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(%err, "shutdown failed while dropping simulator");
        }
        self.block();
        self.shared.tasks.clear();
        for record in self.shared.output.drain_all() {
            self.dealloc_read_record(record);
        }
        debug!("simulator destroyed");
    }
}
