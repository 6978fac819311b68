//! # simfiber - Virtual-Time Fiber Simulator
//!
//! A deterministic discrete-event simulator for device and protocol fibers.
//! Fibers are cooperative, stackful tasks that exchange byte messages through
//! per-group input queues and one shared output queue. They are scheduled by
//! per-fiber logical clocks rather than by wall-clock time.
//!
//! ## Architecture
//!
//! - **Groups**: sets of fibers sharing one input channel and one logical clock,
//!   driven by a main loop that multiplexes input, timeouts and deferred wakes
//! - **Fibers**: stackful coroutines that suspend only at scheduler calls
//! - **Buffers**: refcounted input messages fanned out to every reading fiber
//!   without copying
//! - **Output**: a bounded channel plus a staging area that delivers records in
//!   timestamp order
//! - **Tasks**: the queue of main-loop passes, driven by the embedding
//!   application through [`Simulator::run_some`]
//!
//! ## Example
//!
//! ```no_run
//! use simfiber::{Context, FiberConfig, Result, Simulation, SimulationSetup, Simulator};
//!
//! struct Echo;
//!
//! impl Simulation for Echo {
//!     fn on_setup(&self, setup: &mut SimulationSetup) -> Result<()> {
//!         setup.add_fiber(FiberConfig::new(0, |ctx: &mut Context<'_>| loop {
//!             let reply = ctx.peek_input_head().to_vec();
//!             ctx.drop_input_head();
//!             ctx.produce_dynamic_output(reply);
//!         }))
//!     }
//! }
//!
//! let sim = Simulator::create(Echo)?;
//! sim.run_setup()?;
//! sim.write_bytes(0, b"ping")?;
//! while sim.try_run_some().is_ok() {}
//! for record in sim.read(16, 10_000)? {
//!     println!("{:?} at {}", record.data, record.time);
//!     sim.dealloc_read_record(record);
//! }
//! # Ok::<(), simfiber::SimError>(())
//! ```

#[macro_use]
mod metrics;

pub mod buffer;
pub mod config;
pub mod context;
pub mod error;
pub mod out_queue;
pub mod pattern;
pub mod simulation;
pub mod simulator;
pub mod time;

mod deadlines;
mod fiber;
mod group;
mod in_queue;
mod local_queue;
mod state_queue;
mod sync;
mod task_queue;

/// Index of a fiber group, assigned consecutively from 0.
pub type GroupId = u16;

pub use buffer::WriteBuffer;
pub use config::{FiberRunConfig, RunFlags, SimulatorConfig};
pub use context::{Context, Semaphore};
pub use error::{Result, SimError};
#[cfg(feature = "metrics")]
pub use metrics::{Metrics, MetricsSnapshot};
pub use out_queue::{OutputData, OutputKind, OutputRecord};
pub use simulation::{FiberConfig, Simulation, SimulationSetup};
pub use simulator::{LifecycleState, Simulator};
pub use time::Timepoint;
