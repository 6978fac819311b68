#![allow(dead_code)]

use simfiber::{
    GroupId, OutputData, OutputRecord, Result, SimError, Simulation, SimulationSetup, Simulator,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Simulation whose fibers are registered by a closure. Counts dynamic deallocs.
pub struct TestSim<F> {
    register: F,
    pub deallocs: Arc<AtomicUsize>,
}

impl<F> TestSim<F>
where
    F: Fn(&mut SimulationSetup) -> Result<()> + Send + Sync + 'static,
{
    pub fn new(register: F) -> Self {
        Self {
            register,
            deallocs: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<F> Simulation for TestSim<F>
where
    F: Fn(&mut SimulationSetup) -> Result<()> + Send + Sync + 'static,
{
    fn on_setup(&self, setup: &mut SimulationSetup) -> Result<()> {
        (self.register)(setup)
    }

    fn dealloc(&self, _data: OutputData, _group: GroupId) {
        self.deallocs.fetch_add(1, Ordering::SeqCst);
    }
}

/// Creates and sets up a simulator. Returns it with its dealloc counter.
pub fn start<F>(register: F) -> (Simulator, Arc<AtomicUsize>)
where
    F: Fn(&mut SimulationSetup) -> Result<()> + Send + Sync + 'static,
{
    let test_sim = TestSim::new(register);
    let deallocs = test_sim.deallocs.clone();
    let sim = Simulator::create(test_sim).unwrap();
    sim.run_setup().unwrap();
    (sim, deallocs)
}

/// Runs ready passes until none is left. Pending timers are not waited for.
pub fn run_until_idle(sim: &Simulator) {
    loop {
        match sim.try_run_some() {
            Ok(()) => {}
            Err(SimError::NothingToDo) => return,
            Err(err) => panic!("unexpected scheduler error: {err}"),
        }
    }
}

/// Drives the scheduler, timers included, for `budget`.
pub fn drive(sim: &Simulator, budget: Duration) {
    let start = Instant::now();
    while start.elapsed() < budget {
        match sim.run_some(1_000) {
            Ok(()) | Err(SimError::Timeout) => {}
            Err(err) => panic!("unexpected scheduler error: {err}"),
        }
    }
}

/// Drives the scheduler and reads until `count` records arrived or `budget` ran out.
pub fn collect(sim: &Simulator, count: usize, budget: Duration) -> Vec<OutputRecord> {
    let start = Instant::now();
    let mut out = Vec::new();
    while out.len() < count && start.elapsed() < budget {
        match sim.run_some(500) {
            Ok(()) | Err(SimError::Timeout) => {}
            Err(err) => panic!("unexpected scheduler error: {err}"),
        }
        match sim.read(count - out.len(), 0) {
            Ok(records) => out.extend(records),
            Err(SimError::Timeout) => {}
            Err(err) => panic!("unexpected read error: {err}"),
        }
    }
    out
}

/// Payload bytes of every bytes record, in order.
pub fn payloads(records: &[OutputRecord]) -> Vec<Vec<u8>> {
    records
        .iter()
        .filter_map(|r| r.data.as_bytes().map(<[u8]>::to_vec))
        .collect()
}

pub fn release(sim: &Simulator, records: Vec<OutputRecord>) {
    for record in records {
        sim.dealloc_read_record(record);
    }
}
