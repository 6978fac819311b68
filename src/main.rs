use simfiber::{Context, FiberConfig, OutputData, Result, SimError, Simulation, SimulationSetup, Simulator};
use std::thread;
use std::time::Instant;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Answers every input with the same bytes, each incremented by one.
struct Echo;

impl Simulation for Echo {
    fn on_setup(&self, setup: &mut SimulationSetup) -> Result<()> {
        setup.add_fiber(FiberConfig::new(0, |ctx: &mut Context<'_>| {
            loop {
                let reply: Vec<u8> = ctx.peek_input_head().iter().map(|b| b.wrapping_add(1)).collect();
                ctx.drop_input_head();
                ctx.delay(100);
                ctx.produce_dynamic_output(reply);
            }
        }))
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    println!("simfiber - echo simulation\n");

    let sim = Simulator::create(Echo)?;
    sim.run_setup()?;

    let messages: usize = 8;
    let start = Instant::now();
    let mut received = 0;

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..messages {
                let payload = [i as u8, 0x10, 0x20];
                if let Err(err) = sim.write_bytes(0, &payload) {
                    eprintln!("write {} failed: {}", i, err);
                }
                thread::sleep(std::time::Duration::from_millis(1));
            }
        });

        while received < messages {
            match sim.run_some(1_000) {
                Ok(()) | Err(SimError::Timeout) => {}
                Err(err) => {
                    eprintln!("scheduler error: {}", err);
                    break;
                }
            }
            match sim.read(16, 0) {
                Ok(records) => {
                    for record in records {
                        if let OutputData::DynamicBytes(bytes) = &record.data {
                            println!("  group {} @ {:>8}us: {:02x?}", record.group, record.time, bytes);
                        }
                        received += 1;
                        sim.dealloc_read_record(record);
                    }
                }
                Err(SimError::Timeout) => {}
                Err(err) => {
                    eprintln!("read error: {}", err);
                    break;
                }
            }
        }
    });

    println!("\nEchoed {} messages in {:?}", received, start.elapsed());
    sim.block();
    sim.destroy()
}
