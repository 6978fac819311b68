mod common;

use common::{collect, drive, run_until_idle, start};
use simfiber::{Context, FiberConfig, FiberRunConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[test]
fn test_future_produce() {
    let (sim, _) = start(|setup| {
        setup.add_fiber(FiberConfig::new(0, |ctx: &mut Context<'_>| {
            for _ in 0..4 {
                ctx.delay(1_000);
                ctx.produce_static_output(b"tick");
            }
        }))
    });

    let records = collect(&sim, 4, Duration::from_secs(2));
    assert_eq!(records.len(), 4);
    for pair in records.windows(2) {
        assert_eq!(pair[1].time - pair[0].time, 1_000);
    }
}

#[test]
fn test_future_output_is_held_until_due() {
    let (sim, _) = start(|setup| {
        setup.add_fiber(FiberConfig::new(0, |ctx: &mut Context<'_>| {
            ctx.delay(30_000);
            ctx.produce_static_output(b"late");
        }))
    });

    run_until_idle(&sim);
    let start = Instant::now();
    let records = sim.read(1, 1_000_000).unwrap();
    assert_eq!(records.len(), 1);
    assert!(start.elapsed() >= Duration::from_millis(20));
}

#[test]
fn test_future_wake() {
    let observed = Arc::new(AtomicU64::new(0));
    let o = observed.clone();
    let (sim, _) = start(move |setup| {
        setup.add_fiber(FiberConfig::new(0, |ctx: &mut Context<'_>| {
            ctx.delay(2_000);
            ctx.wake(3, 1);
        }))?;
        let o = o.clone();
        setup.add_fiber(FiberConfig::new(0, move |ctx: &mut Context<'_>| {
            let before = ctx.timestamp();
            if ctx.wait(3, 0) {
                o.store(ctx.timestamp() - before, Ordering::SeqCst);
            }
        }))
    });

    run_until_idle(&sim);
    // the wake is deferred until group time reaches the waker's time
    assert_eq!(observed.load(Ordering::SeqCst), 0);

    drive(&sim, Duration::from_millis(30));
    assert!(observed.load(Ordering::SeqCst) >= 2_000);
}

#[test]
fn test_look_ahead_forces_switch() {
    let samples = Arc::new(Mutex::new(Vec::new()));
    let s = samples.clone();
    let (sim, _) = start(move |setup| {
        let s = s.clone();
        let cfg = FiberRunConfig {
            look_ahead_offset_us: 1_000,
            ..Default::default()
        };
        setup.add_fiber(
            FiberConfig::new(0, move |ctx: &mut Context<'_>| {
                for _ in 0..10 {
                    ctx.delay(300);
                    s.lock().unwrap().push((ctx.timestamp(), ctx.func_count()));
                }
            })
            .with_run_config(cfg),
        )
    });

    drive(&sim, Duration::from_millis(50));

    let samples = samples.lock().unwrap();
    assert_eq!(samples.len(), 10);
    let counts: Vec<u32> = samples.iter().take(4).map(|&(_, c)| c).collect();
    // the fourth delay crosses now + 1000 and parks the fiber
    assert_eq!(counts, vec![1, 2, 3, 0]);
    for pair in samples.windows(2) {
        assert!(pair[1].0 >= pair[0].0 + 300);
    }
}

#[test]
fn test_func_count_limit_forces_switch() {
    let counts = Arc::new(Mutex::new(Vec::new()));
    let c = counts.clone();
    let (sim, _) = start(move |setup| {
        let c = c.clone();
        let cfg = FiberRunConfig {
            max_func_count: 2,
            ..Default::default()
        };
        setup.add_fiber(
            FiberConfig::new(0, move |ctx: &mut Context<'_>| {
                for _ in 0..5 {
                    ctx.delay(0);
                    c.lock().unwrap().push(ctx.func_count());
                }
            })
            .with_run_config(cfg),
        )
    });

    run_until_idle(&sim);
    assert_eq!(*counts.lock().unwrap(), vec![1, 2, 0, 1, 2]);
}

#[test]
fn test_real_time_fiber_waits_for_the_clock() {
    let waited = Arc::new(Mutex::new(None));
    let w = waited.clone();
    let (sim, _) = start(move |setup| {
        let w = w.clone();
        setup.add_fiber(FiberConfig::new(0, move |ctx: &mut Context<'_>| {
            ctx.set_real_time().unwrap();
            assert_eq!(ctx.run_config().look_ahead_offset_us, 0);
            let t0 = ctx.timestamp();
            let start = Instant::now();
            ctx.delay(2_000);
            *w.lock().unwrap() = Some((ctx.timestamp() - t0, start.elapsed()));
        }))
    });

    drive(&sim, Duration::from_millis(30));
    let (logical, wall) = waited.lock().unwrap().expect("fiber finished");
    assert!(logical >= 2_000);
    assert!(wall >= Duration::from_micros(1_500));
}

#[test]
fn test_run_config_rejects_clearing_produce_only() {
    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    let (sim, _) = start(move |setup| {
        let o = o.clone();
        setup.add_fiber(FiberConfig::new(0, move |ctx: &mut Context<'_>| {
            ctx.set_produce_only().unwrap();
            let cleared = ctx.set_run_config(FiberRunConfig::default());
            let zero = ctx.set_run_config(FiberRunConfig {
                max_func_count: 0,
                ..ctx.run_config()
            });
            *o.lock().unwrap() = Some((cleared, zero, ctx.run_config().is_produce_only()));
        }))
    });

    run_until_idle(&sim);
    let (cleared, zero, still) = outcome.lock().unwrap().expect("fiber finished");
    assert_eq!(cleared, Err(simfiber::SimError::Invalid));
    assert_eq!(zero, Err(simfiber::SimError::Invalid));
    assert!(still);
}

#[test]
fn test_drop_all_input_counts_toward_switch() {
    let counts = Arc::new(Mutex::new(Vec::new()));
    let c = counts.clone();
    let (sim, _) = start(move |setup| {
        let c = c.clone();
        let cfg = FiberRunConfig {
            max_func_count: 2,
            ..Default::default()
        };
        setup.add_fiber(
            FiberConfig::new(0, move |ctx: &mut Context<'_>| {
                for _ in 0..5 {
                    ctx.drop_all_input();
                    c.lock().unwrap().push(ctx.func_count());
                }
            })
            .with_run_config(cfg),
        )
    });

    run_until_idle(&sim);
    assert_eq!(*counts.lock().unwrap(), vec![1, 2, 0, 1, 2]);
}

#[test]
fn test_unanswered_peeks_count_toward_switch() {
    let counts = Arc::new(Mutex::new(Vec::new()));
    let c = counts.clone();
    let (sim, _) = start(move |setup| {
        let c = c.clone();
        let cfg = FiberRunConfig {
            max_func_count: 2,
            ..Default::default()
        };
        setup.add_fiber(
            FiberConfig::new(0, move |ctx: &mut Context<'_>| {
                for n in 0..5 {
                    let found = if n % 2 == 0 {
                        ctx.timed_peek_input_head(0).is_some()
                    } else {
                        ctx.timed_peek_input_head_match(&[0xAA], 0).is_some()
                    };
                    assert!(!found);
                    c.lock().unwrap().push(ctx.func_count());
                }
            })
            .with_run_config(cfg),
        )
    });

    run_until_idle(&sim);
    assert_eq!(*counts.lock().unwrap(), vec![1, 2, 0, 1, 2]);
}
