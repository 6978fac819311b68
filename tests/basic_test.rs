mod common;

use common::{collect, drive, payloads, release, run_until_idle, start};
use simfiber::{Context, FiberConfig, OutputData, SimError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

fn responder(pattern: u8, reply: u8) -> FiberConfig {
    FiberConfig::new(0, move |ctx: &mut Context<'_>| {
        loop {
            ctx.peek_input_head_match(&[pattern]);
            ctx.drop_input_head();
            ctx.produce_dynamic_output(vec![reply]);
        }
    })
}

#[test]
fn test_queue_no_match() {
    let (sim, _) = start(|setup| setup.add_fiber(responder(0xDD, 0xEE)));

    sim.write_bytes(0, &[0x01]).unwrap();
    run_until_idle(&sim);

    assert_eq!(sim.try_run_some(), Err(SimError::NothingToDo));
    assert_eq!(sim.read(8, 5_000).unwrap_err(), SimError::Timeout);
}

#[test]
fn test_queue_match() {
    let (sim, deallocs) = start(|setup| setup.add_fiber(responder(0xDD, 0xEE)));

    sim.write_bytes(0, &[0xDD]).unwrap();
    run_until_idle(&sim);

    let records = sim.read(8, 100_000).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data, OutputData::DynamicBytes(vec![0xEE].into()));
    assert_eq!(records[0].group, 0);

    release(&sim, records);
    assert_eq!(deallocs.load(Ordering::SeqCst), 1);
    assert_eq!(sim.read(8, 1_000).unwrap_err(), SimError::Timeout);
}

#[test]
fn test_answer_after_blocking_timeout() {
    let (sim, _) = start(|setup| {
        setup.add_fiber(FiberConfig::new(0, |ctx: &mut Context<'_>| {
            let before = ctx.timestamp();
            if ctx.timed_peek_input_head(1_000).is_none() {
                assert!(ctx.timestamp() >= before + 1_000);
                ctx.produce_static_string("timeout");
            }
        }))
    });

    let records = collect(&sim, 1, Duration::from_secs(2));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data, OutputData::StaticString("timeout"));
}

#[test]
fn test_timeout_correctly_cancelled() {
    let progress = Arc::new(AtomicUsize::new(0));
    let p = progress.clone();
    let (sim, _) = start(move |setup| {
        let p = p.clone();
        setup.add_fiber(FiberConfig::new(0, move |ctx: &mut Context<'_>| {
            assert!(ctx.timed_peek_input_head_match(&[0xAA], 20_000).is_some());
            ctx.drop_input_head();
            p.fetch_add(1, Ordering::SeqCst);

            // the read timer above must not end this wait
            ctx.wait(7, 0);
            p.fetch_add(1, Ordering::SeqCst);
        }))
    });

    run_until_idle(&sim);
    sim.write_bytes(0, &[0xAA]).unwrap();
    run_until_idle(&sim);
    assert_eq!(progress.load(Ordering::SeqCst), 1);

    // let the stale timer task fire
    drive(&sim, Duration::from_millis(60));
    assert_eq!(progress.load(Ordering::SeqCst), 1);
}

#[test]
fn test_timed_match_ignores_non_matching_input() {
    let result = Arc::new(AtomicUsize::new(0));
    let r = result.clone();
    let (sim, _) = start(move |setup| {
        let r = r.clone();
        setup.add_fiber(FiberConfig::new(0, move |ctx: &mut Context<'_>| {
            let got = ctx.timed_peek_input_head_match(&[0x55], 5_000).is_some();
            r.store(if got { 1 } else { 2 }, Ordering::SeqCst);
        }))
    });

    sim.write_bytes(0, &[0x01]).unwrap();
    sim.write_bytes(0, &[0x02]).unwrap();
    drive(&sim, Duration::from_millis(50));
    assert_eq!(result.load(Ordering::SeqCst), 2);
}

#[test]
fn test_delay_advances_fiber_time() {
    let elapsed = Arc::new(AtomicU64::new(0));
    let e = elapsed.clone();
    let (sim, _) = start(move |setup| {
        let e = e.clone();
        setup.add_fiber(FiberConfig::new(0, move |ctx: &mut Context<'_>| {
            let t0 = ctx.timestamp();
            ctx.delay(500);
            ctx.delay(250);
            e.store(ctx.timestamp() - t0, Ordering::SeqCst);
        }))
    });

    run_until_idle(&sim);
    assert_eq!(elapsed.load(Ordering::SeqCst), 750);
}

#[test]
fn test_try_peek_never_blocks() {
    let seen = Arc::new(AtomicUsize::new(usize::MAX));
    let s = seen.clone();
    let (sim, _) = start(move |setup| {
        let s = s.clone();
        setup.add_fiber(FiberConfig::new(0, move |ctx: &mut Context<'_>| {
            assert!(ctx.try_peek_input_head().is_none());
            let len = ctx.peek_input_head().len();
            assert_eq!(ctx.try_peek_input_head().map(<[u8]>::len), Some(len));
            s.store(len, Ordering::SeqCst);
        }))
    });

    run_until_idle(&sim);
    sim.write_bytes(0, b"hello").unwrap();
    run_until_idle(&sim);
    assert_eq!(seen.load(Ordering::SeqCst), 5);
}

#[test]
fn test_errors_and_strings_are_tagged() {
    let (sim, deallocs) = start(|setup| {
        setup.add_fiber(FiberConfig::new(0, |ctx: &mut Context<'_>| {
            ctx.produce_error(SimError::Simulation(42), "device fault");
            ctx.delay(10);
            ctx.produce_dynamic_string(format!("reg={:#x}", 0x1f));
        }))
    });

    let records = collect(&sim, 2, Duration::from_secs(1));
    assert_eq!(records.len(), 2);
    assert_eq!(
        records[0].data,
        OutputData::Error {
            code: SimError::Simulation(42),
            message: "device fault"
        }
    );
    assert_eq!(payloads(&records[1..]), vec![b"reg=0x1f".to_vec()]);

    release(&sim, records);
    assert_eq!(deallocs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_panicking_fiber_does_not_stop_group() {
    let (sim, _) = start(|setup| {
        setup.add_fiber(FiberConfig::new(0, |_ctx: &mut Context<'_>| panic!("broken model")))?;
        setup.add_fiber(responder(0xDD, 0xEE))
    });

    run_until_idle(&sim);
    sim.write_bytes(0, &[0xDD]).unwrap();
    run_until_idle(&sim);

    let records = sim.read(8, 100_000).unwrap();
    assert_eq!(payloads(&records), vec![vec![0xEE]]);
    release(&sim, records);
}

#[test]
fn test_setup_and_teardown_hooks() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let (sim, _) = start(move |setup| {
        let on_setup = c.clone();
        let on_teardown = c.clone();
        setup.add_fiber(
            FiberConfig::new(0, |ctx: &mut Context<'_>| ctx.yield_now())
                .with_setup(move || {
                    on_setup.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .with_teardown(move || {
                    on_teardown.fetch_add(10, Ordering::SeqCst);
                }),
        )
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    run_until_idle(&sim);
    sim.run_teardown().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 11);
}
