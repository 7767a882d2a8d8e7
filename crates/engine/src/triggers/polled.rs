//! Polling triggers: cpu, commit memory, thread count, file descriptors,
//! and the timer fallback. One thread per active trigger; each loop sleeps
//! against the target's quit event, samples `/proc`, and hands off to the
//! dump writer once its predicate has held for the configured window.

use crate::dump::{CoreDumpWriter, DumpKind};
use crate::error::Error;
use crate::proc::{TargetProcess, is_gone, maximum_cpu};
use crate::sync::WaitOutcome;
use crate::target::TargetState;
use crate::triggers::managed::ManagedDumper;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Common polled-trigger loop. `predicate` samples the target; once it has
/// been continuously true for the consecutive-seconds window a dump is
/// requested. With `snooze`, each dump restarts the hold window; without
/// it, a predicate that stays true may fire again on the very next sample.
fn run_polled<P, A>(
    target: &Arc<TargetState>,
    managed: &Arc<dyn ManagedDumper>,
    kind: DumpKind,
    snooze: bool,
    mut predicate: P,
    mut after_dump: A,
) where
    P: FnMut(&TargetProcess) -> Result<bool, Error>,
    A: FnMut(&TargetState),
{
    if target.start_monitoring.wait_quit_aware(&target.quit, None) != WaitOutcome::Signaled {
        return;
    }

    let process = TargetProcess::new(target.pid());
    let interval = target.config().polling_interval();
    let hold = target.config().threshold();
    let mut held_since: Option<Instant> = None;

    loop {
        if target.wait_tick(interval) {
            return;
        }

        let firing = match predicate(&process) {
            Ok(firing) => firing,
            Err(err) if is_gone(&err) => {
                debug!(pid = target.pid(), %kind, "target disappeared");
                return;
            }
            Err(err) => {
                warn!(pid = target.pid(), %kind, %err, "sample failed");
                continue;
            }
        };

        if !firing {
            held_since = None;
            continue;
        }

        let since = *held_since.get_or_insert_with(Instant::now);
        if since.elapsed() < hold {
            continue;
        }

        match CoreDumpWriter::new(Arc::clone(target), kind).write(managed.as_ref()) {
            Ok(Some(_)) => after_dump(target),
            Ok(None) => {}
            Err(err) => {
                // Environmental: no future attempt can succeed either.
                error!(pid = target.pid(), %err, "dump pipeline failed");
                target.record_failure(err);
                target.quit.set();
                return;
            }
        }

        if snooze {
            // The predicate must hold for another full window before the
            // next dump.
            held_since = None;
        }
        if target.quit.is_set() {
            return;
        }
    }
}

pub fn cpu_monitor(target: Arc<TargetState>, managed: Arc<dyn ManagedDumper>) {
    let Some(trigger) = target.config().cpu else {
        return;
    };
    let limit = maximum_cpu();
    if trigger.percent > limit {
        warn!(
            threshold = trigger.percent,
            limit, "CPU threshold exceeds what this machine can reach"
        );
    }

    let ticks_per_second = procfs::ticks_per_second().max(1);
    let mut previous: Option<(u64, Instant)> = None;
    let snooze = target.config().snooze_cpu;
    let state = Arc::clone(&target);

    run_polled(
        &state,
        &managed,
        DumpKind::Cpu,
        snooze,
        move |process| {
            let ticks = process.cpu_ticks()?;
            let now = Instant::now();
            let Some((previous_ticks, sampled_at)) = previous.replace((ticks, now)) else {
                // First sample only primes the delta.
                return Ok(false);
            };
            let elapsed = now.duration_since(sampled_at).as_secs_f64();
            if elapsed <= 0.0 {
                return Ok(false);
            }
            let usage = ticks.saturating_sub(previous_ticks) as f64
                / ticks_per_second as f64
                / elapsed
                * 100.0;
            trace!(usage, "cpu sample");
            Ok(if trigger.below {
                usage < f64::from(trigger.percent)
            } else {
                usage >= f64::from(trigger.percent)
            })
        },
        |_| {},
    );
}

pub fn memory_monitor(target: Arc<TargetState>, managed: Arc<dyn ManagedDumper>) {
    let Some(trigger) = target.config().memory.clone() else {
        return;
    };
    let snooze = target.config().snooze_memory;
    let state = Arc::clone(&target);
    let thresholds = trigger.thresholds_mb;

    run_polled(
        &target,
        &managed,
        DumpKind::Commit,
        snooze,
        move |process| {
            // The i-th dump uses the i-th threshold.
            let index = state.memory_threshold_index().min(thresholds.len() - 1);
            let threshold = thresholds[index];
            let rss = process.rss_mb()?;
            trace!(rss, threshold, "memory sample");
            Ok(if trigger.below {
                rss < threshold
            } else {
                rss >= threshold
            })
        },
        |state| state.advance_memory_threshold(),
    );
}

pub fn thread_monitor(target: Arc<TargetState>, managed: Arc<dyn ManagedDumper>) {
    let Some(threshold) = target.config().thread_count else {
        return;
    };
    run_polled(
        &target,
        &managed,
        DumpKind::Thread,
        false,
        move |process| {
            let count = process.thread_count()?;
            trace!(count, threshold, "thread sample");
            Ok(count >= threshold)
        },
        |_| {},
    );
}

pub fn fd_monitor(target: Arc<TargetState>, managed: Arc<dyn ManagedDumper>) {
    let Some(threshold) = target.config().fd_count else {
        return;
    };
    run_polled(
        &target,
        &managed,
        DumpKind::FileDesc,
        false,
        move |process| {
            let count = process.fd_count()?;
            trace!(count, threshold, "fd sample");
            Ok(count >= threshold)
        },
        |_| {},
    );
}

/// The fallback trigger: a dump every consecutive-seconds period, no
/// predicate. With snooze (the default) the period restarts once a dump
/// completes; without it the time a dump took counts against the next
/// period.
pub fn timer_monitor(target: Arc<TargetState>, managed: Arc<dyn ManagedDumper>) {
    if !target.config().timer {
        return;
    }
    if target.start_monitoring.wait_quit_aware(&target.quit, None) != WaitOutcome::Signaled {
        return;
    }

    let snooze = target.config().snooze_timer;
    let period = target.config().threshold();
    let process = TargetProcess::new(target.pid());
    let mut next_wait = period;

    loop {
        if target.wait_tick(next_wait) {
            return;
        }
        if !process.alive() {
            debug!(pid = target.pid(), "target disappeared");
            return;
        }
        let fired_at = Instant::now();
        match CoreDumpWriter::new(Arc::clone(&target), DumpKind::Time).write(managed.as_ref()) {
            Ok(_) => {}
            Err(err) => {
                error!(pid = target.pid(), %err, "dump pipeline failed");
                target.record_failure(err);
                target.quit.set();
                return;
            }
        }
        if target.quit.is_set() {
            return;
        }
        next_wait = if snooze {
            period
        } else {
            period.saturating_sub(fired_at.elapsed())
        };
    }
}
