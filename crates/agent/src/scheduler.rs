//! Reconciliation scheduler: one tick a minute heartbeats and decides whether
//! to rebuild watches, revalidate them or poll.

use std::{future::Future, path::Path, pin::Pin, time::Duration};

use rand::Rng;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{context::AgentContext, poll::poll, settings::Intervals, watch::validate_watches};

/// What one tick should do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickPlan {
    pub clean_start: bool,
    pub validate: bool,
    /// Poll regardless of the heartbeat answer.
    pub poll_due: bool,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    intervals: Intervals,
    counter: u64,
}

fn divides(n: u64, every: u64) -> bool { every != 0 && n % every == 0 }

impl Scheduler {
    pub fn new(intervals: Intervals) -> Self { Self { intervals, counter: 0 } }

    pub fn counter(&self) -> u64 { self.counter }

    /// Advance one tick. A clean start resets the counter, which also makes a
    /// poll due.
    pub fn advance(&mut self) -> TickPlan {
        self.counter += 1;
        let mut plan = TickPlan::default();
        if divides(self.counter, self.intervals.clean_start) {
            plan.clean_start = true;
            self.counter = 0;
        } else if divides(self.counter, self.intervals.validate) {
            plan.validate = true;
        }
        plan.poll_due = self.counter == 0 || divides(self.counter, self.intervals.poll);
        plan
    }
}

pub fn touch_liveness(path: Option<&Path>) {
    let Some(path) = path else { return };
    if let Err(e) = std::fs::write(path, b"") {
        debug!(path = %path.display(), error = %e, "liveness touch failed");
    }
}

/// Uniform delay in `[0, max)`.
pub fn startup_delay(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}

/// Watch and poll work decided by one tick, run after its heartbeat.
async fn run_cycle(ctx: &AgentContext, plan: TickPlan) {
    if plan.clean_start {
        info!("running clean start");
        ctx.watches.remove_all_watches();
        validate_watches(ctx).await;
    } else if plan.validate {
        validate_watches(ctx).await;
    }
    if plan.poll_due {
        poll(ctx).await;
    }
}

/// Run one tick to completion. Nothing escapes: every failure is logged or
/// reported inside.
pub async fn tick(ctx: &AgentContext, mut plan: TickPlan) {
    touch_liveness(ctx.settings.liveness_file.as_deref());
    if ctx.heartbeat().await {
        info!("collector requested refresh");
        plan.poll_due = true;
    }
    run_cycle(ctx, plan).await;
}

impl TickPlan {
    fn is_idle(&self) -> bool { !(self.clean_start || self.validate || self.poll_due) }

    fn merge(&mut self, other: TickPlan) {
        self.clean_start |= other.clean_start;
        self.validate |= other.validate;
        self.poll_due |= other.poll_due;
    }
}

type Cycle<'a> = Pin<Box<dyn Future<Output = ()> + 'a>>;

/// Stagger, heartbeat, validate, then tick until `shutdown` resolves.
///
/// The liveness touch and heartbeat happen on every tick. Watch validation
/// and polls run as one in-flight cycle; work that comes due while a cycle is
/// still running is held and started on the first tick after it finishes.
pub async fn run<S>(ctx: &AgentContext, shutdown: S)
where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let intervals = ctx.settings.intervals;
    if !intervals.is_ordered() {
        warn!(
            clean_start = intervals.clean_start,
            poll = intervals.poll,
            validate = intervals.validate,
            "intervals should follow CLEAN_START_INTERVAL > POLL_INTERVAL > VALIDATE_INTERVAL"
        );
    }

    let delay = startup_delay(ctx.settings.start_delay_max);
    info!(delay_secs = delay.as_secs(), "staggering start");
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = &mut shutdown => return,
    }

    ctx.heartbeat().await;
    touch_liveness(ctx.settings.liveness_file.as_deref());
    validate_watches(ctx).await;

    let mut cycle: Option<Cycle<'_>> = Some(Box::pin(run_cycle(ctx, TickPlan { poll_due: true, ..TickPlan::default() })));
    let mut owed = TickPlan::default();
    let mut scheduler = Scheduler::new(intervals);
    let period = ctx.settings.tick;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let plan = scheduler.advance();
                info!(interval = scheduler.counter(), ?plan, "starting next interval");
                touch_liveness(ctx.settings.liveness_file.as_deref());
                owed.merge(plan);
                if ctx.heartbeat().await {
                    info!("collector requested refresh");
                    owed.poll_due = true;
                }
                if cycle.is_some() {
                    if !owed.is_idle() {
                        debug!(?owed, "previous cycle still running; deferring");
                    }
                } else if !owed.is_idle() {
                    cycle = Some(Box::pin(run_cycle(ctx, std::mem::take(&mut owed))));
                }
            }
            _ = async { if let Some(c) = cycle.as_mut() { c.await } }, if cycle.is_some() => {
                cycle = None;
            }
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
        }
    }
    drop(cycle);
    ctx.watches.remove_all_watches();
    ctx.sender.flush();
    ctx.sender.drain().await;
}
