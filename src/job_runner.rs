//! Wall-clock job scheduling.
//!
//! A runner is built from a [`JobRunnerConfig`] and owns a single background
//! task once started. Offsets are minutes past the hour; it is up to the
//! caller to space them further apart than the job takes to run. Jobs that
//! are allowed to overlap belong in separate runners, which is why every data
//! source gets its own.

use crate::config::JobRunnerConfig;
use chrono::Timelike;
use futures::future::{BoxFuture, FutureExt};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

pub type JobCallback = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
type MinuteClock = Arc<dyn Fn() -> u32 + Send + Sync>;

const MINUTES_PER_HOUR: u32 = 60;
const DEFAULT_RANDOM_SPREAD: u32 = 5;

pub enum JobRunner {
    Offset(OffsetJobRunner),
    Random(RandomJobRunner),
}

/// Picks the policy from the shape of the config: explicit offsets win, then
/// random bounds, then a fixed interval. Anything else is an empty offset
/// runner that never fires.
pub fn new_job_runner<F, Fut>(name: &str, config: &JobRunnerConfig, callback: F) -> JobRunner
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let callback: JobCallback = Box::new(move || callback().boxed());

    if !config.offsets.is_empty() {
        return JobRunner::Offset(OffsetJobRunner::new(
            name,
            normalize_offsets(&config.offsets),
            callback,
        ));
    }

    if config.rand_max > 0 {
        return JobRunner::Random(RandomJobRunner::new(
            name,
            config.rand_min,
            config.rand_max,
            callback,
        ));
    }

    if config.every_interval > 0 {
        return JobRunner::Offset(OffsetJobRunner::new(
            name,
            interval_offsets(config.every_start, config.every_interval),
            callback,
        ));
    }

    JobRunner::Offset(OffsetJobRunner::new(name, Vec::new(), callback))
}

impl JobRunner {
    /// Starts the background task. Returns `None` when there is nothing to run.
    pub fn run(self) -> Option<JoinHandle<()>> {
        match self {
            JobRunner::Offset(runner) => runner.run(),
            JobRunner::Random(runner) => Some(runner.run()),
        }
    }
}

/// Drops anything outside `[0, 60)`, then sorts and dedups.
pub fn normalize_offsets(raw: &[i32]) -> Vec<u32> {
    let mut offsets: Vec<u32> = raw
        .iter()
        .filter_map(|&offset| u32::try_from(offset).ok())
        .filter(|&offset| offset < MINUTES_PER_HOUR)
        .collect();
    offsets.sort_unstable();
    offsets.dedup();
    offsets
}

/// `start, start + interval, ...` below 60. An interval that would not fit
/// even once after `start` is ignored and only `start` is kept.
pub fn interval_offsets(start: i32, interval: i32) -> Vec<u32> {
    let start = u32::try_from(start)
        .ok()
        .filter(|&s| s < MINUTES_PER_HOUR)
        .unwrap_or(0);

    let interval = u32::try_from(interval).unwrap_or(0);
    if interval == 0 || start + interval > MINUTES_PER_HOUR {
        return vec![start];
    }

    (start..MINUTES_PER_HOUR).step_by(interval as usize).collect()
}

/// Index of the first offset at or after `minute`, wrapping to the first
/// offset of the next hour.
fn first_index(offsets: &[u32], minute: u32) -> usize {
    offsets
        .iter()
        .position(|&offset| offset >= minute)
        .unwrap_or(0)
}

/// Whole minutes to wait for `offset`. An offset equal to the current minute
/// is the next hour's, so this is always in `1..=60`.
fn minutes_until(offset: u32, minute: u32) -> u32 {
    let delay = offset as i64 - minute as i64;
    if delay <= 0 {
        (delay + MINUTES_PER_HOUR as i64) as u32
    } else {
        delay as u32
    }
}

fn wall_clock_minute() -> u32 {
    chrono::Local::now().minute()
}

fn minutes(count: u32) -> Duration {
    Duration::from_secs(u64::from(count) * 60)
}

pub struct OffsetJobRunner {
    name: String,
    offsets: Vec<u32>,
    callback: JobCallback,
    clock: MinuteClock,
}

impl OffsetJobRunner {
    fn new(name: &str, offsets: Vec<u32>, callback: JobCallback) -> Self {
        Self {
            name: name.to_string(),
            offsets,
            callback,
            clock: Arc::new(wall_clock_minute),
        }
    }

    fn run(self) -> Option<JoinHandle<()>> {
        if self.offsets.is_empty() {
            debug!("job: {}: no work", self.name);
            return None;
        }

        debug!("job: {}: offsets {:?}", self.name, self.offsets);
        Some(tokio::spawn(self.run_loop()))
    }

    async fn run_loop(self) {
        let mut minute = (self.clock)();
        let mut idx = first_index(&self.offsets, minute);

        info!("job: {}: first is {}", self.name, self.offsets[idx]);

        loop {
            let delay = minutes_until(self.offsets[idx], minute);
            debug!("job: offset: {}: sleeping {} minutes", self.name, delay);
            sleep(minutes(delay)).await;

            // No check that we actually woke up at the right minute; seconds
            // are not tracked, so firings drift by up to a minute.
            (self.callback)().await;

            idx = (idx + 1) % self.offsets.len();
            minute = (self.clock)();
        }
    }
}

pub struct RandomJobRunner {
    name: String,
    fixed: u32,
    random: u32,
    callback: JobCallback,
}

impl RandomJobRunner {
    fn new(name: &str, rand_min: i32, rand_max: i32, callback: JobCallback) -> Self {
        let fixed = rand_min.max(0);
        let random = rand_max - fixed;
        let random = if random < 0 {
            DEFAULT_RANDOM_SPREAD
        } else {
            random as u32
        };

        Self {
            name: name.to_string(),
            fixed: fixed as u32,
            random,
            callback,
        }
    }

    fn next_delay(&self) -> u32 {
        let mut delay = self.fixed;
        if self.random > 0 {
            delay += rand::thread_rng().gen_range(0..self.random);
        }
        delay.max(1)
    }

    fn run(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let delay = self.next_delay();
                debug!("job: random: {}: sleeping {} minutes", self.name, delay);
                sleep(minutes(delay)).await;

                (self.callback)().await;
            }
        })
    }
}
