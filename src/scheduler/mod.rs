// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Timers and the named-job scheduler.
//!
//! A [`Timer`] is a bare periodic source feeding one stream. The
//! [`Scheduler`] manages named jobs with interval, cron-field, or
//! one-shot triggers; its tick task runs on the bound event loop and
//! feeds job output into target streams.

use crate::bridge::ExecLoop;
use crate::errors::{StreamError, ValidationError};
use crate::graph::Stream;
use crate::observability::messages::{JobFailed, StructuredLog};
use crate::utils::locked;
use crate::Value;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_millis(50);

/// Periodic source: runs `f` every `interval` on the event loop and
/// emits the result into `target`; with no target the result is
/// dropped (fire-and-forget). Stops on [`Timer::stop`] or drop.
pub struct Timer {
    cancel: CancellationToken,
}

impl Timer {
    pub fn start<F>(exec: &ExecLoop, interval: Duration, f: F, target: Option<Stream>) -> Timer
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        exec.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let value = f();
                        if let Some(target) = &target {
                            if let Err(err) = target.emit(value) {
                                tracing::error!(error = %err, "timer emission failed");
                            }
                        }
                    }
                }
            }
        });
        Timer { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Allowed values per calendar field; `None` is a wildcard.
/// `weekday` counts from Sunday as 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CronFields {
    pub minute: Option<Vec<u32>>,
    pub hour: Option<Vec<u32>>,
    pub day: Option<Vec<u32>>,
    pub weekday: Option<Vec<u32>>,
}

fn field_matches(allowed: &Option<Vec<u32>>, value: u32) -> bool {
    allowed.as_ref().map_or(true, |list| list.contains(&value))
}

impl CronFields {
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        field_matches(&self.minute, at.minute())
            && field_matches(&self.hour, at.hour())
            && field_matches(&self.day, at.day())
            && field_matches(&self.weekday, at.weekday().num_days_from_sunday())
    }

    /// First minute boundary after `after` that matches, scanning at
    /// most one year ahead.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after)
            + ChronoDuration::minutes(1);
        for _ in 0..(366 * 24 * 60) {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += ChronoDuration::minutes(1);
        }
        None
    }
}

/// When a job fires.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Fixed spacing from the previous completion.
    Every(Duration),
    /// Calendar matching on minute boundaries.
    Cron(CronFields),
    /// Exactly once, then the job removes itself.
    Once(DateTime<Utc>),
}

type JobAction = Arc<dyn Fn() -> Value + Send + Sync>;

struct Job {
    trigger: Trigger,
    action: JobAction,
    target: Option<Stream>,
    enabled: bool,
    next_run: Option<DateTime<Utc>>,
}

fn initial_run(trigger: &Trigger, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        // An interval past the calendar's range never fires.
        Trigger::Every(interval) => ChronoDuration::from_std(*interval)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta)),
        Trigger::Cron(fields) => fields.next_after(now),
        Trigger::Once(at) => Some(*at),
    }
}

struct SchedulerInner {
    jobs: Mutex<HashMap<String, Job>>,
    cancel: CancellationToken,
}

/// Named-job scheduler driven by a tick task on an event loop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn start(exec: &ExecLoop) -> Scheduler {
        let inner = Arc::new(SchedulerInner {
            jobs: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        let weak = Arc::downgrade(&inner);
        let token = inner.cancel.clone();
        exec.spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        run_due_jobs(&inner);
                    }
                }
            }
        });
        Scheduler { inner }
    }

    /// Registers a job under a unique name.
    pub fn add_job<F>(
        &self,
        name: impl Into<String>,
        trigger: Trigger,
        action: F,
        target: Option<Stream>,
    ) -> Result<(), StreamError>
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        let name = name.into();
        let mut jobs = locked(&self.inner.jobs);
        if jobs.contains_key(&name) {
            return Err(ValidationError::DuplicateJob { name }.into());
        }
        let next_run = initial_run(&trigger, Utc::now());
        jobs.insert(
            name,
            Job {
                trigger,
                action: Arc::new(action),
                target,
                enabled: true,
                next_run,
            },
        );
        Ok(())
    }

    pub fn remove_job(&self, name: &str) -> bool {
        locked(&self.inner.jobs).remove(name).is_some()
    }

    pub fn enable(&self, name: &str) -> bool {
        set_enabled(&self.inner.jobs, name, true)
    }

    pub fn disable(&self, name: &str) -> bool {
        set_enabled(&self.inner.jobs, name, false)
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = locked(&self.inner.jobs).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }
}

fn set_enabled(jobs: &Mutex<HashMap<String, Job>>, name: &str, enabled: bool) -> bool {
    match locked(jobs).get_mut(name) {
        Some(job) => {
            job.enabled = enabled;
            // Re-arm so a long-disabled interval job doesn't fire
            // immediately on enable.
            if enabled {
                job.next_run = initial_run(&job.trigger, Utc::now());
            }
            true
        }
        None => false,
    }
}

/// One scheduler tick: reschedule due jobs under the lock, run their
/// actions outside it.
fn run_due_jobs(inner: &SchedulerInner) {
    let now = Utc::now();
    let mut due: Vec<(String, JobAction, Option<Stream>)> = Vec::new();
    {
        let mut jobs = locked(&inner.jobs);
        let mut finished = Vec::new();
        for (name, job) in jobs.iter_mut() {
            if !job.enabled {
                continue;
            }
            let Some(next) = job.next_run else { continue };
            if next > now {
                continue;
            }
            due.push((name.clone(), job.action.clone(), job.target.clone()));
            match &job.trigger {
                Trigger::Every(interval) => {
                    job.next_run = ChronoDuration::from_std(*interval)
                        .ok()
                        .and_then(|delta| now.checked_add_signed(delta));
                }
                Trigger::Cron(fields) => {
                    job.next_run = fields.next_after(now);
                }
                Trigger::Once(_) => {
                    finished.push(name.clone());
                }
            }
        }
        for name in finished {
            jobs.remove(&name);
        }
    }

    for (name, action, target) in due {
        let value = action();
        if let Some(target) = target {
            if let Err(err) = target.emit(value) {
                JobFailed {
                    job: &name,
                    error: &err,
                }
                .log();
            }
        }
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Instant;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn cron_fields_match_calendar_components() {
        let nine_thirty = CronFields {
            minute: Some(vec![30]),
            hour: Some(vec![9]),
            ..CronFields::default()
        };
        assert!(nine_thirty.matches(at(2026, 8, 30, 9, 30)));
        assert!(!nine_thirty.matches(at(2026, 8, 30, 9, 31)));
        assert!(!nine_thirty.matches(at(2026, 8, 30, 10, 30)));

        // 2026-08-30 is a Sunday.
        let sundays = CronFields {
            weekday: Some(vec![0]),
            ..CronFields::default()
        };
        assert!(sundays.matches(at(2026, 8, 30, 12, 0)));
        assert!(!sundays.matches(at(2026, 8, 31, 12, 0)));
    }

    #[test]
    fn next_after_finds_the_following_match() {
        let hourly = CronFields {
            minute: Some(vec![0]),
            ..CronFields::default()
        };
        let next = hourly.next_after(at(2026, 8, 30, 9, 30)).unwrap();
        assert_eq!(next, at(2026, 8, 30, 10, 0));

        // Already on a boundary: the next match is strictly later.
        let next = hourly.next_after(at(2026, 8, 30, 9, 0)).unwrap();
        assert_eq!(next, at(2026, 8, 30, 10, 0));
    }

    #[test]
    fn impossible_cron_fields_never_fire() {
        let impossible = CronFields {
            day: Some(vec![32]),
            ..CronFields::default()
        };
        assert!(impossible.next_after(at(2026, 1, 1, 0, 0)).is_none());
    }

    #[test]
    fn duplicate_job_names_are_rejected() {
        let exec = ExecLoop::background().unwrap();
        let scheduler = Scheduler::start(&exec);
        scheduler
            .add_job("tick", Trigger::Every(Duration::from_secs(60)), || json!(1), None)
            .unwrap();
        let result = scheduler.add_job(
            "tick",
            Trigger::Every(Duration::from_secs(60)),
            || json!(2),
            None,
        );
        assert!(matches!(
            result,
            Err(StreamError::Validation(ValidationError::DuplicateJob { .. }))
        ));
    }

    #[test]
    fn interval_jobs_feed_their_target_stream() {
        let exec = ExecLoop::background().unwrap();
        let scheduler = Scheduler::start(&exec);
        let target = Stream::new();
        let seen = target.to_list();

        scheduler
            .add_job(
                "pulse",
                Trigger::Every(Duration::from_millis(40)),
                || json!("beat"),
                Some(target),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while seen.len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(seen.len() >= 2);

        scheduler.disable("pulse");
        std::thread::sleep(Duration::from_millis(150));
        let settled = seen.len();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(seen.len(), settled);
    }

    #[test]
    fn one_shot_jobs_remove_themselves_after_firing() {
        let exec = ExecLoop::background().unwrap();
        let scheduler = Scheduler::start(&exec);
        let target = Stream::new();
        let seen = target.to_list();

        scheduler
            .add_job(
                "once",
                Trigger::Once(Utc::now()),
                || json!("now"),
                Some(target),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while scheduler.job_names().contains(&"once".to_string()) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(scheduler.job_names().is_empty());
        assert_eq!(seen.snapshot(), vec![json!("now")]);
    }

    #[test]
    fn timer_without_a_target_still_runs_its_callback() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let exec = ExecLoop::background().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let _timer = Timer::start(
            &exec,
            Duration::from_millis(30),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                json!(null)
            },
            None,
        );

        let deadline = Instant::now() + Duration::from_secs(3);
        while calls.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn absurd_intervals_are_accepted_but_never_fire() {
        let exec = ExecLoop::background().unwrap();
        let scheduler = Scheduler::start(&exec);
        scheduler
            .add_job("eon", Trigger::Every(Duration::MAX), || json!(1), None)
            .unwrap();
        assert_eq!(scheduler.job_names(), vec!["eon".to_string()]);
        assert_eq!(initial_run(&Trigger::Every(Duration::MAX), Utc::now()), None);
    }

    #[test]
    fn timer_emits_until_stopped() {
        let exec = ExecLoop::background().unwrap();
        let source = Stream::new();
        let seen = source.to_list();
        let timer = Timer::start(&exec, Duration::from_millis(30), || json!("tick"), Some(source));

        let deadline = Instant::now() + Duration::from_secs(3);
        while seen.len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(seen.len() >= 3);

        timer.stop();
        std::thread::sleep(Duration::from_millis(100));
        let settled = seen.len();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(seen.len(), settled);
    }
}
