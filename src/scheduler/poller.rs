//! The polling loop.
//!
//! Two timers say until when each queue is known to be empty. While both
//! queues are ready the poller picks review-branch work with probability
//! `secondary_proportion`, so a busy primary branch cannot starve CLs (and vice
//! versa). When both queues are empty it sleeps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::config::DiffCalculatorConfig;
use crate::error::PollError;
use crate::metrics::BusyFlag;
use crate::types::beginning_of_time;

use super::{to_chrono, WorkOutcome, WorkRunner, WorkSource};

/// Back-off and source-selection settings of a [`Poller`].
#[derive(Debug, Clone)]
pub struct PollerSettings {
    /// How long a queue is left alone after it reported no work.
    pub sleep_interval: Duration,
    /// Probability of choosing secondary work when both queues are ready.
    pub secondary_proportion: f64,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            sleep_interval: Duration::from_secs(10),
            secondary_proportion: 0.8,
        }
    }
}

impl From<&DiffCalculatorConfig> for PollerSettings {
    fn from(config: &DiffCalculatorConfig) -> Self {
        Self {
            sleep_interval: config.scheduler.sleep_interval(),
            secondary_proportion: config.scheduler.secondary_proportion,
        }
    }
}

/// Sequential claim loop of one worker process.
pub struct Poller<W: WorkRunner> {
    runner: W,
    clock: Arc<dyn Clock>,
    busy: BusyFlag,
    rng: ChaCha8Rng,
    settings: PollerSettings,
    primary_sleep_until: DateTime<Utc>,
    secondary_sleep_until: DateTime<Utc>,
}

impl<W: WorkRunner> Poller<W> {
    pub fn new(runner: W, clock: Arc<dyn Clock>, busy: BusyFlag, settings: PollerSettings) -> Self {
        Self {
            runner,
            clock,
            busy,
            rng: ChaCha8Rng::from_rng(&mut rand::rng()),
            settings,
            primary_sleep_until: beginning_of_time(),
            secondary_sleep_until: beginning_of_time(),
        }
    }

    /// Replaces the random source, e.g. with a seeded one.
    pub fn with_rng(mut self, rng: ChaCha8Rng) -> Self {
        self.rng = rng;
        self
    }

    /// Until when `source` is skipped.
    pub fn sleep_until(&self, source: WorkSource) -> DateTime<Utc> {
        match source {
            WorkSource::Primary => self.primary_sleep_until,
            WorkSource::Secondary => self.secondary_sleep_until,
        }
    }

    /// Picks the queue to try next, or `None` if both are backing off.
    pub fn next_source(&mut self, now: DateTime<Utc>) -> Option<WorkSource> {
        let primary_ready = self.primary_sleep_until <= now;
        let secondary_ready = self.secondary_sleep_until <= now;

        match (primary_ready, secondary_ready) {
            (false, false) => None,
            (true, true) => {
                if self.rng.random::<f64>() < self.settings.secondary_proportion {
                    Some(WorkSource::Secondary)
                } else {
                    Some(WorkSource::Primary)
                }
            }
            (true, false) => Some(WorkSource::Primary),
            (false, true) => Some(WorkSource::Secondary),
        }
    }

    /// Runs one unit of work from `source` and updates its timer.
    ///
    /// Errors are logged and leave the timer alone, as does finding work.
    pub async fn attempt(&mut self, source: WorkSource) {
        let result = match source {
            WorkSource::Primary => self.runner.run_primary().await,
            WorkSource::Secondary => self.runner.run_secondary().await,
        };

        match result {
            Ok(WorkOutcome::Computed) => {}
            Ok(WorkOutcome::NoWork) => {
                let until = self
                    .clock
                    .now()
                    .checked_add_signed(to_chrono(self.settings.sleep_interval))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                debug!(source = %source, until = %until, "No work, backing off");
                match source {
                    WorkSource::Primary => self.primary_sleep_until = until,
                    WorkSource::Secondary => self.secondary_sleep_until = until,
                }
            }
            Err(e) => {
                error!(source = %source, error = %e, "Error computing diffs");
            }
        }
    }

    /// Polls until `shutdown` fires, which is the only way out.
    ///
    /// An attempt in flight when the token fires is dropped; its lease runs
    /// out and another worker retries it.
    pub async fn run(&mut self, shutdown: &CancellationToken) -> Result<(), PollError> {
        info!(
            sleep_interval_secs = self.settings.sleep_interval.as_secs(),
            secondary_proportion = self.settings.secondary_proportion,
            "Polling for diff work"
        );
        self.busy.set(true);

        loop {
            if shutdown.is_cancelled() {
                return Err(PollError::Cancelled);
            }

            let now = self.clock.now();
            match self.next_source(now) {
                None => {
                    info!("No diffs to calculate, sleeping");
                    self.busy.set(false);
                    tokio::select! {
                        _ = shutdown.cancelled() => return Err(PollError::Cancelled),
                        _ = tokio::time::sleep(self.settings.sleep_interval) => {}
                    }
                }
                Some(source) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return Err(PollError::Cancelled),
                        _ = self.attempt(source) => {}
                    }
                }
            }
            self.busy.set(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::error::{ClaimError, DiffError};
    use crate::types::GroupingId;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Scripted = Mutex<VecDeque<Result<WorkOutcome, ClaimError>>>;

    /// Replays scripted outcomes; an exhausted script means no work.
    #[derive(Default)]
    struct ScriptedRunner {
        primary: Scripted,
        secondary: Scripted,
        primary_calls: AtomicUsize,
        secondary_calls: AtomicUsize,
    }

    impl ScriptedRunner {
        fn next(script: &Scripted) -> Result<WorkOutcome, ClaimError> {
            script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(WorkOutcome::NoWork))
        }
    }

    #[async_trait]
    impl WorkRunner for ScriptedRunner {
        async fn run_primary(&self) -> Result<WorkOutcome, ClaimError> {
            self.primary_calls.fetch_add(1, Ordering::SeqCst);
            Self::next(&self.primary)
        }

        async fn run_secondary(&self) -> Result<WorkOutcome, ClaimError> {
            self.secondary_calls.fetch_add(1, Ordering::SeqCst);
            Self::next(&self.secondary)
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn poller(runner: ScriptedRunner, clock: Arc<FixedClock>) -> Poller<ScriptedRunner> {
        Poller::new(runner, clock, BusyFlag::new(), PollerSettings::default())
            .with_rng(ChaCha8Rng::seed_from_u64(42))
    }

    #[test]
    fn test_timers_start_in_the_past() {
        let poller = poller(ScriptedRunner::default(), Arc::new(FixedClock::new(start())));
        assert!(poller.sleep_until(WorkSource::Primary) < start());
        assert!(poller.sleep_until(WorkSource::Secondary) < start());
    }

    #[test]
    fn test_secondary_proportion() {
        let mut poller = poller(ScriptedRunner::default(), Arc::new(FixedClock::new(start())));
        let draws = 10_000;
        let secondary = (0..draws)
            .filter(|_| poller.next_source(start()) == Some(WorkSource::Secondary))
            .count();
        let ratio = secondary as f64 / draws as f64;
        assert!((0.77..=0.83).contains(&ratio), "ratio was {ratio}");
    }

    #[tokio::test]
    async fn test_no_work_backs_off_that_source_only() {
        let clock = Arc::new(FixedClock::new(start()));
        let mut poller = poller(ScriptedRunner::default(), clock.clone());

        poller.attempt(WorkSource::Primary).await;
        assert_eq!(
            poller.sleep_until(WorkSource::Primary),
            start() + chrono::Duration::seconds(10)
        );
        assert_eq!(poller.next_source(start()), Some(WorkSource::Secondary));

        poller.attempt(WorkSource::Secondary).await;
        assert_eq!(poller.next_source(start()), None);

        // At exactly the wake-up time a source is eligible again.
        clock.advance(chrono::Duration::seconds(10));
        assert!(poller.next_source(clock.now()).is_some());
    }

    #[tokio::test]
    async fn test_huge_sleep_interval_saturates() {
        let settings = PollerSettings {
            sleep_interval: Duration::from_secs(u64::MAX),
            ..Default::default()
        };
        let mut poller = Poller::new(
            ScriptedRunner::default(),
            Arc::new(FixedClock::new(start())),
            BusyFlag::new(),
            settings,
        );

        poller.attempt(WorkSource::Primary).await;
        assert_eq!(poller.sleep_until(WorkSource::Primary), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_work_found_keeps_timer() {
        let runner = ScriptedRunner::default();
        runner
            .primary
            .lock()
            .unwrap()
            .push_back(Ok(WorkOutcome::Computed));
        let mut poller = poller(runner, Arc::new(FixedClock::new(start())));

        poller.attempt(WorkSource::Primary).await;
        assert!(poller.sleep_until(WorkSource::Primary) < start());
    }

    #[tokio::test]
    async fn test_errors_keep_timer() {
        let runner = ScriptedRunner::default();
        runner.secondary.lock().unwrap().push_back(Err(ClaimError::Diff {
            grouping: GroupingId::new([1; 16]),
            source: DiffError::Calculation("boom".to_string()),
        }));
        let mut poller = poller(runner, Arc::new(FixedClock::new(start())));

        poller.attempt(WorkSource::Secondary).await;
        assert!(poller.sleep_until(WorkSource::Secondary) < start());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let clock = Arc::new(FixedClock::new(start()));
        let busy = BusyFlag::new();
        let settings = PollerSettings {
            sleep_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let mut poller = Poller::new(ScriptedRunner::default(), clock, busy.clone(), settings);

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let result = poller.run(&shutdown).await;
        assert!(matches!(result, Err(PollError::Cancelled)));
        // Both queues were tried once, then the frozen clock kept them backing off.
        assert_eq!(poller.runner.primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(poller.runner.secondary_calls.load(Ordering::SeqCst), 1);
        assert!(!busy.is_busy());
    }

    #[tokio::test]
    async fn test_run_returns_immediately_when_already_cancelled() {
        let mut poller = poller(ScriptedRunner::default(), Arc::new(FixedClock::new(start())));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert!(matches!(poller.run(&shutdown).await, Err(PollError::Cancelled)));
        assert_eq!(poller.runner.primary_calls.load(Ordering::SeqCst), 0);
    }
}
