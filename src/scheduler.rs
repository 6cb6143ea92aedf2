//! Fixed-rate decision loop on the consumer thread.

use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::feature_extractor::FeatureExtractor;
use crate::fusion::{ClassifierFusion, FusionOutcome};
use crate::sample_queue::SampleConsumer;
use crate::shutdown::Shutdown;
use crate::transport::DecisionSink;
use crate::window_buffer::SlidingWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// Waiting for the next tick
    Idle,
    /// Draining one step from the queue
    Collecting,
    /// Window full, features and classifiers running
    Ready,
    /// Decision handed to the sink
    Dispatched,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub ticks: u64,
    pub published: u64,
    pub underflow_skips: u64,
    pub warmup_skips: u64,
    pub missed_ticks: u64,
    pub classifier_errors: u64,
    pub publish_errors: u64,
}

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleOutcome {
    /// Fewer than one step of samples queued; nothing consumed
    Underflow,
    /// Step consumed but the window is not full yet
    WarmingUp,
    Published {
        fusion: FusionOutcome,
        reference_label: Option<f64>,
    },
    ClassifierFailed,
}

/// Advances `next` by one period. When that still leaves it more than a period behind
/// `now`, whole periods are skipped (keeping the phase); returns the skipped count.
pub fn advance_tick(next: Instant, now: Instant, period: Duration) -> (Instant, u32) {
    let next = next + period;
    let late = now.saturating_duration_since(next);
    if late <= period || period.is_zero() {
        return (next, 0);
    }
    let missed = (late.as_nanos() / period.as_nanos()) as u32;
    (next + period * missed, missed)
}

pub struct CycleScheduler {
    window: SlidingWindow,
    extractor: FeatureExtractor,
    fusion: ClassifierFusion,
    sink: Box<dyn DecisionSink>,
    step_size: usize,
    period: Duration,
    poll_interval: Duration,
    state: CycleState,
    stats: CycleStats,
}

impl CycleScheduler {
    pub fn new(
        config: &PipelineConfig,
        fusion: ClassifierFusion,
        sink: Box<dyn DecisionSink>,
    ) -> Self {
        Self {
            window: SlidingWindow::new(config.window.size),
            extractor: config.feature_extractor(),
            fusion,
            sink,
            step_size: config.step_size(),
            period: config.period(),
            poll_interval: config.poll_interval(),
            state: CycleState::Idle,
            stats: CycleStats::default(),
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn stats(&self) -> CycleStats {
        self.stats
    }

    /// Runs one cycle immediately, ignoring the clock
    pub fn tick(&mut self, queue: &SampleConsumer) -> CycleOutcome {
        self.state = CycleState::Collecting;
        let Some(batch) = queue.try_pop_batch(self.step_size) else {
            self.state = CycleState::Idle;
            return CycleOutcome::Underflow;
        };
        self.stats.ticks += 1;

        let started = Instant::now();
        self.window.push_batch(batch);
        let reference_label = self.window.reference_label();
        let Some(window) = self.window.view() else {
            self.stats.warmup_skips += 1;
            self.state = CycleState::Idle;
            return CycleOutcome::WarmingUp;
        };

        self.state = CycleState::Ready;
        let mut cycle = self.extractor.cycle(window);
        let result = self.fusion.classify_cycle(&mut cycle);
        drop(cycle);

        let fusion = match result {
            Ok(fusion) => fusion,
            Err(e) => {
                error!(error = %e, "classification failed, skipping cycle");
                self.stats.classifier_errors += 1;
                self.state = CycleState::Idle;
                return CycleOutcome::ClassifierFailed;
            }
        };

        self.state = CycleState::Dispatched;
        match self.sink.publish(fusion.decision) {
            Ok(()) => self.stats.published += 1,
            Err(e) => {
                warn!(error = %e, "failed to publish decision");
                self.stats.publish_errors += 1;
            }
        }
        debug!(
            decision = %fusion.decision,
            pre_fog = ?fusion.pre_fog,
            fog = ?fusion.fog,
            reference = ?reference_label,
            elapsed_us = started.elapsed().as_micros() as u64,
            "cycle"
        );

        self.state = CycleState::Idle;
        CycleOutcome::Published {
            fusion,
            reference_label,
        }
    }

    /// Ticks at `test_rate` until shutdown.
    ///
    /// A due tick with less than one step queued stays due and is retried shortly
    /// after; the tick only moves once a step has been consumed.
    pub fn run(&mut self, queue: &SampleConsumer, shutdown: &Shutdown) -> CycleStats {
        let retry = (self.period / 10)
            .max(Duration::from_millis(1))
            .min(self.poll_interval);
        let mut next_tick = Instant::now();
        let mut starved = false;

        info!(
            step = self.step_size,
            period_ms = self.period.as_millis() as u64,
            window = self.window.capacity(),
            "cycle scheduler started"
        );

        while !shutdown.is_triggered() {
            let now = Instant::now();
            let wait = if now < next_tick {
                (next_tick - now).min(self.poll_interval)
            } else {
                match self.tick(queue) {
                    CycleOutcome::Underflow => {
                        if !starved {
                            self.stats.underflow_skips += 1;
                            starved = true;
                        }
                        retry
                    }
                    _ => {
                        starved = false;
                        let (next, missed) = advance_tick(next_tick, Instant::now(), self.period);
                        if missed > 0 {
                            debug!(missed, "scheduler overrun, skipping ticks");
                            self.stats.missed_ticks += u64::from(missed);
                        }
                        next_tick = next;
                        continue;
                    }
                }
            };

            if shutdown.wait_timeout(wait) {
                break;
            }
        }

        info!(stats = ?self.stats, "cycle scheduler stopped");
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::LabelMap;
    use crate::fusion::tests::fixed_stage;
    use crate::sample_queue::sample_queue;
    use crate::schema::{ChannelLayout, FeatureSchema, FeatureSpec};
    use crate::transport::channel_sink;
    use crate::types::{Decision, RawSample};
    use crossbeam_channel::Receiver;

    fn small_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.window.size = 10;
        config.layout = ChannelLayout {
            channels: vec!["x".into()],
            has_label: true,
        };
        config
    }

    fn scheduler(config: &PipelineConfig, fog_class: i64) -> (CycleScheduler, Receiver<String>) {
        let schema =
            FeatureSchema::compile(&[FeatureSpec::Max { channel: "x".into() }], &config.layout)
                .unwrap();
        let fusion = ClassifierFusion::new(None, fixed_stage("fog", schema, fog_class, LabelMap::FOG));
        let (sink, rx) = channel_sink("ps");
        (CycleScheduler::new(config, fusion, Box::new(sink)), rx)
    }

    fn labelled(i: usize) -> RawSample {
        RawSample::with_label(vec![i as f64], i as f64)
    }

    #[test]
    fn advance_tick_keeps_phase() {
        let start = Instant::now();
        let period = Duration::from_millis(100);

        let (next, missed) = advance_tick(start, start + Duration::from_millis(30), period);
        assert_eq!((next, missed), (start + period, 0));

        // One period late: a single catch-up tick is allowed.
        let (next, missed) = advance_tick(start, start + Duration::from_millis(190), period);
        assert_eq!((next, missed), (start + period, 0));

        // Far behind: whole periods are dropped, phase preserved.
        let (next, missed) = advance_tick(start, start + Duration::from_millis(550), period);
        assert_eq!(missed, 4);
        assert_eq!(next, start + Duration::from_millis(500));
    }

    #[test]
    fn tick_walks_through_warm_up_then_publishes() {
        let config = small_config();
        let (mut scheduler, rx) = scheduler(&config, 1);
        let (tx, queue) = sample_queue();

        assert_eq!(scheduler.tick(&queue), CycleOutcome::Underflow);

        tx.push_all((0..5).map(labelled));
        assert_eq!(scheduler.tick(&queue), CycleOutcome::WarmingUp);

        tx.push_all((5..10).map(labelled));
        match scheduler.tick(&queue) {
            CycleOutcome::Published {
                fusion,
                reference_label,
            } => {
                assert_eq!(fusion.decision, Decision::Fog);
                assert_eq!(reference_label, Some(9.0));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(rx.try_recv().unwrap(), "ps 1.000000");
        assert_eq!(scheduler.state(), CycleState::Idle);

        let stats = scheduler.stats();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.warmup_skips, 1);
        assert_eq!(stats.published, 1);
    }

    #[test]
    fn run_publishes_at_test_rate_and_stops_on_shutdown() {
        let mut config = small_config();
        config.window.test_rate_hz = 50.0;
        config.window.sample_rate_hz = 250.0;
        let (mut scheduler, rx) = scheduler(&config, 0);
        let (tx, queue) = sample_queue();
        tx.push_all((0..40).map(labelled));

        let shutdown = Shutdown::new();
        let handle = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || scheduler.run(&queue, &shutdown))
        };

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, "ps 0.000000");
        std::thread::sleep(Duration::from_millis(500));
        shutdown.trigger();
        let stats = handle.join().unwrap();

        // 40 samples in steps of 5: one warm-up tick then seven decisions.
        assert_eq!(stats.warmup_skips, 1);
        assert_eq!(stats.published, 7);
        assert!(stats.underflow_skips >= 1);
        drop(tx);
    }
}
