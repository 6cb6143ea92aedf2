use std::collections::VecDeque;

use crate::sample_queue::SampleConsumer;
use crate::types::RawSample;

/// Fixed-capacity sliding window over the most recent samples.
///
/// Advanced in whole steps drained from the ingestion queue; the oldest samples are
/// evicted so the window never exceeds its capacity once a step completes.
pub struct SlidingWindow {
    samples: VecDeque<RawSample>,
    capacity: usize,
    reference_label: Option<f64>,
}

/// Read-only view of a full window, oldest sample first
#[derive(Debug, Clone, Copy)]
pub struct Window<'a> {
    samples: &'a [RawSample],
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity + 1),
            capacity,
            reference_label: None,
        }
    }

    /// Drains exactly `step_size` samples from `queue` and slides the window.
    ///
    /// Returns `None` without touching the queue when fewer than `step_size` samples
    /// are waiting, and `None` after sliding while the window is still warming up.
    pub fn try_advance(
        &mut self,
        queue: &SampleConsumer,
        step_size: usize,
    ) -> Option<Window<'_>> {
        let batch = queue.try_pop_batch(step_size)?;
        self.push_batch(batch);
        self.view()
    }

    /// Appends an already drained batch
    pub fn push_batch(&mut self, batch: Vec<RawSample>) {
        if let Some(last) = batch.last() {
            // The classifiers were trained against the label of the last sample.
            self.reference_label = last.label();
        }
        self.samples.extend(batch);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// Current window if it holds `capacity` samples
    pub fn view(&mut self) -> Option<Window<'_>> {
        if !self.is_ready() {
            return None;
        }
        let samples: &[RawSample] = self.samples.make_contiguous();
        Some(Window { samples })
    }

    pub fn is_ready(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    /// Label carried by the last sample of the most recent batch
    pub fn reference_label(&self) -> Option<f64> {
        self.reference_label
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.reference_label = None;
    }
}

impl<'a> Window<'a> {
    /// Wraps an arbitrary slice, mainly for offline tooling
    pub fn from_slice(samples: &'a [RawSample]) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &'a [RawSample] {
        self.samples
    }

    /// One channel across the window in chronological order. Samples that lack the
    /// channel contribute 0.0.
    pub fn column(&self, channel: usize) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| s.get(channel).unwrap_or(0.0))
            .collect()
    }

    pub fn last(&self) -> Option<&'a RawSample> {
        self.samples.last()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
