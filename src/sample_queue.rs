//! Single-producer / single-consumer FIFO between the ingestion thread and the
//! cycle scheduler.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use crate::types::RawSample;

/// Creates the queue. Neither half is `Clone`, so exactly one thread can push and
/// exactly one thread can pop.
pub fn sample_queue() -> (SampleProducer, SampleConsumer) {
    let (tx, rx) = unbounded();
    (SampleProducer { tx }, SampleConsumer { rx })
}

pub struct SampleProducer {
    tx: Sender<RawSample>,
}

impl SampleProducer {
    /// Never blocks. Returns `false` once the consumer has been dropped.
    pub fn push(&self, sample: RawSample) -> bool {
        self.tx.send(sample).is_ok()
    }

    pub fn push_all(&self, samples: impl IntoIterator<Item = RawSample>) -> bool {
        samples.into_iter().all(|s| self.push(s))
    }
}

pub struct SampleConsumer {
    rx: Receiver<RawSample>,
}

impl SampleConsumer {
    /// Waits at most `timeout` for the oldest sample
    pub fn pop_timeout(&self, timeout: Duration) -> Option<RawSample> {
        match self.rx.recv_timeout(timeout) {
            Ok(sample) => Some(sample),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_pop(&self) -> Option<RawSample> {
        match self.rx.try_recv() {
            Ok(sample) => Some(sample),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Removes exactly `n` samples, or none at all when fewer are queued.
    pub fn try_pop_batch(&self, n: usize) -> Option<Vec<RawSample>> {
        if self.rx.len() < n {
            return None;
        }
        // Only this consumer removes items, so the queue cannot shrink under us.
        let mut batch = Vec::with_capacity(n);
        while batch.len() < n {
            batch.push(self.rx.try_recv().ok()?);
        }
        Some(batch)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn sample(v: f64) -> RawSample {
        RawSample::new(vec![v])
    }

    #[test]
    fn fifo_order() {
        let (tx, rx) = sample_queue();
        for i in 0..4 {
            assert!(tx.push(sample(i as f64)));
        }
        for i in 0..4 {
            assert_eq!(rx.try_pop().and_then(|s| s.get(0)), Some(i as f64));
        }
        assert!(rx.try_pop().is_none());
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let (tx, rx) = sample_queue();
        tx.push_all((0..3).map(|i| sample(i as f64)));

        assert!(rx.try_pop_batch(5).is_none());
        assert_eq!(rx.len(), 3);

        tx.push_all((3..5).map(|i| sample(i as f64)));
        let batch = rx.try_pop_batch(5).unwrap();
        let values: Vec<f64> = batch.iter().filter_map(|s| s.get(0)).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert!(rx.is_empty());
    }

    #[test]
    fn pop_timeout_is_bounded() {
        let (_tx, rx) = sample_queue();
        let start = Instant::now();
        assert!(rx.pop_timeout(Duration::from_millis(30)).is_none());
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(25));
        assert!(waited < Duration::from_secs(1));
    }

    #[test]
    fn producer_and_consumer_threads() {
        let (tx, rx) = sample_queue();
        let producer = thread::spawn(move || {
            for i in 0..1000 {
                tx.push(sample(i as f64));
            }
        });

        let mut received = Vec::with_capacity(1000);
        while received.len() < 1000 {
            if let Some(s) = rx.pop_timeout(Duration::from_millis(100)) {
                received.push(s.get(0).unwrap());
            }
        }
        producer.join().unwrap();

        assert!(received.windows(2).all(|w| w[0] < w[1]));
        assert!(rx.is_empty());
    }
}
