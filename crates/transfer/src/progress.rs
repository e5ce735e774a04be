use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::attempt::AttemptStatus;
use crate::unit::UnitId;

/// Capacity of the engine's event channel.
pub(crate) const EVENT_CAPACITY: usize = 1024;

/// Progress event emitted during a run.
///
/// Delivery is best effort: when the receiver falls behind, events are
/// dropped rather than stalling the transfer.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// The checkpoint was loaded and the input partitioned.
    Started {
        distinct: usize,
        skipped: usize,
        pending: usize,
        batches: usize,
    },
    /// A unit reached a terminal result.
    UnitFinished {
        unit_id: UnitId,
        status: AttemptStatus,
        attempts: u32,
        already_present: bool,
    },
    /// A batch was merged and the checkpoint flushed.
    BatchFlushed {
        index: usize,
        completed: usize,
        failed: usize,
        pending: usize,
        units_per_sec: f64,
    },
    /// A shard archive was uploaded (or found already present).
    ShardUploaded { key: String, members: usize },
    /// The run ended.
    Finished {
        succeeded: usize,
        failed: usize,
        cancelled: bool,
    },
}

/// Sender half used inside the engine.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<TransferEvent>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<TransferEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        let _ = self.tx.try_send(event);
    }
}

// ---------------------------------------------------------------------------
// RateMeter
// ---------------------------------------------------------------------------

/// Units-per-second over a sliding time window.
#[derive(Debug)]
pub struct RateMeter {
    samples: VecDeque<(Instant, u64)>,
    max_samples: usize,
    window: Duration,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), 256)
    }
}

impl RateMeter {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples: max_samples.max(2),
            window,
        }
    }

    /// Records `count` units finished now.
    pub fn record(&mut self, count: u64) {
        self.record_at(Instant::now(), count);
    }

    fn record_at(&mut self, now: Instant, count: u64) {
        self.samples.push_back((now, count));

        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Average rate within the window; 0.0 with fewer than two samples.
    ///
    /// The oldest sample only marks the start of the window; its count is
    /// not part of the rate.
    pub fn per_second(&self) -> f64 {
        let (Some(&(first, _)), Some(&(last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed = last.duration_since(first);
        if self.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        let total: u64 = self.samples.iter().skip(1).map(|&(_, n)| n).sum();
        total as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to finish `remaining` units at the current rate.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let rate = self.per_second();
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_meter_has_no_rate() {
        let meter = RateMeter::default();
        assert_eq!(meter.per_second(), 0.0);
        assert!(meter.eta(100).is_none());
    }

    #[test]
    fn single_sample_has_no_rate() {
        let mut meter = RateMeter::default();
        meter.record(10);
        assert_eq!(meter.per_second(), 0.0);
    }

    #[test]
    fn rate_over_window() {
        let mut meter = RateMeter::new(Duration::from_secs(60), 16);
        let t0 = Instant::now();
        meter.record_at(t0, 0);
        meter.record_at(t0 + Duration::from_secs(2), 10);
        meter.record_at(t0 + Duration::from_secs(4), 10);
        assert!((meter.per_second() - 5.0).abs() < 1e-9);

        let eta = meter.eta(50).unwrap();
        assert!((eta.as_secs_f64() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn old_samples_fall_out_of_window() {
        let mut meter = RateMeter::new(Duration::from_secs(10), 16);
        let t0 = Instant::now();
        meter.record_at(t0, 1000);
        meter.record_at(t0 + Duration::from_secs(20), 0);
        meter.record_at(t0 + Duration::from_secs(22), 4);
        assert_eq!(meter.samples.len(), 2);
        assert!((meter.per_second() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn sample_count_is_bounded() {
        let mut meter = RateMeter::new(Duration::from_secs(600), 5);
        let t0 = Instant::now();
        for i in 0..20u64 {
            meter.record_at(t0 + Duration::from_millis(i * 10), 1);
        }
        assert_eq!(meter.samples.len(), 5);
        meter.reset();
        assert_eq!(meter.per_second(), 0.0);
    }

    #[tokio::test]
    async fn sink_drops_when_full() {
        let (sink, mut rx) = EventSink::channel();
        for i in 0..EVENT_CAPACITY + 10 {
            sink.emit(TransferEvent::ShardUploaded {
                key: format!("k{i}"),
                members: 1,
            });
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, EVENT_CAPACITY);
    }
}
