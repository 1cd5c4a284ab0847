//! Sliding window download rate estimation.
use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

use crate::DemuxConfig;

#[derive(Debug, Clone, Copy)]
struct RateSample {
    bytes: u64,
    elapsed: Duration,
    /// Media duration of the fragment, weighs the sample.
    weight: Duration,
    received_at: Instant,
}

impl RateSample {
    fn rate(&self) -> u128 {
        self.bytes as u128 * 8 * 1_000_000 / self.elapsed.as_micros().max(1_000)
    }
}

/// Throughput estimate over the last few fragment downloads.
///
/// A sample is evicted when more than `max_samples` are retained or when it is older than
/// `max_span`, whichever happens first. The newest sample is always kept.
///
/// The estimate is the average of the sample rates weighted by the media duration of their
/// fragments.
#[derive(Debug, Clone)]
pub struct RateTracker {
    samples: VecDeque<RateSample>,
    max_samples: usize,
    max_span: Duration,
}

impl RateTracker {
    pub fn new(max_samples: usize, max_span: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples + 1),
            max_samples: max_samples.max(1),
            max_span,
        }
    }

    pub fn from_config(config: &DemuxConfig) -> Self {
        Self::new(config.rate_window_samples, config.rate_window_duration())
    }

    pub fn add_sample(&mut self, bytes: u64, elapsed: Duration, fragment_duration: Duration) {
        self.add_sample_at(Instant::now(), bytes, elapsed, fragment_duration);
    }

    pub fn add_sample_at(
        &mut self,
        received_at: Instant,
        bytes: u64,
        elapsed: Duration,
        fragment_duration: Duration,
    ) {
        tracing::trace!(bytes, ?elapsed, ?fragment_duration, "Download rate sample");
        self.samples.push_back(RateSample {
            bytes,
            elapsed,
            weight: fragment_duration,
            received_at,
        });

        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        while self.samples.len() > 1
            && self
                .samples
                .front()
                .is_some_and(|s| received_at.duration_since(s.received_at) > self.max_span)
        {
            self.samples.pop_front();
        }
    }

    /// Bits per second over the retained window, 0 without samples.
    pub fn current_rate(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }

        let (weighted, weights) = self.samples.iter().fold((0u128, 0u128), |(sum, total), s| {
            let weight = s.weight.as_micros().max(1);
            (sum + s.rate() * weight, total + weight)
        });
        (weighted / weights) as u64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
