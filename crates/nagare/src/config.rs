use std::time::Duration;

use serde::Deserialize;

use crate::{NagareError, NagareResult};

/// Tunables of an [AdaptiveDemux](crate::demux::AdaptiveDemux).
///
/// Every field has a default, so a TOML table only needs the keys it overrides:
///
/// ```toml
/// max_buffering_time = 10.0
/// bandwidth_usage = 0.6
/// max_bitrate = 3000000
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemuxConfig {
    /// Seconds of media a single stream queue may hold before the download loop idles.
    pub max_buffering_time: f64,
    /// Share of the measured throughput that may be spent on media bitrate.
    pub bandwidth_usage: f64,
    /// Upper bound for the selected representation bitrate, in bits per second.
    pub max_bitrate: Option<u64>,
    /// Fragments every stream must have queued before data is pushed downstream.
    pub fragments_cache: usize,
    /// Consecutive fetch failures tolerated on one base URL.
    pub fragment_retries: u32,
    pub rate_window_samples: usize,
    /// Seconds
    pub rate_window_span: f64,
    /// Refresh interval for live manifests without a minimum update period, in seconds.
    pub live_poll_interval: f64,
    /// Longest single wait when a live stream is ahead of the live edge, in seconds.
    pub max_live_wait: f64,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            max_buffering_time: 30.,
            bandwidth_usage: 0.8,
            max_bitrate: None,
            fragments_cache: 0,
            fragment_retries: 3,
            rate_window_samples: 3,
            rate_window_span: 3.,
            live_poll_interval: 2.,
            max_live_wait: 5.,
        }
    }
}

impl DemuxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_buffering_time(mut self, max_buffering_time: Duration) -> Self {
        self.max_buffering_time = max_buffering_time.as_secs_f64();
        self
    }

    pub fn bandwidth_usage(mut self, bandwidth_usage: f64) -> Self {
        self.bandwidth_usage = bandwidth_usage;
        self
    }

    pub fn max_bitrate(mut self, max_bitrate: Option<u64>) -> Self {
        self.max_bitrate = max_bitrate;
        self
    }

    pub fn fragments_cache(mut self, fragments_cache: usize) -> Self {
        self.fragments_cache = fragments_cache;
        self
    }

    pub fn fragment_retries(mut self, fragment_retries: u32) -> Self {
        self.fragment_retries = fragment_retries;
        self
    }

    pub fn live_poll_interval(mut self, live_poll_interval: Duration) -> Self {
        self.live_poll_interval = live_poll_interval.as_secs_f64();
        self
    }

    pub fn max_live_wait(mut self, max_live_wait: Duration) -> Self {
        self.max_live_wait = max_live_wait.as_secs_f64();
        self
    }

    pub fn validate(&self) -> NagareResult<()> {
        if !(self.bandwidth_usage > 0. && self.bandwidth_usage <= 1.) {
            return Err(NagareError::InvalidConfig(format!(
                "bandwidth_usage must be in (0, 1], got {}",
                self.bandwidth_usage
            )));
        }

        for (name, value) in [
            ("max_buffering_time", self.max_buffering_time),
            ("rate_window_span", self.rate_window_span),
            ("live_poll_interval", self.live_poll_interval),
            ("max_live_wait", self.max_live_wait),
        ] {
            if !value.is_finite() || value <= 0. {
                return Err(NagareError::InvalidConfig(format!(
                    "{name} must be a positive number of seconds, got {value}"
                )));
            }
        }

        if self.rate_window_samples == 0 {
            return Err(NagareError::InvalidConfig(
                "rate_window_samples must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn max_buffering_duration(&self) -> Duration {
        Duration::from_secs_f64(self.max_buffering_time)
    }

    pub fn rate_window_duration(&self) -> Duration {
        Duration::from_secs_f64(self.rate_window_span)
    }

    pub fn live_poll_duration(&self) -> Duration {
        Duration::from_secs_f64(self.live_poll_interval)
    }

    pub fn max_live_wait_duration(&self) -> Duration {
        Duration::from_secs_f64(self.max_live_wait)
    }
}
