use crate::{manifest::Representation, DemuxConfig};

/// Throughput based representation choice.
///
/// The target bitrate is the measured rate scaled by the usage factor and capped by the
/// configured maximum bitrate. The representation with the greatest bitrate not above the
/// target wins; the lowest one is used when none qualifies.
#[derive(Debug, Clone)]
pub struct RepresentationSelector {
    usage_factor: f64,
    max_bitrate: Option<u64>,
}

impl RepresentationSelector {
    pub fn new(usage_factor: f64, max_bitrate: Option<u64>) -> Self {
        Self {
            usage_factor,
            max_bitrate,
        }
    }

    pub fn from_config(config: &DemuxConfig) -> Self {
        Self::new(config.bandwidth_usage, config.max_bitrate)
    }

    pub fn target(&self, measured_rate: u64) -> u64 {
        let target = (measured_rate as f64 * self.usage_factor) as u64;
        match self.max_bitrate {
            Some(max_bitrate) => target.min(max_bitrate),
            None => target,
        }
    }

    /// Index of the chosen representation in a list sorted by ascending bitrate.
    pub fn select(&self, representations: &[Representation], measured_rate: u64) -> usize {
        let target = self.target(measured_rate);
        let best = representations
            .iter()
            .map(|r| r.bitrate)
            .filter(|bitrate| *bitrate <= target)
            .max();

        // duplicated bitrates resolve to the first declared one
        best.and_then(|best| representations.iter().position(|r| r.bitrate == best))
            .unwrap_or(0)
    }
}
