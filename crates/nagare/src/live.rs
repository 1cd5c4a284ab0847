//! Wall clock and live edge reconciliation.
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use url::Url;

use crate::{
    downloader::Downloader,
    manifest::{units_to_duration, Manifest, StreamId, TimingSource},
    NagareError, NagareResult,
};

/// Wall clock corrected by the offset to the server clock.
#[derive(Debug, Clone, Default)]
pub struct Clock {
    /// How much time the local clock is behind the remote clock
    offset: TimeDelta,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset
    }

    pub fn offset(&self) -> TimeDelta {
        self.offset
    }

    /// Pretend the current time is `now`.
    pub fn set_now(&mut self, now: DateTime<Utc>) {
        self.offset = now - Utc::now();
    }

    fn set_time(
        &mut self,
        remote_now: DateTime<Utc>,
        before_request: DateTime<Utc>,
        after_request: DateTime<Utc>,
    ) {
        // the remote time was sampled half way through the request
        let rtt = after_request - before_request;
        let server_now = remote_now + rtt / 2;
        self.offset = server_now - after_request;
        tracing::info!(
            offset_milliseconds = %self.offset.num_milliseconds(),
            "Clock time set to {}, offset calculated",
            remote_now
        );
    }

    /// Synchronise with the first usable timing source.
    ///
    /// Without any timing source the local clock is kept.
    pub async fn sync(
        &mut self,
        sources: &[TimingSource],
        downloader: &impl Downloader,
    ) -> NagareResult<()> {
        if sources.is_empty() {
            tracing::debug!("No UTCTiming elements found, using local time");
            return Ok(());
        }

        let mut last_error = None;
        for source in sources {
            tracing::debug!(scheme = %source.scheme, value = ?source.value, "Attempting to sync time");
            match self.sync_with(source, downloader).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(scheme = %source.scheme, error = %e, "Failed to sync time");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            NagareError::InvalidTimingSchema("All time sync methods failed".to_string())
        }))
    }

    async fn sync_with(
        &mut self,
        source: &TimingSource,
        downloader: &impl Downloader,
    ) -> NagareResult<()> {
        let value = source.value.as_deref().ok_or_else(|| {
            NagareError::InvalidTimingSchema(format!("Missing value for {}", source.scheme))
        })?;

        match source.scheme.as_str() {
            "urn:mpeg:dash:utc:direct:2014" => {
                let now = Utc::now();
                self.set_time(parse_xs_datetime(value)?, now, now);
            }
            "urn:mpeg:dash:utc:http-xsdate:2014" | "urn:mpeg:dash:utc:http-iso:2014" => {
                let url = Url::parse(value)?;
                let before_request = Utc::now();
                let body = downloader.fetch(&url).await?;
                let after_request = Utc::now();
                let text = String::from_utf8_lossy(&body);
                self.set_time(parse_xs_datetime(text.trim())?, before_request, after_request);
            }
            others => {
                return Err(NagareError::InvalidTimingSchema(format!(
                    "Unsupported scheme: {others}"
                )))
            }
        }
        Ok(())
    }
}

fn parse_xs_datetime(text: &str) -> NagareResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // xs:dateTime without timezone is UTC
            chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|dt| dt.and_utc())
        })
        .map_err(|e| NagareError::InvalidTimingSchema(format!("Invalid time {text:?}: {e}")))
}

/// Where the next fragment of a live stream lies relative to the live edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivePosition {
    /// Older than the DVR window, playback should continue from `edge` (timescale units).
    Behind { edge: u64 },
    /// Not published yet, available after the given wall time.
    Ahead(Duration),
    OnTime,
}

pub struct LiveTimingReconciler;

impl LiveTimingReconciler {
    /// Compare a fragment starting at `start` (timescale units) with the live edge.
    ///
    /// Static presentations are always [LivePosition::OnTime].
    pub fn check_position(
        manifest: &Manifest,
        id: StreamId,
        start: u64,
        now: DateTime<Utc>,
    ) -> NagareResult<LivePosition> {
        let Some(edge) = manifest.live_edge(id, now)? else {
            return Ok(LivePosition::OnTime);
        };
        let stream = manifest.stream(id)?;

        if let Some(window) = manifest.dvr_window(id)? {
            if start.saturating_add(window) < edge {
                return Ok(LivePosition::Behind { edge });
            }
        }

        // a fragment is published once its end is behind the edge
        let end = stream
            .fragments()
            .iter()
            .find(|f| f.start == start)
            .map(|f| f.end())
            .unwrap_or(start);
        if end > edge {
            return Ok(LivePosition::Ahead(units_to_duration(
                end - edge,
                stream.timescale(),
            )));
        }

        Ok(LivePosition::OnTime)
    }
}
