//! MPEG-DASH MPD parsing
//!
//! References:
//! - [DASH-IF implementation guidelines: restricted timing model](https://dashif.org/Guidelines-TimingModel)
//! - https://github.com/emarsden/dash-mpd-rs
//!
//! Only explicit (`SegmentTemplate` with `SegmentTimeline`) and simple (`SegmentTemplate@duration`)
//! addressing are supported. Representations using indexed addressing or segment lists are skipped.
use std::time::Duration;

use dash_mpd::{AdaptationSet, Period as MpdPeriod, Representation as MpdRepresentation, S, MPD};
use url::Url;

use super::{
    duration_to_units, template::TemplateDialect, url::resolve_url, DurationTemplate, Fragment,
    Manifest, ManifestFormat, Period, Representation, Stream, StreamKind, TimingSource,
};
use crate::{NagareError, NagareResult};

pub(super) fn parse(text: &str, manifest_url: &Url) -> NagareResult<Manifest> {
    let mpd = dash_mpd::parse(text)?;
    let live = mpd.mpdtype.as_deref() == Some("dynamic");

    let base_urls = if mpd.base_url.is_empty() {
        vec![manifest_url.clone()]
    } else {
        mpd.base_url
            .iter()
            .map(|b| resolve_url(manifest_url, &b.base))
            .collect::<NagareResult<Vec<_>>>()?
    };

    let timings = period_timings(&mpd)?;
    let mut periods = Vec::with_capacity(mpd.periods.len());
    for (period, (start, duration)) in mpd.periods.iter().zip(timings) {
        periods.push(build_period(period, start, duration, live)?);
    }

    let mut manifest = Manifest::new(ManifestFormat::Dash, base_urls, periods);
    manifest.live = live;
    manifest.minimum_update_period = mpd.minimumUpdatePeriod;
    manifest.duration = mpd.mediaPresentationDuration;
    manifest.availability_start = mpd.availabilityStartTime;
    manifest.time_shift_buffer_depth = mpd.timeShiftBufferDepth;
    manifest.presentation_delay = mpd.suggestedPresentationDelay.unwrap_or_default();
    manifest.timing_sources = mpd
        .UTCTiming
        .iter()
        .map(|timing| TimingSource {
            scheme: timing.schemeIdUri.clone(),
            value: timing.value.clone(),
        })
        .collect();

    Ok(manifest)
}

/// Start and duration of every period.
///
/// The start of a period is either explicit or the end of the previous period; the duration is
/// either explicit or implied by the start of the next period. The last period ends with the
/// presentation.
fn period_timings(mpd: &MPD) -> NagareResult<Vec<(Duration, Option<Duration>)>> {
    let mut timings: Vec<(Duration, Option<Duration>)> = Vec::with_capacity(mpd.periods.len());
    for period in mpd.periods.iter() {
        let start = match (period.start, timings.last_mut()) {
            (Some(start), Some((previous_start, previous_duration))) => {
                if previous_duration.is_none() {
                    *previous_duration = Some(start.saturating_sub(*previous_start));
                }
                start
            }
            (Some(start), None) => start,
            (None, Some((previous_start, Some(previous_duration)))) => {
                *previous_start + *previous_duration
            }
            (None, Some(_)) => {
                return Err(NagareError::ManifestParse(
                    "Missing period duration".to_string(),
                ))
            }
            // the first period of a presentation starts at zero
            (None, None) => Duration::ZERO,
        };
        timings.push((start, period.duration));
    }

    if let (Some((start, duration @ None)), Some(total)) =
        (timings.last_mut(), mpd.mediaPresentationDuration)
    {
        *duration = Some(total.saturating_sub(*start));
    }
    Ok(timings)
}

fn build_period(
    period: &MpdPeriod,
    start: Duration,
    duration: Option<Duration>,
    live: bool,
) -> NagareResult<Period> {
    let mut streams = Vec::with_capacity(period.adaptations.len());
    for adaptation in period.adaptations.iter() {
        let Some(kind) = adaptation_kind(adaptation) else {
            tracing::debug!(
                content_type = ?adaptation.contentType,
                mime_type = ?adaptation.mimeType,
                "Skipping unsupported adaptation set"
            );
            continue;
        };

        if let Some(stream) = build_stream(streams.len(), kind, period, adaptation, duration, live)?
        {
            streams.push(stream);
        }
    }

    Ok(Period::new(period.id.clone(), start, duration, streams))
}

fn adaptation_kind(adaptation: &AdaptationSet) -> Option<StreamKind> {
    if let Some(content_type) = adaptation.contentType.as_deref() {
        return match content_type {
            "video" => Some(StreamKind::Video),
            "audio" => Some(StreamKind::Audio),
            "text" => Some(StreamKind::Text),
            _ => None,
        };
    }

    adaptation
        .mimeType
        .as_deref()
        .or_else(|| {
            adaptation
                .representations
                .iter()
                .find_map(|r| r.mimeType.as_deref())
        })
        .and_then(StreamKind::from_mime_type)
}

/// SegmentTemplate attributes after applying the Period > AdaptationSet > Representation inheritance.
struct InheritedTemplate<'a> {
    media: Option<&'a str>,
    initialization: Option<&'a str>,
    start_number: u64,
    timescale: u64,
    duration: Option<f64>,
    presentation_time_offset: u64,
    timeline: Option<&'a [S]>,
}

impl<'a> InheritedTemplate<'a> {
    fn resolve(
        period: &'a MpdPeriod,
        adaptation: &'a AdaptationSet,
        representation: &'a MpdRepresentation,
    ) -> Option<Self> {
        // innermost first
        let levels: Vec<_> = [
            representation.SegmentTemplate.as_ref(),
            adaptation.SegmentTemplate.as_ref(),
            period.SegmentTemplate.as_ref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        if levels.is_empty() {
            return None;
        }

        Some(Self {
            media: levels.iter().find_map(|t| t.media.as_deref()),
            initialization: levels.iter().find_map(|t| t.initialization.as_deref()),
            start_number: levels.iter().find_map(|t| t.startNumber).unwrap_or(1),
            timescale: levels.iter().find_map(|t| t.timescale).unwrap_or(1),
            duration: levels.iter().find_map(|t| t.duration),
            presentation_time_offset: levels
                .iter()
                .find_map(|t| t.presentationTimeOffset)
                .unwrap_or(0),
            timeline: levels
                .iter()
                .find_map(|t| t.SegmentTimeline.as_ref())
                .map(|timeline| timeline.segments.as_slice()),
        })
    }
}

fn build_stream(
    id: usize,
    kind: StreamKind,
    period: &MpdPeriod,
    adaptation: &AdaptationSet,
    period_duration: Option<Duration>,
    live: bool,
) -> NagareResult<Option<Stream>> {
    let mut representations = Vec::with_capacity(adaptation.representations.len());
    let mut timing = None;

    for representation in adaptation.representations.iter() {
        let bitrate = representation.bandwidth.ok_or_else(|| {
            NagareError::ManifestParse(format!(
                "Representation {:?} has no bandwidth",
                representation.id
            ))
        })?;

        let Some(template) = InheritedTemplate::resolve(period, adaptation, representation) else {
            tracing::warn!(
                id = ?representation.id,
                "Skipping representation without SegmentTemplate"
            );
            continue;
        };
        let Some(media) = template.media else {
            return Err(NagareError::ManifestParse(format!(
                "Missing media template in representation {:?}",
                representation.id
            )));
        };

        let base_urls = [
            period.BaseURL.first(),
            adaptation.BaseURL.first(),
            representation.BaseURL.first(),
        ]
        .into_iter()
        .flatten()
        .map(|b| b.base.clone())
        .collect();

        representations.push(Representation {
            id: representation.id.clone(),
            bitrate,
            codec: representation
                .codecs
                .clone()
                .or_else(|| adaptation.codecs.clone()),
            codec_private: None,
            mime_type: representation
                .mimeType
                .clone()
                .or_else(|| adaptation.mimeType.clone()),
            width: representation.width,
            height: representation.height,
            sampling_rate: representation
                .audioSamplingRate
                .as_deref()
                .or(adaptation.audioSamplingRate.as_deref())
                .and_then(|rate| rate.parse().ok()),
            channels: representation
                .AudioChannelConfiguration
                .iter()
                .find_map(|c| c.value.as_deref())
                .and_then(|channels| channels.parse().ok()),
            base_urls,
            media: media.to_string(),
            initialization: template.initialization.map(str::to_string),
        });

        // every representation of an adaptation set shares the first timeline
        if timing.is_none() {
            timing = Some(build_timing(&template, period_duration, live)?);
        }
    }

    let Some((timescale, presentation_time_offset, fragments, duration_template)) = timing else {
        tracing::warn!(%kind, "Skipping adaptation set without usable representation");
        return Ok(None);
    };

    let mut stream = Stream::new(
        id,
        kind,
        timescale,
        TemplateDialect::Dash,
        representations,
        fragments,
    )?
    .with_name(None, adaptation.lang.clone())
    .with_presentation_time_offset(presentation_time_offset);
    if let Some(template) = duration_template {
        stream = stream.with_duration_template(template);
    }
    Ok(Some(stream))
}

type Timing = (u64, u64, Vec<Fragment>, Option<DurationTemplate>);

fn build_timing(
    template: &InheritedTemplate,
    period_duration: Option<Duration>,
    live: bool,
) -> NagareResult<Timing> {
    let timescale = template.timescale;
    let pto = template.presentation_time_offset;
    let period_end = period_duration.map(|d| pto + duration_to_units(d, timescale));

    if let Some(segments) = template.timeline {
        let fragments = expand_timeline(segments, template.start_number, pto, period_end)?;
        return Ok((timescale, pto, fragments, None));
    }

    let duration = template
        .duration
        .map(|d| d.round() as u64)
        .filter(|d| *d > 0)
        .ok_or_else(|| {
            NagareError::ManifestParse("Missing duration in SegmentTemplate".to_string())
        })?;
    let duration_template = DurationTemplate {
        duration,
        start_number: template.start_number,
    };

    if live {
        // generated against the wall clock once the presentation is running
        return Ok((timescale, pto, Vec::new(), Some(duration_template)));
    }

    let period_end = period_end.ok_or_else(|| {
        NagareError::ManifestParse("Unknown period duration for SegmentTemplate@duration".to_string())
    })?;
    let count = (period_end - pto).div_ceil(duration);
    let fragments = (0..count)
        .map(|index| Fragment {
            number: template.start_number + index,
            start: pto + index * duration,
            duration,
        })
        .collect();
    Ok((timescale, pto, fragments, None))
}

/// Expand `S` elements into fragments.
///
/// A negative `S@r` repeats up to the next `S@t`, or up to the end of the period.
fn expand_timeline(
    segments: &[S],
    start_number: u64,
    presentation_time_offset: u64,
    period_end: Option<u64>,
) -> NagareResult<Vec<Fragment>> {
    let mut fragments = Vec::new();
    let mut time = segments
        .first()
        .and_then(|s| s.t)
        .unwrap_or(presentation_time_offset);
    let mut number = start_number;

    for (index, segment) in segments.iter().enumerate() {
        if let Some(t) = segment.t {
            if t < time {
                return Err(NagareError::ManifestParse(format!(
                    "SegmentTimeline goes backwards: {t} after {time}"
                )));
            }
            time = t;
        }
        if segment.d == 0 {
            return Err(NagareError::ManifestParse(
                "SegmentTimeline entry without duration".to_string(),
            ));
        }

        let repeat = match segment.r {
            Some(r) if r >= 0 => r as u64,
            Some(_) => {
                let end = segments
                    .get(index + 1)
                    .and_then(|next| next.t)
                    .or(period_end);
                match end {
                    Some(end) => end.saturating_sub(time).div_ceil(segment.d).saturating_sub(1),
                    None => {
                        tracing::warn!(time, "Open ended S@r without known end, using a single fragment");
                        0
                    }
                }
            }
            None => 0,
        };

        // > Only additional segment references are counted by @r, so S@r=5 indicates a total of
        // > 6 consecutive media segments with the same duration.
        for _ in 0..=repeat {
            fragments.push(Fragment {
                number,
                start: time,
                duration: segment.d,
            });
            time += segment.d;
            number += 1;
        }
    }

    Ok(fragments)
}
