//! # Manifest model
//!
//! Both supported manifest dialects are parsed into the same tree:
//!
//! ```text
//! Manifest ─┬─ Period ─┬─ Stream (video) ─┬─ Representation (sorted by bitrate)
//!           │          │                  └─ Fragment list + cursor
//!           │          └─ Stream (audio) ...
//!           └─ Period ...
//! ```
//!
//! A MPEG-DASH MPD may contain several periods, a Smooth Streaming manifest always has
//! exactly one. Representations of a stream share the stream's fragment timeline, only the
//! urls differ between them.
//!
//! Fragment times are kept in the stream timescale. [Stream::to_time] maps them onto the
//! presentation timeline.

mod dash;
mod smooth;
pub mod template;
pub(crate) mod url;

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use quick_xml::{events::Event, Reader};
use ::url::Url;
use template::{Template, TemplateDialect};

use self::url::resolve_url;
use crate::{sink::StreamFormat, NagareError, NagareResult};

/// Index of a stream inside the current period.
pub type StreamId = usize;

/// Segments generated for a live template are limited to this window.
const MAX_GENERATED_FRAGMENTS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
    Text,
}

impl StreamKind {
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        if mime_type.starts_with("video") {
            Some(Self::Video)
        } else if mime_type.starts_with("audio") {
            Some(Self::Audio)
        } else if mime_type.starts_with("text") || mime_type == "application/ttml+xml" {
            Some(Self::Text)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Text => "text",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Dash,
    SmoothStreaming,
}

/// One fetchable chunk of media, in stream timescale units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub number: u64,
    pub start: u64,
    pub duration: u64,
}

impl Fragment {
    pub fn end(&self) -> u64 {
        self.start + self.duration
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub id: Option<String>,
    /// Bits per second
    pub bitrate: u64,
    pub codec: Option<String>,
    pub codec_private: Option<Bytes>,
    pub mime_type: Option<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub sampling_rate: Option<u32>,
    pub channels: Option<u32>,

    /// Relative BaseURLs from the outermost to the innermost element.
    pub(crate) base_urls: Vec<String>,
    pub(crate) media: String,
    pub(crate) initialization: Option<String>,
}

impl Representation {
    pub(crate) fn new(bitrate: u64, media: impl Into<String>) -> Self {
        Self {
            id: None,
            bitrate,
            codec: None,
            codec_private: None,
            mime_type: None,
            width: None,
            height: None,
            sampling_rate: None,
            channels: None,
            base_urls: Vec::new(),
            media: media.into(),
            initialization: None,
        }
    }

    pub fn format(&self, kind: StreamKind) -> StreamFormat {
        StreamFormat {
            kind,
            codec: self.codec.clone(),
            codec_private: self.codec_private.clone(),
            mime_type: self.mime_type.clone(),
            bitrate: self.bitrate,
            width: self.width,
            height: self.height,
            sampling_rate: self.sampling_rate,
            channels: self.channels,
        }
    }

    fn same_as(&self, other: &Self) -> bool {
        self.id == other.id && self.bitrate == other.bitrate
    }
}

/// `SegmentTemplate@duration` addressing: fragments are generated rather than listed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DurationTemplate {
    pub duration: u64,
    pub start_number: u64,
}

#[derive(Debug, Clone)]
pub struct Stream {
    id: StreamId,
    kind: StreamKind,
    name: Option<String>,
    lang: Option<String>,
    timescale: u64,
    presentation_time_offset: u64,
    dialect: TemplateDialect,

    representations: Vec<Representation>,
    fragments: Vec<Fragment>,
    duration_template: Option<DurationTemplate>,

    current_representation: usize,
    cursor: usize,
    last_delivered: Option<Fragment>,

    end_of_period: bool,
    end_of_stream: bool,
    needs_header: bool,
    discont: bool,
}

impl Stream {
    pub(crate) fn new(
        id: StreamId,
        kind: StreamKind,
        timescale: u64,
        dialect: TemplateDialect,
        mut representations: Vec<Representation>,
        fragments: Vec<Fragment>,
    ) -> NagareResult<Self> {
        if representations.is_empty() {
            return Err(NagareError::ManifestParse(format!(
                "{kind} stream {id} has no representation"
            )));
        }
        if timescale == 0 {
            return Err(NagareError::ManifestParse(format!(
                "{kind} stream {id} has a zero timescale"
            )));
        }
        if let Some(pair) = fragments.windows(2).find(|w| w[1].start < w[0].start) {
            return Err(NagareError::ManifestParse(format!(
                "{kind} stream {id} has non-monotonic fragments: {} after {}",
                pair[1].start, pair[0].start
            )));
        }

        // stable, so duplicated bitrates keep their declaration order
        representations.sort_by_key(|r| r.bitrate);

        Ok(Self {
            id,
            kind,
            name: None,
            lang: None,
            timescale,
            presentation_time_offset: 0,
            dialect,
            representations,
            fragments,
            duration_template: None,
            current_representation: 0,
            cursor: 0,
            last_delivered: None,
            end_of_period: false,
            end_of_stream: false,
            needs_header: true,
            discont: true,
        })
    }

    pub(crate) fn with_name(mut self, name: Option<String>, lang: Option<String>) -> Self {
        self.name = name;
        self.lang = lang;
        self
    }

    pub(crate) fn with_presentation_time_offset(mut self, offset: u64) -> Self {
        self.presentation_time_offset = offset;
        self
    }

    pub(crate) fn with_duration_template(mut self, template: DurationTemplate) -> Self {
        self.duration_template = Some(template);
        self
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn lang(&self) -> Option<&str> {
        self.lang.as_deref()
    }

    pub fn timescale(&self) -> u64 {
        self.timescale
    }

    pub fn representations(&self) -> &[Representation] {
        &self.representations
    }

    pub fn current_representation(&self) -> usize {
        self.current_representation
    }

    pub fn representation(&self) -> &Representation {
        &self.representations[self.current_representation]
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn last_delivered(&self) -> Option<&Fragment> {
        self.last_delivered.as_ref()
    }

    pub fn is_end_of_period(&self) -> bool {
        self.end_of_period
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    pub fn needs_header(&self) -> bool {
        self.needs_header
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.fragments.len()
    }

    /// Start of the next fragment to fetch, in timescale units.
    pub fn next_start(&self) -> Option<u64> {
        self.fragments.get(self.cursor).map(|f| f.start)
    }

    /// Map a time in timescale units to a time relative to the period start.
    pub fn to_time(&self, units: u64) -> Duration {
        units_to_duration(
            units.saturating_sub(self.presentation_time_offset),
            self.timescale,
        )
    }

    /// Map a time relative to the period start to timescale units.
    pub fn to_units(&self, time: Duration) -> u64 {
        self.presentation_time_offset + duration_to_units(time, self.timescale)
    }

    /// Index of the fragment whose `[start, end)` covers `units`.
    ///
    /// Past the last fragment, live streams clamp to the last known fragment while
    /// static streams report the end of the list.
    fn index_at(&self, units: u64, live: bool) -> usize {
        let after = self.fragments.partition_point(|f| f.start <= units);
        if after == 0 {
            return 0;
        }

        let candidate = &self.fragments[after - 1];
        if units < candidate.end() {
            after - 1
        } else if after < self.fragments.len() {
            // inside a gap, continue with the following fragment
            after
        } else if live {
            after - 1
        } else {
            after
        }
    }

    /// Index of the last fragment which is complete at `units`.
    fn live_index(&self, units: u64) -> usize {
        self.fragments
            .partition_point(|f| f.end() <= units)
            .saturating_sub(1)
    }

    fn reposition(&mut self, index: usize) {
        self.cursor = index.min(self.fragments.len());
        self.last_delivered = None;
        self.end_of_period = false;
        self.end_of_stream = false;
        self.needs_header = true;
        self.discont = true;
    }

    /// Keep the sequence numbers of `old` for the fragments both lists share. Smooth
    /// Streaming documents always count from their first chunk.
    fn renumber_from(&mut self, old: &Stream) {
        let shared = self.fragments.iter().find_map(|new| {
            old.fragments
                .binary_search_by_key(&new.start, |f| f.start)
                .ok()
                .map(|index| (new.number, old.fragments[index].number))
        });

        match shared {
            Some((new_number, old_number)) if new_number != old_number => {
                let delta = old_number as i64 - new_number as i64;
                for fragment in self.fragments.iter_mut() {
                    fragment.number = fragment.number.saturating_add_signed(delta);
                }
            }
            Some(_) => {}
            None => {
                let Some(old_tail) = old.fragments.last() else {
                    return;
                };
                if self.fragments.first().is_some_and(|f| f.start > old_tail.start) {
                    for (index, fragment) in self.fragments.iter_mut().enumerate() {
                        fragment.number = old_tail.number + 1 + index as u64;
                    }
                }
            }
        }
    }

    /// Carry the playback state of `old` over to this freshly parsed stream.
    fn align_with(&mut self, old: &Stream) -> NagareResult<()> {
        if self.kind != old.kind {
            return Err(NagareError::Alignment(format!(
                "stream {} changed from {} to {}",
                self.id, old.kind, self.kind
            )));
        }

        match self
            .representations
            .iter()
            .position(|r| r.same_as(old.representation()))
        {
            Some(index) => {
                self.current_representation = index;
                self.needs_header = old.needs_header;
            }
            None => {
                let bitrate = old.representation().bitrate;
                self.current_representation = self
                    .representations
                    .iter()
                    .rposition(|r| r.bitrate <= bitrate)
                    .unwrap_or(0);
                self.needs_header = true;
            }
        }

        if self.duration_template.is_some() {
            // generated lists are extended by the clock, not by the document
            self.fragments = old.fragments.clone();
        } else if let Some(tail) = self.fragments.last().copied() {
            if let Some(last) = old.last_delivered {
                if tail.end() < last.end() {
                    return Err(NagareError::Alignment(format!(
                        "{} stream {} update ends at {}, before the last delivered fragment at {}",
                        self.kind, self.id, tail.start, last.start
                    )));
                }
            }
            if self.dialect == TemplateDialect::Smooth {
                self.renumber_from(old);
            }

            // keep fragments announced in-band that the document does not know yet
            let tail = self.fragments.last().copied().unwrap_or(tail);
            let mut number = tail.number;
            for fragment in old.fragments.iter().filter(|f| f.start > tail.start) {
                number += 1;
                self.fragments.push(Fragment { number, ..*fragment });
            }
        }

        match old.last_delivered {
            Some(last) => {
                let reaches = self
                    .fragments
                    .last()
                    .is_some_and(|tail| tail.end() >= last.end());
                if !reaches {
                    return Err(NagareError::Alignment(format!(
                        "{} stream {} ends before the last delivered fragment at {}",
                        self.kind, self.id, last.start
                    )));
                }
                self.cursor = self.fragments.partition_point(|f| f.start <= last.start);
            }
            None => {
                self.cursor = match old.next_start() {
                    Some(resume) => self.fragments.partition_point(|f| f.start < resume),
                    None if old.fragments.is_empty() => 0,
                    None => self.fragments.len(),
                };
            }
        }

        self.last_delivered = old.last_delivered;
        self.end_of_stream = old.end_of_stream;
        self.end_of_period = old.end_of_period && self.is_exhausted();
        self.discont = old.discont;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Period {
    id: Option<String>,
    start: Duration,
    duration: Option<Duration>,
    streams: Vec<Stream>,
}

impl Period {
    pub(crate) fn new(
        id: Option<String>,
        start: Duration,
        duration: Option<Duration>,
        streams: Vec<Stream>,
    ) -> Self {
        Self {
            id,
            start,
            duration,
            streams,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn start(&self) -> Duration {
        self.start
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    fn reset(&mut self) {
        for stream in self.streams.iter_mut() {
            stream.reposition(0);
        }
    }
}

/// A `UTCTiming` element of a MPD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingSource {
    pub scheme: String,
    pub value: Option<String>,
}

/// Everything needed to fetch the next fragment of a stream.
#[derive(Debug, Clone)]
pub struct FragmentRequest {
    pub stream: StreamId,
    pub kind: StreamKind,
    pub uri: Url,
    /// Initialization segment of the representation, if it declares one.
    pub header_uri: Option<Url>,
    /// Whether the fragment must be primed with a new header and format.
    pub needs_header: bool,
    pub discont: bool,
    pub representation: usize,
    pub format: StreamFormat,
    pub fragment: Fragment,
    /// Presentation timestamp
    pub timestamp: Duration,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub enum NextFragment {
    Fragment(FragmentRequest),
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    format: ManifestFormat,
    live: bool,
    minimum_update_period: Option<Duration>,
    duration: Option<Duration>,
    availability_start: Option<DateTime<Utc>>,
    time_shift_buffer_depth: Option<Duration>,
    presentation_delay: Duration,
    timing_sources: Vec<TimingSource>,

    /// The first entry is the primary location, the following ones are alternates.
    base_urls: Vec<Url>,
    base_index: usize,

    periods: Vec<Period>,
    period_index: usize,
}

impl Manifest {
    /// Parse a DASH MPD or a Smooth Streaming manifest, detected by its root element.
    pub fn parse(data: &[u8], manifest_url: &Url) -> NagareResult<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| NagareError::ManifestParse(format!("manifest is not UTF-8: {e}")))?;
        let text = text.trim_start_matches('\u{feff}');

        let manifest = match root_element(text)?.as_deref() {
            Some("MPD") => dash::parse(text, manifest_url)?,
            Some("SmoothStreamingMedia") => smooth::parse(text, manifest_url)?,
            Some(other) => {
                return Err(NagareError::ManifestParse(format!(
                    "unknown root element <{other}>"
                )))
            }
            None => {
                return Err(NagareError::ManifestParse(
                    "missing root element".to_string(),
                ))
            }
        };

        if manifest.periods.iter().all(|p| p.streams.is_empty()) {
            return Err(NagareError::ManifestParse(
                "manifest has no playable stream".to_string(),
            ));
        }

        tracing::debug!(
            format = ?manifest.format,
            live = manifest.live,
            periods = manifest.periods.len(),
            "Manifest parsed"
        );
        Ok(manifest)
    }

    pub(crate) fn new(format: ManifestFormat, base_urls: Vec<Url>, periods: Vec<Period>) -> Self {
        Self {
            format,
            live: false,
            minimum_update_period: None,
            duration: None,
            availability_start: None,
            time_shift_buffer_depth: None,
            presentation_delay: Duration::ZERO,
            timing_sources: Vec::new(),
            base_urls,
            base_index: 0,
            periods,
            period_index: 0,
        }
    }

    pub fn format(&self) -> ManifestFormat {
        self.format
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn minimum_update_interval(&self) -> Option<Duration> {
        self.minimum_update_period
    }

    /// Duration of the whole presentation, unknown for live manifests.
    pub fn duration(&self) -> Option<Duration> {
        if self.live {
            None
        } else {
            self.duration
        }
    }

    pub fn time_shift_buffer_depth(&self) -> Option<Duration> {
        self.time_shift_buffer_depth
    }

    pub fn timing_sources(&self) -> &[TimingSource] {
        &self.timing_sources
    }

    pub fn base_url(&self) -> &Url {
        &self.base_urls[self.base_index]
    }

    /// Switch to the next alternate base url, returns `false` when none is left.
    pub fn fail_over_base(&mut self) -> bool {
        if self.base_index + 1 < self.base_urls.len() {
            self.base_index += 1;
            tracing::warn!(base_url = %self.base_url(), "Switched to alternate base url");
            true
        } else {
            false
        }
    }

    pub fn periods(&self) -> &[Period] {
        &self.periods
    }

    pub fn current_period(&self) -> &Period {
        &self.periods[self.period_index]
    }

    pub fn has_next_period(&self) -> bool {
        self.period_index + 1 < self.periods.len()
    }

    /// Move to the following period, every stream starts over from its first fragment.
    pub fn advance_period(&mut self) -> bool {
        if !self.has_next_period() {
            return false;
        }
        self.period_index += 1;
        let period = &mut self.periods[self.period_index];
        period.reset();
        tracing::info!(period = ?period.id, start = ?period.start, "Entering next period");
        true
    }

    pub fn streams(&self) -> &[Stream] {
        &self.current_period().streams
    }

    pub fn active_streams(&self) -> Vec<StreamId> {
        (0..self.streams().len()).collect()
    }

    /// Largest stream count over all periods.
    pub fn max_streams(&self) -> usize {
        self.periods
            .iter()
            .map(|p| p.streams.len())
            .max()
            .unwrap_or_default()
    }

    pub fn stream(&self, id: StreamId) -> NagareResult<&Stream> {
        self.streams()
            .get(id)
            .ok_or(NagareError::UnknownStream(id))
    }

    fn stream_mut(&mut self, id: StreamId) -> NagareResult<&mut Stream> {
        self.periods[self.period_index]
            .streams
            .get_mut(id)
            .ok_or(NagareError::UnknownStream(id))
    }

    pub fn representations(&self, id: StreamId) -> NagareResult<&[Representation]> {
        Ok(self.stream(id)?.representations())
    }

    /// The stream whose failures stop playback: video if present, audio otherwise.
    pub fn primary_stream(&self) -> Option<StreamId> {
        let streams = self.streams();
        streams
            .iter()
            .find(|s| s.kind == StreamKind::Video)
            .or_else(|| streams.iter().find(|s| s.kind == StreamKind::Audio))
            .or_else(|| streams.first())
            .map(|s| s.id)
    }

    /// Describe the next fragment of a stream without moving its cursor.
    pub fn next_fragment(&self, id: StreamId) -> NagareResult<NextFragment> {
        let period = self.current_period();
        let stream = self.stream(id)?;
        let Some(fragment) = stream.fragments.get(stream.cursor).copied() else {
            return Ok(NextFragment::Exhausted);
        };

        let representation = stream.representation();
        let mut template = Template::new();
        template
            .insert_optional(Template::REPRESENTATION_ID, representation.id.clone())
            .insert(Template::BANDWIDTH, representation.bitrate.to_string())
            .insert(Template::NUMBER, fragment.number.to_string())
            .insert(Template::TIME, fragment.start.to_string());

        let mut base = self.base_url().clone();
        for relative in representation.base_urls.iter() {
            base = resolve_url(&base, relative)?;
        }
        let uri = resolve_url(&base, &template.resolve(stream.dialect, &representation.media))?;
        let header_uri = representation
            .initialization
            .as_ref()
            .map(|init| resolve_url(&base, &template.resolve(stream.dialect, init)))
            .transpose()?;

        Ok(NextFragment::Fragment(FragmentRequest {
            stream: id,
            kind: stream.kind,
            uri,
            header_uri,
            needs_header: stream.needs_header,
            discont: stream.discont,
            representation: stream.current_representation,
            format: representation.format(stream.kind),
            fragment,
            timestamp: period.start + stream.to_time(fragment.start),
            duration: units_to_duration(fragment.duration, stream.timescale),
        }))
    }

    /// Commit the cursor of a stream past its next fragment after a successful fetch.
    pub fn advance(&mut self, id: StreamId) -> NagareResult<()> {
        let stream = self.stream_mut(id)?;
        if let Some(fragment) = stream.fragments.get(stream.cursor).copied() {
            stream.last_delivered = Some(fragment);
            stream.cursor += 1;
            stream.needs_header = false;
            stream.discont = false;
        }
        Ok(())
    }

    /// Position every stream on the fragment covering `target`.
    ///
    /// Returns the new fragment index of each stream.
    pub fn seek(&mut self, target: Duration) -> NagareResult<Vec<(StreamId, usize)>> {
        let period_index = self
            .periods
            .iter()
            .rposition(|p| p.start <= target)
            .unwrap_or(0);
        if period_index != self.period_index {
            self.period_index = period_index;
            self.periods[period_index].reset();
        }

        let live = self.live;
        let period = &mut self.periods[period_index];
        let offset = target.saturating_sub(period.start);

        let mut positions = Vec::with_capacity(period.streams.len());
        for stream in period.streams.iter_mut() {
            let units = stream.to_units(offset);
            let index = stream.index_at(units, live);
            stream.reposition(index);
            tracing::debug!(stream = stream.id, kind = %stream.kind, index, "Seeked");
            positions.push((stream.id, index));
        }
        Ok(positions)
    }

    /// Move a stream forward to the last fragment complete at `units`, used to catch up with
    /// the live edge. Never moves the cursor backwards.
    pub fn jump_to(&mut self, id: StreamId, units: u64) -> NagareResult<usize> {
        let stream = self.stream_mut(id)?;
        let index = stream.live_index(units).max(stream.cursor);
        if index != stream.cursor {
            stream.cursor = index;
            stream.discont = true;
        }
        Ok(stream.cursor)
    }

    /// Position every stream of a live presentation at its live edge.
    pub fn seek_live_edge(&mut self, now: DateTime<Utc>) -> NagareResult<()> {
        for id in self.active_streams() {
            if let Some(edge) = self.live_edge(id, now)? {
                let stream = self.stream_mut(id)?;
                let index = stream.live_index(edge);
                stream.reposition(index);
                tracing::debug!(stream = id, index, edge, "Positioned at live edge");
            }
        }
        Ok(())
    }

    /// Append a fragment announced in-band to a live stream.
    ///
    /// Returns `false` when the fragment is not newer than the current tail and was ignored.
    pub fn append_fragment(
        &mut self,
        id: StreamId,
        timestamp: u64,
        duration: u64,
    ) -> NagareResult<bool> {
        let stream = self.stream_mut(id)?;
        let number = match stream.fragments.last() {
            Some(_)
                if stream
                    .fragments
                    .binary_search_by_key(&timestamp, |f| f.start)
                    .is_ok() =>
            {
                tracing::trace!(stream = id, timestamp, "Fragment already known");
                return Ok(false);
            }
            Some(tail) if timestamp <= tail.start => {
                tracing::warn!(
                    stream = id,
                    timestamp,
                    tail = tail.start,
                    "Ignored fragment which is not newer than the stream tail"
                );
                return Ok(false);
            }
            Some(tail) => tail.number + 1,
            None => 0,
        };

        stream.fragments.push(Fragment {
            number,
            start: timestamp,
            duration,
        });
        if stream.end_of_period && !stream.is_exhausted() {
            stream.end_of_period = false;
        }
        tracing::trace!(stream = id, timestamp, duration, "Fragment appended");
        Ok(true)
    }

    /// Replace this manifest by a new revision of the document.
    ///
    /// Every stream resumes right after its last delivered fragment. If that is not possible,
    /// the update is rejected and the current manifest stays untouched.
    pub fn refresh(&mut self, data: &[u8], manifest_url: &Url) -> NagareResult<()> {
        let mut next = Manifest::parse(data, manifest_url)?;
        self.realign(&mut next)?;
        *self = next;
        Ok(())
    }

    fn realign(&self, next: &mut Manifest) -> NagareResult<()> {
        let current = self.current_period();
        let period_index = next
            .periods
            .iter()
            .position(|p| match (&p.id, &current.id) {
                (Some(new), Some(old)) => new == old,
                _ => p.start == current.start,
            })
            .ok_or_else(|| {
                NagareError::Alignment(format!(
                    "period {:?} is missing after manifest update",
                    current.id
                ))
            })?;

        let period = &mut next.periods[period_index];
        if period.streams.len() != current.streams.len() {
            return Err(NagareError::Alignment(format!(
                "stream count changed from {} to {}",
                current.streams.len(),
                period.streams.len()
            )));
        }
        for (new, old) in period.streams.iter_mut().zip(current.streams.iter()) {
            new.align_with(old)?;
        }

        next.period_index = period_index;
        if next.base_urls.len() == self.base_urls.len() {
            next.base_index = self.base_index;
        }
        Ok(())
    }

    /// Select another representation for a stream, effective from its next fragment.
    ///
    /// Returns whether the representation changed.
    pub fn switch_representation(&mut self, id: StreamId, index: usize) -> NagareResult<bool> {
        let stream = self.stream_mut(id)?;
        if index >= stream.representations.len() {
            return Err(NagareError::ManifestParse(format!(
                "stream {id} has no representation {index}"
            )));
        }
        if index == stream.current_representation {
            return Ok(false);
        }

        let from = stream.representation().bitrate;
        stream.current_representation = index;
        stream.needs_header = true;
        tracing::info!(
            stream = id,
            kind = %stream.kind,
            from,
            to = stream.representation().bitrate,
            "Switched representation"
        );
        Ok(true)
    }

    pub fn mark_end_of_period(&mut self, id: StreamId) -> NagareResult<()> {
        self.stream_mut(id)?.end_of_period = true;
        Ok(())
    }

    pub fn mark_end_of_stream(&mut self, id: StreamId) -> NagareResult<()> {
        let stream = self.stream_mut(id)?;
        stream.end_of_period = true;
        stream.end_of_stream = true;
        Ok(())
    }

    /// Live edge of a stream in its timescale units, `None` for static presentations.
    pub fn live_edge(&self, id: StreamId, now: DateTime<Utc>) -> NagareResult<Option<u64>> {
        if !self.live {
            return Ok(None);
        }

        let period = self.current_period();
        let stream = self.stream(id)?;
        match self.availability_start {
            Some(availability_start) if self.format == ManifestFormat::Dash => {
                let since_period_start = now
                    - availability_start
                    - TimeDelta::from_std(period.start)?
                    - TimeDelta::from_std(self.presentation_delay)?;
                let since_period_start = since_period_start.to_std().unwrap_or(Duration::ZERO);
                Ok(Some(stream.to_units(since_period_start)))
            }
            _ => Ok(stream.fragments.last().map(|f| f.end())),
        }
    }

    /// Length of the DVR window of a stream in its timescale units.
    pub fn dvr_window(&self, id: StreamId) -> NagareResult<Option<u64>> {
        let stream = self.stream(id)?;
        Ok(self
            .time_shift_buffer_depth
            .map(|depth| duration_to_units(depth, stream.timescale)))
    }

    /// Generate the fragments of live `SegmentTemplate@duration` streams which became available.
    ///
    /// Returns the number of new fragments.
    pub fn extend_live(&mut self, now: DateTime<Utc>) -> NagareResult<usize> {
        let mut added = 0;
        for id in self.active_streams() {
            let Some(template) = self.stream(id)?.duration_template else {
                continue;
            };
            let Some(edge) = self.live_edge(id, now)? else {
                continue;
            };
            let window = self.dvr_window(id)?;

            let stream = self.stream_mut(id)?;
            let elapsed = edge.saturating_sub(stream.presentation_time_offset);
            let available = elapsed / template.duration;

            let window_start = match window {
                Some(window) => elapsed.saturating_sub(window) / template.duration,
                None => 0,
            };
            let window_start = window_start.max(available.saturating_sub(MAX_GENERATED_FRAGMENTS));
            let tail = stream.fragments.last().copied();
            // an update may have moved startNumber past the generated numbers
            let first = tail
                .and_then(|tail| tail.number.checked_sub(template.start_number))
                .map_or(window_start, |index| index + 1);

            for index in first..available {
                let start = stream.presentation_time_offset + index * template.duration;
                if tail.is_some_and(|tail| start <= tail.start) {
                    continue;
                }
                stream.fragments.push(Fragment {
                    number: template.start_number + index,
                    start,
                    duration: template.duration,
                });
                added += 1;
            }
            if stream.end_of_period && !stream.is_exhausted() {
                stream.end_of_period = false;
            }
        }
        Ok(added)
    }
}

fn root_element(text: &str) -> NagareResult<Option<String>> {
    let mut reader = Reader::from_str(text);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => {
                let name = e.local_name();
                return Ok(Some(String::from_utf8_lossy(name.as_ref()).into_owned()));
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

pub(crate) fn units_to_duration(units: u64, timescale: u64) -> Duration {
    let nanos = units as u128 * 1_000_000_000 / timescale.max(1) as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

pub(crate) fn duration_to_units(time: Duration, timescale: u64) -> u64 {
    let units = time.as_nanos() * timescale as u128 / 1_000_000_000;
    units.min(u64::MAX as u128) as u64
}
