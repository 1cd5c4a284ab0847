//! Microsoft Smooth Streaming client manifest parsing
//!
//! ```xml
//! <SmoothStreamingMedia MajorVersion="2" MinorVersion="0" Duration="..." TimeScale="10000000">
//!   <StreamIndex Type="video" Url="QualityLevels({bitrate})/Fragments(video={start time})">
//!     <QualityLevel Index="0" Bitrate="230000" FourCC="H264" CodecPrivateData="..."/>
//!     <c t="0" d="20000000" r="3"/>
//!   </StreamIndex>
//! </SmoothStreamingMedia>
//! ```
use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};
use url::Url;

use super::{
    template::TemplateDialect, units_to_duration, Fragment, Manifest, ManifestFormat, Period,
    Representation, Stream, StreamKind,
};
use crate::{NagareError, NagareResult};

pub(crate) const DEFAULT_TIMESCALE: u64 = 10_000_000;

type Attributes = HashMap<String, String>;

fn attributes(element: &BytesStart) -> NagareResult<Attributes> {
    let mut map = HashMap::new();
    for attr in element.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        map.insert(key, value);
    }
    Ok(map)
}

fn number<T: std::str::FromStr>(attributes: &Attributes, key: &str) -> NagareResult<Option<T>> {
    attributes
        .get(key)
        .map(|value| {
            value.trim().parse().map_err(|_| {
                NagareError::ManifestParse(format!("Invalid {key} attribute: {value:?}"))
            })
        })
        .transpose()
}

struct Chunk {
    time: Option<u64>,
    duration: Option<u64>,
    repeat: u64,
}

struct StreamIndex {
    kind: Option<StreamKind>,
    name: Option<String>,
    lang: Option<String>,
    timescale: u64,
    url: String,
    subtype: Option<String>,
    quality_levels: Vec<Representation>,
    chunks: Vec<Chunk>,
}

impl StreamIndex {
    fn from_attributes(attributes: Attributes, timescale: u64) -> NagareResult<Self> {
        let kind = match attributes.get("Type").map(String::as_str) {
            Some("video") => Some(StreamKind::Video),
            Some("audio") => Some(StreamKind::Audio),
            Some("text") => Some(StreamKind::Text),
            Some(_) => None,
            None => {
                return Err(NagareError::ManifestParse(
                    "StreamIndex without Type".to_string(),
                ))
            }
        };

        Ok(Self {
            kind,
            timescale: number(&attributes, "TimeScale")?.unwrap_or(timescale),
            name: attributes.get("Name").cloned(),
            lang: attributes.get("Language").cloned(),
            subtype: attributes.get("Subtype").cloned(),
            url: attributes.get("Url").cloned().ok_or_else(|| {
                NagareError::ManifestParse("StreamIndex without Url".to_string())
            })?,
            quality_levels: Vec::new(),
            chunks: Vec::new(),
        })
    }

    fn push_quality_level(&mut self, attributes: Attributes) -> NagareResult<()> {
        let bitrate = number(&attributes, "Bitrate")?.ok_or_else(|| {
            NagareError::ManifestParse("QualityLevel without Bitrate".to_string())
        })?;

        let mut representation = Representation::new(bitrate, self.url.clone());
        representation.id = attributes.get("Index").cloned();
        representation.codec = attributes
            .get("FourCC")
            .filter(|fourcc| !fourcc.is_empty())
            .or(self.subtype.as_ref())
            .cloned();
        representation.codec_private = attributes
            .get("CodecPrivateData")
            .filter(|data| !data.is_empty())
            .map(|data| hex::decode(data.trim()).map(Bytes::from))
            .transpose()?;
        representation.width = match number(&attributes, "MaxWidth")? {
            Some(width) => Some(width),
            None => number(&attributes, "Width")?,
        };
        representation.height = match number(&attributes, "MaxHeight")? {
            Some(height) => Some(height),
            None => number(&attributes, "Height")?,
        };
        representation.sampling_rate = number(&attributes, "SamplingRate")?;
        representation.channels = number(&attributes, "Channels")?;

        self.quality_levels.push(representation);
        Ok(())
    }

    fn push_chunk(&mut self, attributes: Attributes) -> NagareResult<()> {
        self.chunks.push(Chunk {
            time: number(&attributes, "t")?,
            duration: number(&attributes, "d")?,
            // c@r counts every fragment, including the first one
            repeat: number(&attributes, "r")?.unwrap_or(1).max(1),
        });
        Ok(())
    }

    fn fragments(&self) -> NagareResult<Vec<Fragment>> {
        let mut fragments = Vec::with_capacity(self.chunks.len());
        let mut time = 0;

        for (index, chunk) in self.chunks.iter().enumerate() {
            let start = chunk.time.unwrap_or(time);
            let duration = match chunk.duration {
                Some(duration) => duration,
                None => self
                    .chunks
                    .get(index + 1)
                    .and_then(|next| next.time)
                    .filter(|next| *next > start)
                    .map(|next| (next - start) / chunk.repeat)
                    .ok_or_else(|| {
                        NagareError::ManifestParse(format!("Fragment at {start} has no duration"))
                    })?,
            };

            time = start;
            for _ in 0..chunk.repeat {
                fragments.push(Fragment {
                    number: fragments.len() as u64,
                    start: time,
                    duration,
                });
                time += duration;
            }
        }

        Ok(fragments)
    }

    fn build(self, id: usize) -> NagareResult<Option<Stream>> {
        let Some(kind) = self.kind else {
            tracing::debug!(name = ?self.name, "Skipping StreamIndex of unsupported type");
            return Ok(None);
        };
        if self.quality_levels.is_empty() {
            tracing::warn!(name = ?self.name, "Skipping StreamIndex without QualityLevel");
            return Ok(None);
        }

        let fragments = self.fragments()?;
        let stream = Stream::new(
            id,
            kind,
            self.timescale,
            TemplateDialect::Smooth,
            self.quality_levels,
            fragments,
        )?
        .with_name(self.name, self.lang);
        Ok(Some(stream))
    }
}

pub(super) fn parse(text: &str, manifest_url: &Url) -> NagareResult<Manifest> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut media: Option<Attributes> = None;
    let mut timescale = DEFAULT_TIMESCALE;
    let mut current: Option<StreamIndex> = None;
    let mut streams = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"SmoothStreamingMedia" => {
                    let attributes = attributes(&e)?;
                    timescale = number(&attributes, "TimeScale")?.unwrap_or(DEFAULT_TIMESCALE);
                    media = Some(attributes);
                }
                b"StreamIndex" => {
                    current = Some(StreamIndex::from_attributes(attributes(&e)?, timescale)?);
                }
                b"QualityLevel" => {
                    if let Some(stream) = current.as_mut() {
                        stream.push_quality_level(attributes(&e)?)?;
                    }
                }
                b"c" => {
                    if let Some(stream) = current.as_mut() {
                        stream.push_chunk(attributes(&e)?)?;
                    }
                }
                _ => {}
            },
            Event::End(e) if e.local_name().as_ref() == b"StreamIndex" => {
                if let Some(stream) = current.take() {
                    if let Some(stream) = stream.build(streams.len())? {
                        streams.push(stream);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let media = media.ok_or_else(|| {
        NagareError::ManifestParse("Missing SmoothStreamingMedia element".to_string())
    })?;
    let live = media
        .get("IsLive")
        .is_some_and(|value| value.eq_ignore_ascii_case("true"));
    let duration = number::<u64>(&media, "Duration")?
        .filter(|d| *d > 0)
        .map(|d| units_to_duration(d, timescale));
    // a zero window means the whole presentation stays available
    let dvr_window = number::<u64>(&media, "DVRWindowLength")?
        .filter(|d| *d > 0)
        .map(|d| units_to_duration(d, timescale));

    let period = Period::new(None, Duration::ZERO, duration, streams);
    let mut manifest = Manifest::new(
        ManifestFormat::SmoothStreaming,
        vec![manifest_url.clone()],
        vec![period],
    );
    manifest.live = live;
    manifest.duration = duration;
    manifest.time_shift_buffer_depth = dvr_window;
    Ok(manifest)
}
