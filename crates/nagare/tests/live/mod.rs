use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use nagare::{
    live::Clock,
    manifest::{Manifest, NextFragment},
    sink::SinkEvent,
    AdaptiveDemux, ChannelSink, NagareError,
};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    common::{self, MockDownloader},
    AssertWrapper,
};

const LIVE_MPD: &str = include_str!("../fixtures/dash/live.mpd");
const LIVE_ISM: &str = include_str!("../fixtures/smooth/live.ism");

const TFRF_UUID: [u8; 16] = [
    0xd4, 0x80, 0x7e, 0xf2, 0xca, 0x39, 0x46, 0x95, 0x8e, 0x54, 0x26, 0xcb, 0x9e, 0x46, 0xa7, 0x9f,
];

fn availability_start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn clock_at(milliseconds: i64) -> Clock {
    let mut clock = Clock::new();
    clock.set_now(availability_start() + TimeDelta::milliseconds(milliseconds));
    clock
}

/// A live timeline of `count` fragments of 2s, numbered from `first`.
fn timeline_mpd(first: u64, count: u64) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" availabilityStartTime="2024-01-01T00:00:00Z" timeShiftBufferDepth="PT10S" minimumUpdatePeriod="PT2S" minBufferTime="PT2S">
  <Period id="live" start="PT0S">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1000" initialization="init.mp4" media="$Number$.m4s" startNumber="{first}">
        <SegmentTimeline>
          <S t="{}" d="2000" r="{}"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="video" bandwidth="500000" codecs="avc1.64001f"/>
    </AdaptationSet>
  </Period>
</MPD>"#,
        first * 2000,
        count - 1
    )
}

fn boxed(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut data = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    data.extend_from_slice(kind);
    data.extend_from_slice(payload);
    data
}

/// A fragment announcing the following ones in a version 1 `tfrf` box.
fn announcing(next: &[(u64, u64)]) -> Vec<u8> {
    let mut tfrf = TFRF_UUID.to_vec();
    tfrf.extend_from_slice(&[1, 0, 0, 0]);
    tfrf.push(next.len() as u8);
    for (time, duration) in next {
        tfrf.extend_from_slice(&time.to_be_bytes());
        tfrf.extend_from_slice(&duration.to_be_bytes());
    }
    let mut data = boxed(b"moof", &boxed(b"traf", &boxed(b"uuid", &tfrf)));
    data.extend(boxed(b"mdat", &[0; 16]));
    data
}

/// Collect the first `count` data events.
async fn first_data(
    receiver: &mut UnboundedReceiver<SinkEvent>,
    count: usize,
) -> Vec<(u64, Duration, bool)> {
    let mut data = Vec::new();
    while data.len() < count {
        let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .assert_success()
            .assert_success();
        if let SinkEvent::Data {
            sequence,
            timestamp,
            discont,
            ..
        } = event
        {
            data.push((sequence, timestamp, discont));
        }
    }
    data
}

fn serve_live(downloader: &MockDownloader) {
    downloader.serve("live.mpd", LIVE_MPD);
    downloader.serve("init.mp4", common::payload("init.mp4", 32));
    for number in 40..60 {
        let path = format!("{number}.m4s");
        downloader.serve(&path, common::payload(&path, 128));
    }
}

fn live_dash(
    downloader: &Arc<MockDownloader>,
    clock: Clock,
) -> AdaptiveDemux<Arc<MockDownloader>, ChannelSink> {
    serve_live(downloader);
    AdaptiveDemux::from_manifest(
        common::manifest(LIVE_MPD, "live.mpd"),
        common::url("live.mpd"),
        downloader.clone(),
        common::config(),
        clock,
    )
    .unwrap()
}

#[tokio::test]
async fn test_dash_starts_at_live_edge() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    let mut demux = live_dash(&downloader, clock_at(100_500));
    assert!(demux.is_live().await);
    assert_eq!(demux.duration().await, None);
    {
        let manifest = demux.manifest().lock().await;
        let stream = manifest.stream(0)?;
        // the 10s window ending at the live edge
        assert_eq!(stream.fragments().len(), 5);
        assert_eq!(stream.fragments()[stream.cursor()].number, 49);
    }

    let (sink, mut receiver) = common::channel();
    demux.start(sink).await?;
    let data = first_data(&mut receiver, 1).await;
    assert_eq!(data, vec![(49, Duration::from_secs(98), true)]);

    demux.stop().await?;
    assert_eq!(downloader.request_count("45.m4s"), 0);
    Ok(())
}

#[tokio::test]
async fn test_dash_catches_up_with_live_edge() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    let mut demux = live_dash(&downloader, clock_at(100_500));

    // the start of the window is already older than the DVR window when fetched
    demux.seek(Duration::ZERO).await?;
    let (sink, mut receiver) = common::channel();
    demux.start(sink).await?;

    let data = first_data(&mut receiver, 1).await;
    assert_eq!(data[0].0, 49);
    assert!(data[0].2);

    demux.stop().await?;
    assert_eq!(downloader.request_count("45.m4s"), 0);
    Ok(())
}

#[tokio::test]
async fn test_smooth_appends_announced_fragments() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    let fragment = |start: u64| format!("big.ism/QualityLevels(350000)/Fragments(video={start})");
    downloader.serve(&fragment(120_000_000), announcing(&[(140_000_000, 20_000_000)]));
    downloader.serve(&fragment(140_000_000), announcing(&[]));

    let mut demux = AdaptiveDemux::from_manifest(
        common::manifest(LIVE_ISM, "big.ism/Manifest"),
        common::url("big.ism/Manifest"),
        downloader.clone(),
        common::config(),
        Clock::new(),
    )?;
    let (sink, mut receiver) = common::channel();
    demux.start(sink).await?;

    let data = first_data(&mut receiver, 2).await;
    assert_eq!(
        data,
        vec![
            (1, Duration::from_secs(12), true),
            (2, Duration::from_secs(14), false)
        ]
    );

    demux.stop().await?;
    assert_eq!(downloader.request_count(&fragment(100_000_000)), 0);
    {
        let manifest = demux.manifest().lock().await;
        assert_eq!(manifest.stream(0)?.fragments().len(), 3);
    }
    Ok(())
}

#[tokio::test]
async fn test_refresh_resumes_after_last_delivered() -> anyhow::Result<()> {
    let url = common::url("live.mpd");
    let mut manifest = Manifest::parse(timeline_mpd(0, 5).as_bytes(), &url)?;
    manifest.advance(0)?;
    manifest.advance(0)?;

    manifest.refresh(timeline_mpd(1, 6).as_bytes(), &url)?;
    let stream = manifest.stream(0)?;
    assert_eq!(stream.fragments()[stream.cursor()].number, 2);
    let NextFragment::Fragment(next) = manifest.next_fragment(0)? else {
        panic!("expected a fragment after the update");
    };
    assert!(next.uri.as_str().ends_with("/2.m4s"));
    Ok(())
}

#[tokio::test]
async fn test_refresh_rejects_update_before_last_delivered() -> anyhow::Result<()> {
    let url = common::url("live.mpd");
    let mut manifest = Manifest::parse(timeline_mpd(0, 5).as_bytes(), &url)?;
    manifest.advance(0)?;
    manifest.advance(0)?;

    let result = manifest.refresh(timeline_mpd(0, 1).as_bytes(), &url);
    assert!(matches!(result, Err(NagareError::Alignment(_))));
    let stream = manifest.stream(0)?;
    assert_eq!(stream.fragments().len(), 5);
    assert_eq!(stream.cursor(), 2);
    Ok(())
}

#[tokio::test]
async fn test_smooth_refresh_keeps_sequence_numbers() -> anyhow::Result<()> {
    let url = common::url("big.ism/Manifest");
    let mut manifest = common::manifest(LIVE_ISM, "big.ism/Manifest");
    manifest.seek(Duration::from_secs(12))?;
    manifest.advance(0)?;
    assert!(manifest.append_fragment(0, 140_000_000, 20_000_000)?);

    let moved = LIVE_ISM.replace(
        r#"<c t="100000000" d="20000000" r="2"/>"#,
        r#"<c t="120000000" d="20000000" r="3"/>"#,
    );
    manifest.refresh(moved.as_bytes(), &url)?;
    {
        let stream = manifest.stream(0)?;
        let numbers: Vec<_> = stream.fragments().iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(stream.fragments()[stream.cursor()].number, 2);
    }

    let stale = LIVE_ISM.replace(
        r#"<c t="100000000" d="20000000" r="2"/>"#,
        r#"<c t="0" d="20000000" r="4"/>"#,
    );
    let result = manifest.refresh(stale.as_bytes(), &url);
    assert!(matches!(result, Err(NagareError::Alignment(_))));
    assert_eq!(manifest.stream(0)?.fragments().len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_smooth_ignores_known_announcements() -> anyhow::Result<()> {
    let mut manifest = common::manifest(LIVE_ISM, "big.ism/Manifest");
    assert!(!manifest.append_fragment(0, 120_000_000, 20_000_000)?);
    assert!(!manifest.append_fragment(0, 100_000_000, 20_000_000)?);
    assert_eq!(manifest.stream(0)?.fragments().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_generated_fragments_follow_start_number_change() -> anyhow::Result<()> {
    let url = common::url("live.mpd");
    let mut manifest = common::manifest(LIVE_MPD, "live.mpd");
    manifest.extend_live(availability_start() + TimeDelta::milliseconds(100_500))?;
    assert_eq!(manifest.stream(0)?.fragments().len(), 5);

    let renumbered = LIVE_MPD.replace(r#"startNumber="0""#, r#"startNumber="100""#);
    manifest.refresh(renumbered.as_bytes(), &url)?;
    let added = manifest.extend_live(availability_start() + TimeDelta::milliseconds(104_500))?;
    assert_eq!(added, 2);

    let fragments = manifest.stream(0)?.fragments();
    assert!(fragments.windows(2).all(|w| w[0].start < w[1].start));
    assert_eq!(fragments.last().map(|f| f.start), Some(102_000));
    Ok(())
}

#[tokio::test]
async fn test_playback_survives_failed_manifest_update() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    let fast = LIVE_MPD.replace(r#"minimumUpdatePeriod="PT2S""#, r#"minimumUpdatePeriod="PT0.5S""#);
    serve_live(&downloader);
    downloader.serve("live.mpd", fast.clone());
    downloader.fail("live.mpd", 1000);

    let mut demux = AdaptiveDemux::from_manifest(
        common::manifest(&fast, "live.mpd"),
        common::url("live.mpd"),
        downloader.clone(),
        common::config(),
        clock_at(101_900),
    )?;
    let (sink, mut receiver) = common::channel();
    demux.start(sink).await?;

    let data = first_data(&mut receiver, 3).await;
    let sequences: Vec<_> = data.iter().map(|(sequence, ..)| *sequence).collect();
    assert_eq!(sequences, vec![49, 50, 51]);

    demux.stop().await?;
    assert!(downloader.request_count("live.mpd") >= 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_missing_published_fragment_spends_retries() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    let mut demux = live_dash(&downloader, clock_at(100_500));
    downloader.fail("49.m4s", 1000);

    let (sink, _receiver) = common::channel();
    demux.start(sink).await?;
    let result = tokio::time::timeout(Duration::from_secs(60), demux.wait()).await?;
    assert!(matches!(result, Err(NagareError::ResourceNotFound(uri)) if uri.ends_with("49.m4s")));
    assert_eq!(downloader.request_count("49.m4s"), 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stale_window_gives_up() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    let stale = timeline_mpd(0, 10);
    downloader.serve("live.mpd", stale.clone());
    downloader.serve("init.mp4", common::payload("init.mp4", 32));

    let mut demux = AdaptiveDemux::from_manifest(
        common::manifest(&stale, "live.mpd"),
        common::url("live.mpd"),
        downloader.clone(),
        common::config(),
        clock_at(100_000),
    )?;
    let (sink, _receiver) = common::channel();
    demux.start(sink).await?;

    let result = tokio::time::timeout(Duration::from_secs(60), demux.wait()).await?;
    assert!(matches!(result, Err(NagareError::ResourceNotFound(_))));
    assert!(!downloader.requests().iter().any(|uri| uri.ends_with(".m4s")));
    assert!(downloader.request_count("live.mpd") >= 1);
    Ok(())
}
