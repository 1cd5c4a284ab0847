use nagare::NagareError;

use super::demux;
use crate::common::{self, MockDownloader};

const VOD: &str = include_str!("../fixtures/dash/vod.mpd");

const MIRRORED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT6S" minBufferTime="PT2S">
  <BaseURL>primary/</BaseURL>
  <BaseURL>backup/</BaseURL>
  <Period id="main" start="PT0S">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1000" initialization="video/init.mp4" media="video/$Number$.m4s" startNumber="1" duration="2000"/>
      <Representation id="video" bandwidth="500000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

#[tokio::test]
async fn test_retry_recovers() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    downloader.serve_fragments("video-500k", 1, 3, 256);
    downloader.fail("video-500k/2.m4s", 2);

    let mut demux = demux(VOD, "vod.mpd", &downloader, common::config());
    let (sink, mut receiver) = common::channel();
    demux.start(sink).await?;
    demux.wait().await?;

    let events = common::drain(&mut receiver);
    assert_eq!(common::sequences(&events, 0), vec![1, 2, 3]);
    assert_eq!(downloader.request_count("video-500k/2.m4s"), 3);
    Ok(())
}

#[tokio::test]
async fn test_retries_exhausted() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    downloader.serve_fragments("video-500k", 1, 3, 256);
    downloader.fail("video-500k/2.m4s", usize::MAX);

    let config = common::config().fragment_retries(2);
    let mut demux = demux(VOD, "vod.mpd", &downloader, config);
    let (sink, mut receiver) = common::channel();
    demux.start(sink).await?;

    let result = demux.wait().await;
    assert!(matches!(result, Err(NagareError::ResourceNotFound(uri)) if uri.ends_with("video-500k/2.m4s")));
    assert_eq!(downloader.request_count("video-500k/2.m4s"), 3);
    assert_eq!(downloader.request_count("video-500k/3.m4s"), 0);
    assert!(demux.take_sink().is_some());

    let events = common::drain(&mut receiver);
    assert!(!common::sequences(&events, 0).contains(&2));
    assert!(!events
        .iter()
        .any(|e| matches!(e, nagare::SinkEvent::EndOfStream)));
    Ok(())
}

#[tokio::test]
async fn test_failover_to_alternate_base() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    downloader.serve_fragments("primary/video", 1, 3, 256);
    downloader.serve_fragments("backup/video", 1, 3, 256);
    downloader.fail("primary/video/2.m4s", usize::MAX);

    let config = common::config().fragment_retries(1);
    let mut demux = demux(MIRRORED, "mirrored.mpd", &downloader, config);
    let (sink, mut receiver) = common::channel();
    demux.start(sink).await?;
    demux.wait().await?;

    let events = common::drain(&mut receiver);
    assert_eq!(common::sequences(&events, 0), vec![1, 2, 3]);
    assert_eq!(downloader.request_count("primary/video/2.m4s"), 2);
    assert_eq!(downloader.request_count("backup/video/2.m4s"), 1);
    assert_eq!(downloader.request_count("backup/video/3.m4s"), 1);
    assert_eq!(downloader.request_count("primary/video/3.m4s"), 0);
    Ok(())
}

#[tokio::test]
async fn test_primary_rejection_stops_playback() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    downloader.serve_fragments("video-500k", 1, 3, 256);

    let mut demux = demux(VOD, "vod.mpd", &downloader, common::config());
    let (sink, receiver) = common::channel();
    drop(receiver);
    demux.start(sink).await?;

    let result = demux.wait().await;
    assert!(matches!(
        result,
        Err(NagareError::DownstreamRejected { stream: 0, .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_wait_without_start() {
    let downloader = MockDownloader::new();
    let mut demux = demux::<nagare::ChannelSink>(VOD, "vod.mpd", &downloader, common::config());
    assert!(matches!(demux.wait().await, Err(NagareError::NotStarted)));
}
