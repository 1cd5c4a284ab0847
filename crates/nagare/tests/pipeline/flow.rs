use std::{sync::Arc, time::Duration};

use nagare::{sink::SinkEvent, FragmentSink, NagareResult, StreamKind};
use tokio::sync::{mpsc, Semaphore};

use super::demux;
use crate::{
    common::{self, MockDownloader},
    AssertWrapper,
};

const VOD: &str = include_str!("../fixtures/dash/vod.mpd");
const ABR: &str = include_str!("../fixtures/dash/abr.mpd");
const AV: &str = include_str!("../fixtures/dash/av.mpd");
const MULTI_PERIOD: &str = include_str!("../fixtures/dash/multi-period.mpd");
const SMOOTH_VOD: &str = include_str!("../fixtures/smooth/vod.ism");

#[tokio::test]
async fn test_vod_single_stream() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    downloader.serve_fragments("video-500k", 1, 3, 512);

    let mut demux = demux(VOD, "vod.mpd", &downloader, common::config());
    let (sink, mut receiver) = common::channel();
    demux.start(sink).await?;
    demux.wait().await?;

    let events = common::drain(&mut receiver);
    assert_eq!(events.len(), 6);
    assert!(matches!(
        events[0],
        SinkEvent::StreamStart {
            stream: 0,
            kind: StreamKind::Video,
            start
        } if start.is_zero()
    ));
    match &events[1] {
        SinkEvent::Format { stream: 0, format } => {
            assert_eq!(format.bitrate, 500_000);
            assert_eq!(format.codec.as_deref(), Some("avc1.64001f"));
            assert_eq!(format.width, Some(640));
        }
        other => panic!("expected format, got {other:?}"),
    }
    assert_eq!(common::sequences(&events, 0), vec![1, 2, 3]);
    assert!(matches!(events[5], SinkEvent::EndOfStream));

    // the first fragment is prefixed by the initialization segment
    match &events[2] {
        SinkEvent::Data { data, discont, .. } => {
            assert!(data.starts_with(b"video-500k/init.mp4"));
            assert_eq!(data.len(), 32 + 512);
            assert!(*discont);
        }
        other => panic!("expected data, got {other:?}"),
    }
    assert_eq!(downloader.request_count("video-500k/init.mp4"), 1);
    assert_eq!(demux.position(), Some(Duration::from_secs(4)));
    Ok(())
}

#[tokio::test]
async fn test_seek_announces_target() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    downloader.serve_fragments("video-500k", 1, 3, 512);

    let mut demux = demux(VOD, "vod.mpd", &downloader, common::config());
    demux.seek(Duration::from_millis(3500)).await?;
    assert_eq!(demux.position(), Some(Duration::from_millis(3500)));

    let (sink, mut receiver) = common::channel();
    demux.start(sink).await?;
    demux.wait().await?;

    let events = common::drain(&mut receiver);
    assert!(matches!(
        events[0],
        SinkEvent::StreamStart { start, .. } if start == Duration::from_millis(3500)
    ));
    assert_eq!(common::sequences(&events, 0), vec![2, 3]);
    assert_eq!(downloader.request_count("video-500k/1.m4s"), 0);
    Ok(())
}

#[tokio::test]
async fn test_seek_past_end() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    downloader.serve_fragments("video-500k", 1, 3, 512);

    let mut demux = demux(VOD, "vod.mpd", &downloader, common::config());
    demux.seek(Duration::from_secs(30)).await?;
    let (sink, mut receiver) = common::channel();
    demux.start(sink).await?;
    demux.wait().await?;

    let events = common::drain(&mut receiver);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], SinkEvent::EndOfStream));
    Ok(())
}

// frozen time makes every download look instantaneous
#[tokio::test(start_paused = true)]
async fn test_single_switch_emits_one_new_format() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    downloader.serve_fragments("video-500k", 1, 4, 4096);
    downloader.serve_fragments("video-1m", 1, 4, 4096);

    let mut demux = demux(ABR, "abr.mpd", &downloader, common::config());
    let (sink, mut receiver) = common::channel();
    demux.start(sink).await?;
    demux.wait().await?;

    let events = common::drain(&mut receiver);
    assert_eq!(common::formats(&events), 2);
    assert_eq!(common::sequences(&events, 0), vec![1, 2, 3, 4]);

    let bitrates: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            SinkEvent::Format { format, .. } => Some(format.bitrate),
            _ => None,
        })
        .collect();
    assert_eq!(bitrates, vec![500_000, 1_000_000]);
    assert_eq!(downloader.request_count("video-500k/1.m4s"), 1);
    assert_eq!(downloader.request_count("video-1m/init.mp4"), 1);
    assert_eq!(downloader.request_count("video-1m/2.m4s"), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_bitrate_cap() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    downloader.serve_fragments("video-500k", 1, 4, 4096);
    downloader.serve_fragments("video-1m", 1, 4, 4096);

    let config = common::config().max_bitrate(Some(800_000));
    let mut demux = demux(ABR, "abr.mpd", &downloader, config);
    let (sink, mut receiver) = common::channel();
    demux.start(sink).await?;
    demux.wait().await?;

    let events = common::drain(&mut receiver);
    assert_eq!(common::formats(&events), 1);
    assert_eq!(downloader.request_count("video-1m/init.mp4"), 0);
    Ok(())
}

#[tokio::test]
async fn test_audio_video_interleaved() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    downloader.serve_fragments("video", 1, 3, 256);
    downloader.serve_fragments("audio", 1, 3, 64);

    let mut demux = demux(AV, "av.mpd", &downloader, common::config());
    let (sink, mut receiver) = common::channel();
    demux.start(sink).await?;
    demux.wait().await?;

    let events = common::drain(&mut receiver);
    assert_eq!(common::sequences(&events, 0), vec![1, 2, 3]);
    assert_eq!(common::sequences(&events, 1), vec![1, 2, 3]);

    // every stream starts before its data and there is a single end of stream, last
    for stream in [0, 1] {
        let start = events
            .iter()
            .position(|e| matches!(e, SinkEvent::StreamStart { stream: s, .. } if *s == stream))
            .assert_success();
        let data = events
            .iter()
            .position(|e| matches!(e, SinkEvent::Data { stream: s, .. } if *s == stream))
            .assert_success();
        assert!(start < data);
    }
    let ends: Vec<_> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, SinkEvent::EndOfStream))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(ends, vec![events.len() - 1]);

    // fetches alternate between the streams
    let fragments: Vec<_> = downloader
        .requests()
        .into_iter()
        .filter(|r| r.ends_with(".m4s"))
        .collect();
    assert_eq!(fragments.len(), 6);
    assert!(fragments[0].ends_with("video/1.m4s"));
    assert!(fragments[1].ends_with("audio/1.m4s"));
    Ok(())
}

#[tokio::test]
async fn test_multi_period() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    downloader.serve_fragments("intro", 1, 2, 256);
    downloader.serve_fragments("feature", 1, 2, 256);

    let mut demux = demux(MULTI_PERIOD, "multi-period.mpd", &downloader, common::config());
    let (sink, mut receiver) = common::channel();
    demux.start(sink).await?;
    demux.wait().await?;

    let events = common::drain(&mut receiver);
    let starts: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            SinkEvent::StreamStart { start, .. } => Some(*start),
            _ => None,
        })
        .collect();
    assert_eq!(starts, vec![Duration::ZERO, Duration::from_secs(4)]);
    assert_eq!(common::formats(&events), 2);
    assert_eq!(common::sequences(&events, 0), vec![1, 2, 1, 2]);
    assert_eq!(downloader.request_count("feature/init.mp4"), 1);
    Ok(())
}

#[tokio::test]
async fn test_smooth_vod() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    for start in [0u64, 20_000_000, 40_000_000] {
        for path in [
            format!("big.ism/QualityLevels(350000)/Fragments(video={start})"),
            format!("big.ism/QualityLevels(1500000)/Fragments(video={start})"),
            format!("big.ism/QualityLevels(64000)/Fragments(audio={start})"),
        ] {
            downloader.serve(&path, common::payload(&path, 128));
        }
    }

    // slow enough to never switch up
    let config = common::config().max_bitrate(Some(400_000));
    let mut demux = demux(SMOOTH_VOD, "big.ism/Manifest", &downloader, config);
    let (sink, mut receiver) = common::channel();
    demux.start(sink).await?;
    demux.wait().await?;

    let events = common::drain(&mut receiver);
    assert_eq!(common::sequences(&events, 0), vec![0, 1, 2]);
    assert_eq!(common::sequences(&events, 1), vec![0, 1, 2]);
    let private = events.iter().find_map(|event| match event {
        SinkEvent::Format { stream: 1, format } => format.codec_private.clone(),
        _ => None,
    });
    assert_eq!(private.as_deref(), Some(&[0x12, 0x10][..]));
    Ok(())
}

/// Accepts data only when a permit is available.
struct GatedSink {
    gate: Arc<Semaphore>,
    sender: mpsc::UnboundedSender<SinkEvent>,
}

impl FragmentSink for GatedSink {
    async fn push(&mut self, event: SinkEvent) -> NagareResult<()> {
        if matches!(event, SinkEvent::Data { .. }) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[tokio::test]
async fn test_backpressure() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    downloader.serve_fragments("video-500k", 1, 3, 512);

    let config = common::config().max_buffering_time(Duration::from_secs(2));
    let mut demux = demux::<GatedSink>(VOD, "vod.mpd", &downloader, config);
    let gate = Arc::new(Semaphore::new(0));
    let (sender, mut receiver) = mpsc::unbounded_channel();
    demux
        .start(GatedSink {
            gate: gate.clone(),
            sender,
        })
        .await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(downloader.request_count("video-500k/2.m4s"), 1);
    assert_eq!(downloader.request_count("video-500k/3.m4s"), 0);
    assert_eq!(demux.buffering_level(), Duration::from_secs(2));

    gate.add_permits(3);
    demux.wait().await?;
    assert_eq!(downloader.request_count("video-500k/3.m4s"), 1);

    let events = common::drain(&mut receiver);
    assert_eq!(common::sequences(&events, 0), vec![1, 2, 3]);
    Ok(())
}

#[tokio::test]
async fn test_stop_returns_sink() -> anyhow::Result<()> {
    let downloader = MockDownloader::new();
    downloader.serve_fragments("video-500k", 1, 3, 512);

    let config = common::config().max_buffering_time(Duration::from_secs(2));
    let mut demux = demux::<GatedSink>(VOD, "vod.mpd", &downloader, config);
    let gate = Arc::new(Semaphore::new(0));
    let (sender, _receiver) = mpsc::unbounded_channel();
    demux
        .start(GatedSink {
            gate: gate.clone(),
            sender,
        })
        .await?;
    assert!(demux.is_running());

    tokio::time::sleep(Duration::from_millis(50)).await;
    // unblock the pending push so the stream loop can observe the cancellation
    gate.add_permits(1);
    let sink = demux.stop().await?;
    assert!(sink.is_some());
    assert!(!demux.is_running());
    assert_eq!(demux.buffering_level(), Duration::ZERO);
    Ok(())
}
