use std::{sync::Arc, time::Duration};

use tokio::{
    sync::Mutex,
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    download::DownloadLoop,
    downloader::Downloader,
    live::Clock,
    manifest::Manifest,
    queue::FragmentQueues,
    sink::FragmentSink,
    stream::{PlaybackPosition, StreamLoop},
    DemuxConfig, NagareError, NagareResult,
};

struct Running<S> {
    cancel: CancellationToken,
    download: JoinHandle<NagareResult<()>>,
    stream: JoinHandle<NagareResult<S>>,
}

enum Finished<S> {
    Download(Result<NagareResult<()>, JoinError>),
    Stream(Result<NagareResult<S>, JoinError>),
}

/// Drives the download and stream loops of one presentation.
///
/// ```no_run
/// # async fn demo() -> nagare::NagareResult<()> {
/// use nagare::{AdaptiveDemux, ChannelSink, DemuxConfig, HttpDownloader};
///
/// let url = "https://example.com/stream.mpd".parse::<url::Url>()?;
/// let mut demux = AdaptiveDemux::open(url, HttpDownloader::default(), DemuxConfig::default()).await?;
/// let (sink, mut events) = ChannelSink::new();
/// demux.start(sink).await?;
/// while let Some(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct AdaptiveDemux<D, S> {
    manifest: Arc<Mutex<Manifest>>,
    manifest_url: Url,
    downloader: Arc<D>,
    config: DemuxConfig,
    clock: Clock,
    queues: FragmentQueues,
    position: PlaybackPosition,
    pending_start: Option<Duration>,
    running: Option<Running<S>>,
    /// Sink handed back by the stream loop when playback failed elsewhere.
    recovered: Option<S>,
}

impl<D, S> AdaptiveDemux<D, S>
where
    D: Downloader,
    S: FragmentSink + 'static,
{
    /// Fetch and parse the manifest at `manifest_url`.
    ///
    /// Live presentations synchronise their clock with the manifest timing sources and start
    /// at the live edge.
    pub async fn open(manifest_url: Url, downloader: D, config: DemuxConfig) -> NagareResult<Self> {
        config.validate()?;
        let downloader = Arc::new(downloader);
        let data = downloader.fetch(&manifest_url).await?;
        let manifest = Manifest::parse(&data, &manifest_url)?;
        tracing::info!(
            url = %manifest_url,
            format = ?manifest.format(),
            live = manifest.is_live(),
            streams = manifest.streams().len(),
            "Manifest loaded"
        );

        let mut clock = Clock::new();
        if manifest.is_live() {
            match clock
                .sync(manifest.timing_sources(), downloader.as_ref())
                .await
            {
                Ok(()) => tracing::debug!(
                    offset_milliseconds = clock.offset().num_milliseconds(),
                    "Clock ready"
                ),
                Err(e) => {
                    tracing::warn!(error = %e, "Clock synchronisation failed, using local time")
                }
            }
        }

        Self::build(manifest, manifest_url, downloader, config, clock)
    }

    /// Use an already parsed manifest.
    pub fn from_manifest(
        manifest: Manifest,
        manifest_url: Url,
        downloader: D,
        config: DemuxConfig,
        clock: Clock,
    ) -> NagareResult<Self> {
        config.validate()?;
        Self::build(manifest, manifest_url, Arc::new(downloader), config, clock)
    }

    fn build(
        mut manifest: Manifest,
        manifest_url: Url,
        downloader: Arc<D>,
        config: DemuxConfig,
        clock: Clock,
    ) -> NagareResult<Self> {
        if manifest.is_live() {
            manifest.extend_live(clock.now())?;
            manifest.seek_live_edge(clock.now())?;
        }

        let queues = FragmentQueues::new(manifest.max_streams(), config.max_buffering_duration());
        Ok(Self {
            manifest: Arc::new(Mutex::new(manifest)),
            manifest_url,
            downloader,
            config,
            clock,
            queues,
            position: PlaybackPosition::default(),
            pending_start: None,
            running: None,
            recovered: None,
        })
    }

    /// Start downloading and pushing data into `sink`. A running demuxer is stopped first.
    pub async fn start(&mut self, sink: S) -> NagareResult<()> {
        if self.running.is_some() {
            self.stop().await?;
        }

        let (primary, active) = {
            let manifest = self.manifest.lock().await;
            (manifest.primary_stream(), manifest.active_streams())
        };

        self.recovered = None;
        self.downloader.reset();
        self.queues.set_flushing(false);
        let cancel = CancellationToken::new();

        let download = DownloadLoop::new(
            self.manifest.clone(),
            self.manifest_url.clone(),
            self.downloader.clone(),
            self.queues.clone(),
            self.config.clone(),
            self.clock.clone(),
            cancel.clone(),
        );
        let stream = StreamLoop::new(self.queues.clone(), sink, primary, active, cancel.clone())
            .fragments_cache(self.config.fragments_cache)
            .start_at(self.pending_start.take())
            .position(self.position.clone());

        tracing::debug!(?primary, "Demuxer started");
        self.running = Some(Running {
            cancel,
            download: tokio::spawn(download.run()),
            stream: tokio::spawn(stream.run()),
        });
        Ok(())
    }

    fn interrupt(&self, cancel: &CancellationToken) {
        cancel.cancel();
        self.downloader.abort_in_flight();
        self.queues.set_flushing(true);
    }

    /// Stop both loops and drop everything queued.
    ///
    /// Returns the sink unless it was consumed by a failure, `None` if the demuxer was not
    /// running.
    pub async fn stop(&mut self) -> NagareResult<Option<S>> {
        let Some(running) = self.running.take() else {
            return Ok(None);
        };

        self.interrupt(&running.cancel);
        if let Err(e) = running.download.await? {
            tracing::debug!(error = %e, "Download loop stopped with error");
        }
        let sink = match running.stream.await? {
            Ok(sink) => Some(sink),
            Err(e) => {
                tracing::warn!(error = %e, "Stream loop stopped with error");
                None
            }
        };
        tracing::debug!("Demuxer stopped");
        Ok(sink)
    }

    /// Restart playback at `target`.
    ///
    /// Every stream continues with the fragment covering `target` and announces `target` as
    /// its start. A target past the end of the presentation ends every stream.
    pub async fn seek(&mut self, target: Duration) -> NagareResult<()> {
        let sink = self.stop().await?;
        self.manifest.lock().await.seek(target)?;
        self.pending_start = Some(target);
        self.position.set(target);
        tracing::info!(?target, "Seeked");

        match sink {
            Some(sink) => self.start(sink).await,
            None => Ok(()),
        }
    }

    /// Wait until every stream has ended or a fatal error occurs, then hand the sink back.
    ///
    /// After a download failure the sink can still be retrieved with
    /// [take_sink](Self::take_sink).
    ///
    /// The demuxer keeps running if this future is dropped before either loop finished.
    pub async fn wait(&mut self) -> NagareResult<S> {
        let finished = {
            let running = self.running.as_mut().ok_or(NagareError::NotStarted)?;
            tokio::select! {
                result = &mut running.download => Finished::Download(result),
                result = &mut running.stream => Finished::Stream(result),
            }
        };
        let running = self.running.take().ok_or(NagareError::NotStarted)?;

        match finished {
            Finished::Download(result) => match result? {
                Ok(()) => running.stream.await?,
                Err(e) => {
                    tracing::error!(error = %e, "Download loop failed");
                    self.interrupt(&running.cancel);
                    if let Ok(Ok(sink)) = running.stream.await {
                        self.recovered = Some(sink);
                    }
                    Err(e)
                }
            },
            Finished::Stream(result) => {
                self.interrupt(&running.cancel);
                if let Err(e) = running.download.await? {
                    tracing::debug!(error = %e, "Download loop stopped with error");
                }
                result?
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// The sink of a playback which [wait](Self::wait) reported as failed.
    pub fn take_sink(&mut self) -> Option<S> {
        self.recovered.take()
    }
}

impl<D: Downloader, S> AdaptiveDemux<D, S> {
    pub fn manifest(&self) -> &Arc<Mutex<Manifest>> {
        &self.manifest
    }

    pub async fn is_live(&self) -> bool {
        self.manifest.lock().await.is_live()
    }

    /// Presentation duration, `None` for live presentations.
    pub async fn duration(&self) -> Option<Duration> {
        self.manifest.lock().await.duration()
    }

    /// Timestamp of the last fragment pushed on the primary stream.
    pub fn position(&self) -> Option<Duration> {
        self.position.get()
    }

    /// Media duration buffered in the fullest queue.
    pub fn buffering_level(&self) -> Duration {
        self.queues.level_time()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

impl<D, S> Drop for AdaptiveDemux<D, S> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            self.queues.set_flushing(true);
        }
    }
}
