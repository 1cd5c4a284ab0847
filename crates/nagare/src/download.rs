//! The producer side of the pipeline.
//!
//! ```text
//!        ┌──────────────────────────────────────────────────────┐
//!        ▼                                                      │
//! ManifestCheck ─► Backpressure ─► RepresentationReselect ─► FetchNext
//!                                                               │
//!                     ┌──────────┬──────────────┬───────────────┤
//!                     ▼          ▼              ▼               ▼
//!                 Enqueued   EndOfPeriod     Retrying         Fatal
//! ```
use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    downloader::Downloader,
    live::{Clock, LivePosition, LiveTimingReconciler},
    manifest::{FragmentRequest, Manifest, ManifestFormat, NextFragment},
    piff,
    queue::{ControlEvent, FragmentQueues, MediaFragment, QueueItem},
    rate::RateTracker,
    selector::RepresentationSelector,
    DemuxConfig, NagareError, NagareResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Fetch the same fragment again.
    Retry,
    /// The retry budget is spent, continue on the next alternate base url.
    SwitchedBase,
    /// Nothing left to try.
    Fatal,
}

/// Retry budget shared by every stream of a manifest.
#[derive(Debug, Clone)]
pub struct FailurePolicy {
    retries: u32,
    failures: u32,
    fatal: bool,
}

impl FailurePolicy {
    pub fn new(retries: u32) -> Self {
        Self {
            retries,
            failures: 0,
            fatal: false,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn on_success(&mut self) {
        self.failures = 0;
    }

    /// Record a failed fetch. `switch_base` is asked for an alternate base url once the
    /// budget is spent.
    ///
    /// Returns `None` once [FailureAction::Fatal] has been reported.
    pub fn on_failure(&mut self, switch_base: impl FnOnce() -> bool) -> Option<FailureAction> {
        if self.fatal {
            return None;
        }

        self.failures += 1;
        if self.failures <= self.retries {
            return Some(FailureAction::Retry);
        }

        if switch_base() {
            self.failures = 0;
            Some(FailureAction::SwitchedBase)
        } else {
            self.fatal = true;
            Some(FailureAction::Fatal)
        }
    }
}

enum Step {
    Continue,
    Finished,
}

pub struct DownloadLoop<D> {
    manifest: Arc<Mutex<Manifest>>,
    manifest_url: Url,
    downloader: Arc<D>,
    queues: FragmentQueues,
    config: DemuxConfig,
    clock: Clock,
    cancel: CancellationToken,

    rate: RateTracker,
    selector: RepresentationSelector,
    policy: FailurePolicy,
    last_manifest_check: Instant,
}

impl<D: Downloader> DownloadLoop<D> {
    pub fn new(
        manifest: Arc<Mutex<Manifest>>,
        manifest_url: Url,
        downloader: Arc<D>,
        queues: FragmentQueues,
        config: DemuxConfig,
        clock: Clock,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manifest,
            manifest_url,
            downloader,
            queues,
            rate: RateTracker::from_config(&config),
            selector: RepresentationSelector::from_config(&config),
            policy: FailurePolicy::new(config.fragment_retries),
            last_manifest_check: Instant::now(),
            config,
            clock,
            cancel,
        }
    }

    /// Run until every stream is finished, the loop is cancelled or a fatal error occurs.
    pub async fn run(mut self) -> NagareResult<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            self.check_manifest().await;

            if self.queues.any_full() {
                tracing::debug!(
                    level = ?self.queues.level_time(),
                    "Buffer full, waiting for the stream loop"
                );
                let resumed = tokio::select! {
                    _ = self.cancel.cancelled() => false,
                    resumed = self.queues.wait_for_space() => resumed,
                };
                if !resumed {
                    return Ok(());
                }
                continue;
            }

            self.reselect().await?;

            match self.fetch_next().await? {
                Step::Continue => {}
                Step::Finished => return Ok(()),
            }
        }
    }

    /// Sleep unless cancelled first, returns `false` on cancellation.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn update_interval(&self) -> Option<Duration> {
        let manifest = self.manifest.lock().await;
        manifest.is_live().then(|| {
            manifest
                .minimum_update_interval()
                .unwrap_or_else(|| self.config.live_poll_duration())
        })
    }

    async fn check_manifest(&mut self) {
        let Some(interval) = self.update_interval().await else {
            return;
        };

        if self.last_manifest_check.elapsed() >= interval {
            self.last_manifest_check = Instant::now();
            match self.downloader.fetch(&self.manifest_url).await {
                Ok(data) => {
                    let mut manifest = self.manifest.lock().await;
                    match manifest.refresh(&data, &self.manifest_url) {
                        Ok(()) => tracing::debug!("Manifest updated"),
                        Err(e) => tracing::warn!(error = %e, "Manifest update rejected, keeping the current one"),
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to fetch manifest update"),
            }
        }

        let mut manifest = self.manifest.lock().await;
        match manifest.extend_live(self.clock.now()) {
            Ok(0) => {}
            Ok(added) => tracing::trace!(added, "Live fragments generated"),
            Err(e) => tracing::warn!(error = %e, "Failed to extend live fragments"),
        }
    }

    async fn reselect(&mut self) -> NagareResult<()> {
        if self.rate.is_empty() {
            return Ok(());
        }

        let mut manifest = self.manifest.lock().await;
        let Some(primary) = manifest.primary_stream() else {
            return Ok(());
        };
        let measured = self.rate.current_rate();
        let index = self
            .selector
            .select(manifest.representations(primary)?, measured);
        if manifest.switch_representation(primary, index)? {
            tracing::debug!(
                measured,
                target = self.selector.target(measured),
                "Representation reselected"
            );
        }
        Ok(())
    }

    /// Pick the stream which is most behind and fetch its next fragment.
    async fn fetch_next(&mut self) -> NagareResult<Step> {
        let (request, primary, live, format) = {
            let mut manifest = self.manifest.lock().await;
            let live = manifest.is_live();

            let mut candidate: Option<FragmentRequest> = None;
            for id in manifest.active_streams() {
                if manifest.stream(id)?.is_end_of_period() {
                    continue;
                }
                match manifest.next_fragment(id)? {
                    NextFragment::Fragment(request) => {
                        if candidate
                            .as_ref()
                            .map_or(true, |c| request.timestamp < c.timestamp)
                        {
                            candidate = Some(request);
                        }
                    }
                    NextFragment::Exhausted if live => {}
                    NextFragment::Exhausted => {
                        tracing::debug!(stream = id, "Stream reached end of period");
                        manifest.mark_end_of_period(id)?;
                    }
                }
            }

            match candidate {
                Some(request) => {
                    let primary = manifest.primary_stream() == Some(request.stream);
                    (request, primary, live, manifest.format())
                }
                None if live => {
                    drop(manifest);
                    tracing::trace!("Waiting for new live fragments");
                    let wait = self
                        .update_interval()
                        .await
                        .unwrap_or_else(|| self.config.live_poll_duration())
                        .min(self.config.max_live_wait_duration());
                    return Ok(if self.sleep(wait).await {
                        Step::Continue
                    } else {
                        Step::Finished
                    });
                }
                None => return self.finish_period(&mut manifest),
            }
        };

        if live {
            let position = self.live_position(&request).await?;
            if !self.reconcile(&request, position).await? {
                return Ok(Step::Continue);
            }
        }

        let started = Instant::now();
        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Step::Finished),
            fetched = self.fetch_fragment(&request) => fetched,
        };

        match fetched {
            Ok(data) => {
                let elapsed = started.elapsed();
                self.policy.on_success();
                self.deliver(request, data, elapsed, primary, live, format)
                    .await?;
                Ok(Step::Continue)
            }
            Err(_) if self.cancel.is_cancelled() => Ok(Step::Finished),
            Err(e) => self.on_fetch_failure(request, e, live).await,
        }
    }

    /// Every stream is at the end of the current period.
    fn finish_period(&self, manifest: &mut Manifest) -> NagareResult<Step> {
        if manifest.has_next_period() {
            for id in manifest.active_streams() {
                if let Some(queue) = self.queues.get(id) {
                    queue.push(QueueItem::Event(ControlEvent::EndOfPeriod));
                }
            }
            manifest.advance_period();
            return Ok(Step::Continue);
        }

        for id in manifest.active_streams() {
            manifest.mark_end_of_stream(id)?;
        }
        for queue in self.queues.iter() {
            queue.push(QueueItem::Event(ControlEvent::EndOfStream));
        }
        tracing::info!("All streams finished");
        Ok(Step::Finished)
    }

    async fn live_position(&self, request: &FragmentRequest) -> NagareResult<LivePosition> {
        let manifest = self.manifest.lock().await;
        LiveTimingReconciler::check_position(
            &manifest,
            request.stream,
            request.fragment.start,
            self.clock.now(),
        )
    }

    /// Act on the live position of a fragment, returns whether it may be fetched now.
    async fn reconcile(
        &mut self,
        request: &FragmentRequest,
        position: LivePosition,
    ) -> NagareResult<bool> {
        match position {
            LivePosition::OnTime => Ok(true),
            LivePosition::Behind { edge } => {
                let (index, stalled) = {
                    let mut manifest = self.manifest.lock().await;
                    let index = manifest.jump_to(request.stream, edge)?;
                    let stalled = match manifest.next_fragment(request.stream)? {
                        NextFragment::Fragment(next) => matches!(
                            LiveTimingReconciler::check_position(
                                &manifest,
                                request.stream,
                                next.fragment.start,
                                self.clock.now(),
                            )?,
                            LivePosition::Behind { .. }
                        ),
                        NextFragment::Exhausted => false,
                    };
                    (index, stalled)
                };

                if stalled {
                    self.stall(request, edge).await?;
                } else {
                    tracing::info!(
                        stream = request.stream,
                        from = request.fragment.start,
                        edge,
                        index,
                        "Fell behind the live edge, skipping ahead"
                    );
                }
                Ok(false)
            }
            LivePosition::Ahead(ahead) => {
                let wait = ahead.min(self.config.max_live_wait_duration());
                tracing::debug!(
                    stream = request.stream,
                    ?ahead,
                    "Fragment not published yet, waiting"
                );
                self.sleep(wait).await;
                Ok(false)
            }
        }
    }

    /// No known fragment is inside the DVR window. Wait for a manifest update and spend the
    /// retry budget meanwhile.
    async fn stall(&mut self, request: &FragmentRequest, edge: u64) -> NagareResult<()> {
        tracing::warn!(
            stream = request.stream,
            edge,
            failures = self.policy.failures(),
            "Every known fragment is outside the DVR window, waiting for an update"
        );

        let action = {
            let mut manifest = self.manifest.lock().await;
            self.policy.on_failure(|| manifest.fail_over_base())
        };
        if matches!(action, Some(FailureAction::Fatal) | None) {
            tracing::error!(stream = request.stream, "Live stream stalled behind the DVR window");
            return Err(NagareError::ResourceNotFound(request.uri.to_string()));
        }

        let wait = self
            .update_interval()
            .await
            .unwrap_or_else(|| self.config.live_poll_duration())
            .min(self.config.max_live_wait_duration());
        self.sleep(wait).await;
        Ok(())
    }

    async fn fetch_fragment(&self, request: &FragmentRequest) -> NagareResult<(Option<Bytes>, Bytes)> {
        let header = match (&request.header_uri, request.needs_header) {
            (Some(header_uri), true) => Some(self.downloader.fetch(header_uri).await?),
            _ => None,
        };
        let payload = self.downloader.fetch(&request.uri).await?;
        Ok((header, payload))
    }

    async fn deliver(
        &mut self,
        request: FragmentRequest,
        (header, payload): (Option<Bytes>, Bytes),
        elapsed: Duration,
        primary: bool,
        live: bool,
        format: ManifestFormat,
    ) -> NagareResult<()> {
        let id = request.stream;
        let bytes = payload.len() + header.as_ref().map_or(0, Bytes::len);
        {
            let mut manifest = self.manifest.lock().await;
            manifest.advance(id)?;
            if live && format == ManifestFormat::SmoothStreaming {
                self.append_lookahead(&mut manifest, &request, &payload);
            }
        }

        if primary {
            self.rate.add_sample(bytes as u64, elapsed, request.duration);
        }

        let data = match header {
            Some(header) => {
                let mut data = BytesMut::with_capacity(bytes);
                data.extend_from_slice(&header);
                data.extend_from_slice(&payload);
                data.freeze()
            }
            None => payload,
        };

        tracing::debug!(
            stream = id,
            kind = %request.kind,
            sequence = request.fragment.number,
            timestamp = ?request.timestamp,
            bytes,
            ?elapsed,
            "Fragment downloaded"
        );
        if let Some(queue) = self.queues.get(id) {
            queue.push(QueueItem::Fragment(MediaFragment {
                data,
                timestamp: request.timestamp,
                duration: request.duration,
                sequence: request.fragment.number,
                new_header: request.needs_header,
                discont: request.discont,
                format: request.format,
            }));
        }
        Ok(())
    }

    fn append_lookahead(
        &self,
        manifest: &mut Manifest,
        request: &FragmentRequest,
        payload: &[u8],
    ) {
        let id = request.stream;
        let timing = match piff::parse_timing(payload) {
            Ok(timing) => timing,
            Err(e) => {
                tracing::warn!(stream = id, error = %e, "Invalid PIFF timing boxes");
                return;
            }
        };

        if let Some(current) = timing.current {
            if current.time != request.fragment.start {
                tracing::warn!(
                    stream = id,
                    manifest = request.fragment.start,
                    in_band = current.time,
                    "Fragment time differs from the manifest"
                );
            }
        }
        for entry in timing.next {
            if let Err(e) = manifest.append_fragment(id, entry.time, entry.duration) {
                tracing::warn!(stream = id, error = %e, "Failed to append fragment");
            }
        }
    }

    async fn on_fetch_failure(
        &mut self,
        request: FragmentRequest,
        error: NagareError,
        live: bool,
    ) -> NagareResult<Step> {
        tracing::warn!(
            stream = request.stream,
            uri = %request.uri,
            error = %error,
            failures = self.policy.failures(),
            "Fragment fetch failed"
        );

        if live {
            match self.live_position(&request).await? {
                LivePosition::OnTime => {}
                position => {
                    self.reconcile(&request, position).await?;
                    return Ok(Step::Continue);
                }
            }
        }

        let action = {
            let mut manifest = self.manifest.lock().await;
            self.policy.on_failure(|| manifest.fail_over_base())
        };
        match action {
            Some(FailureAction::Retry) => {
                if live {
                    // the fragment may just not be published yet
                    let wait = request.duration.min(self.config.max_live_wait_duration());
                    if !self.sleep(wait).await {
                        return Ok(Step::Finished);
                    }
                }
                Ok(Step::Continue)
            }
            Some(FailureAction::SwitchedBase) => {
                tracing::info!(stream = request.stream, "Retry budget spent, switched base url");
                Ok(Step::Continue)
            }
            Some(FailureAction::Fatal) | None => {
                tracing::error!(uri = %request.uri, error = %error, "Giving up on fragment");
                Err(NagareError::ResourceNotFound(request.uri.to_string()))
            }
        }
    }
}
