//! The consumer side of the pipeline: drains the fragment queues into a [FragmentSink].
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
    manifest::StreamId,
    queue::{ControlEvent, FragmentQueues, Head, MediaFragment, QueueItem},
    sink::{FragmentSink, SinkEvent},
    NagareResult,
};

/// Presentation timestamp of the last fragment pushed for the primary stream.
#[derive(Debug, Clone, Default)]
pub struct PlaybackPosition(Arc<Mutex<Option<Duration>>>);

impl PlaybackPosition {
    pub fn get(&self) -> Option<Duration> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, position: Duration) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(position);
    }
}

#[derive(Debug, Default)]
struct OutputState {
    started: bool,
    ended: bool,
    /// Start announced by the next stream start marker instead of the first timestamp.
    pending_start: Option<Duration>,
}

pub struct StreamLoop<S> {
    queues: FragmentQueues,
    sink: S,
    states: Vec<OutputState>,
    primary: Option<StreamId>,
    /// Streams which must fill their pre-roll before anything is pushed.
    active: Vec<StreamId>,
    fragments_cache: usize,
    position: PlaybackPosition,
    cancel: CancellationToken,
}

impl<S: FragmentSink> StreamLoop<S> {
    pub fn new(
        queues: FragmentQueues,
        sink: S,
        primary: Option<StreamId>,
        active: Vec<StreamId>,
        cancel: CancellationToken,
    ) -> Self {
        let states = queues.iter().map(|_| OutputState::default()).collect();
        Self {
            queues,
            sink,
            states,
            primary,
            active,
            fragments_cache: 0,
            position: PlaybackPosition::default(),
            cancel,
        }
    }

    pub fn fragments_cache(mut self, fragments_cache: usize) -> Self {
        self.fragments_cache = fragments_cache;
        self
    }

    /// Announce `start` in the first stream start marker of every stream.
    pub fn start_at(mut self, start: Option<Duration>) -> Self {
        for state in self.states.iter_mut() {
            state.pending_start = start;
        }
        self
    }

    pub fn position(mut self, position: PlaybackPosition) -> Self {
        self.position = position;
        self
    }

    /// Push queued data downstream until every stream ended.
    ///
    /// Cancellation and queue flushes stop the loop early and hand the sink back as well.
    pub async fn run(mut self) -> NagareResult<S> {
        if !Self::preroll(
            &self.queues,
            &self.active,
            self.fragments_cache,
            &self.cancel,
        )
        .await
        {
            return Ok(self.sink);
        }

        loop {
            let states = &self.states;
            let ready = tokio::select! {
                _ = self.cancel.cancelled() => false,
                ready = self.queues.wait_until(|queues| {
                    queues
                        .iter()
                        .any(|queue| !states[queue.id()].ended && !queue.is_empty())
                }) => ready,
            };
            if !ready {
                return Ok(self.sink);
            }

            let Some(id) = self.pick() else {
                continue;
            };
            let Some(item) = self.queues.get(id).and_then(|queue| queue.try_pop()) else {
                continue;
            };

            match item {
                QueueItem::Fragment(fragment) => self.push_fragment(id, fragment).await?,
                QueueItem::Event(ControlEvent::EndOfPeriod) => {
                    tracing::debug!(stream = id, "End of period");
                    self.states[id].started = false;
                }
                QueueItem::Event(ControlEvent::EndOfStream) => {
                    tracing::debug!(stream = id, "End of stream");
                    self.states[id].ended = true;
                    if self.states.iter().all(|state| state.ended) {
                        self.sink.push(SinkEvent::EndOfStream).await?;
                        tracing::info!("Every stream drained");
                        return Ok(self.sink);
                    }
                }
            }
        }
    }

    /// Wait until every active stream buffered enough fragments.
    ///
    /// Only borrows the queues so the sink is never held across the wait.
    async fn preroll(
        queues: &FragmentQueues,
        active: &[StreamId],
        cache: usize,
        cancel: &CancellationToken,
    ) -> bool {
        if cache == 0 {
            return true;
        }

        tokio::select! {
            _ = cancel.cancelled() => false,
            ready = queues.wait_until(|queues| {
                active.iter().filter_map(|id| queues.get(*id)).all(|queue| {
                    queue.fragment_count() >= cache || queue.has_event() || queue.is_full()
                })
            }) => {
                tracing::debug!(fragments = cache, "Pre-roll complete");
                ready
            }
        }
    }

    /// Control events go first, then the stream with the oldest fragment.
    fn pick(&self) -> Option<StreamId> {
        let mut oldest: Option<(Duration, StreamId)> = None;
        for queue in self.queues.iter() {
            if self.states[queue.id()].ended {
                continue;
            }
            match queue.head() {
                Head::Empty => {}
                Head::Event => return Some(queue.id()),
                Head::Fragment(timestamp) => {
                    if oldest.map_or(true, |(oldest, _)| timestamp < oldest) {
                        oldest = Some((timestamp, queue.id()));
                    }
                }
            }
        }
        oldest.map(|(_, id)| id)
    }

    async fn push_fragment(&mut self, id: StreamId, fragment: MediaFragment) -> NagareResult<()> {
        let state = &mut self.states[id];
        if !state.started {
            state.started = true;
            let start = state.pending_start.take().unwrap_or(fragment.timestamp);
            self.emit(
                id,
                SinkEvent::StreamStart {
                    stream: id,
                    kind: fragment.format.kind,
                    start,
                },
            )
            .await?;
        }

        if fragment.new_header {
            self.emit(
                id,
                SinkEvent::Format {
                    stream: id,
                    format: fragment.format,
                },
            )
            .await?;
        }

        let timestamp = fragment.timestamp;
        self.emit(
            id,
            SinkEvent::Data {
                stream: id,
                data: fragment.data,
                timestamp,
                duration: fragment.duration,
                sequence: fragment.sequence,
                discont: fragment.discont,
            },
        )
        .await?;

        if self.primary == Some(id) {
            self.position.set(timestamp);
        }
        Ok(())
    }

    /// Only a rejection on the primary stream stops the loop.
    async fn emit(&mut self, id: StreamId, event: SinkEvent) -> NagareResult<()> {
        match self.sink.push(event).await {
            Ok(()) => Ok(()),
            Err(e) if self.primary == Some(id) => {
                tracing::error!(stream = id, error = %e, "Primary stream rejected by downstream");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(stream = id, error = %e, "Downstream rejected data");
                Ok(())
            }
        }
    }
}
