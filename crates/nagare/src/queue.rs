//! Per stream fragment queues shared by the download and the stream loop.
//!
//! The download loop is the only writer, the stream loop the only reader. A queue never
//! rejects data because it is full: the fill level is only consulted by the download loop to
//! decide whether to keep fetching.
use std::{
    collections::VecDeque,
    pin::pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::{manifest::StreamId, sink::StreamFormat};

#[derive(Debug, Clone)]
pub struct MediaFragment {
    /// Payload, prefixed by the initialization segment when `new_header` is set.
    pub data: Bytes,
    pub timestamp: Duration,
    pub duration: Duration,
    pub sequence: u64,
    pub new_header: bool,
    pub discont: bool,
    pub format: StreamFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    EndOfPeriod,
    EndOfStream,
}

#[derive(Debug, Clone)]
pub enum QueueItem {
    Fragment(MediaFragment),
    Event(ControlEvent),
}

impl QueueItem {
    /// Control events have no timestamp.
    pub fn timestamp(&self) -> Option<Duration> {
        match self {
            Self::Fragment(fragment) => Some(fragment.timestamp),
            Self::Event(_) => None,
        }
    }

    fn duration(&self) -> Duration {
        match self {
            Self::Fragment(fragment) => fragment.duration,
            Self::Event(_) => Duration::ZERO,
        }
    }
}

/// What sits at the front of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Head {
    Empty,
    Event,
    Fragment(Duration),
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    level: Duration,
    fragments: usize,
    flushing: bool,
}

#[derive(Debug)]
pub struct FragmentQueue {
    id: StreamId,
    state: Mutex<QueueState>,
    max_level: Duration,
    /// Shared by every queue of a set, signalled on push, pop and flush.
    signal: Arc<Notify>,
}

impl FragmentQueue {
    pub fn new(id: StreamId, max_level: Duration, signal: Arc<Notify>) -> Self {
        Self {
            id,
            state: Mutex::new(QueueState::default()),
            max_level,
            signal,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Append an item, returns `false` if the queue is flushing and the item was dropped.
    pub fn push(&self, item: QueueItem) -> bool {
        {
            let mut state = self.state();
            if state.flushing {
                return false;
            }
            state.level += item.duration();
            if matches!(item, QueueItem::Fragment(_)) {
                state.fragments += 1;
            }
            state.items.push_back(item);
        }
        self.signal.notify_waiters();
        true
    }

    pub fn try_pop(&self) -> Option<QueueItem> {
        let item = {
            let mut state = self.state();
            if state.flushing {
                return None;
            }
            let item = state.items.pop_front()?;
            state.level = state.level.saturating_sub(item.duration());
            if matches!(item, QueueItem::Fragment(_)) {
                state.fragments -= 1;
            }
            item
        };
        self.signal.notify_waiters();
        Some(item)
    }

    /// Wait for the next item, `None` once the queue is flushing.
    pub async fn pop(&self) -> Option<QueueItem> {
        loop {
            let mut notified = pin!(self.signal.notified());
            notified.as_mut().enable();

            if self.is_flushing() {
                return None;
            }
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            notified.await;
        }
    }

    pub fn head(&self) -> Head {
        match self.state().items.front() {
            None => Head::Empty,
            Some(QueueItem::Event(_)) => Head::Event,
            Some(QueueItem::Fragment(fragment)) => Head::Fragment(fragment.timestamp),
        }
    }

    /// Sum of the durations of the queued fragments.
    pub fn level_time(&self) -> Duration {
        self.state().level
    }

    pub fn is_full(&self) -> bool {
        self.level_time() >= self.max_level
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().items.is_empty()
    }

    pub fn fragment_count(&self) -> usize {
        self.state().fragments
    }

    /// Whether a control event is queued behind the fragments.
    pub fn has_event(&self) -> bool {
        self.state()
            .items
            .iter()
            .any(|item| matches!(item, QueueItem::Event(_)))
    }

    pub fn is_flushing(&self) -> bool {
        self.state().flushing
    }

    /// Start or stop flushing. Starting drops every queued item and wakes all waiters.
    pub fn set_flushing(&self, flushing: bool) {
        {
            let mut state = self.state();
            state.flushing = flushing;
            if flushing {
                state.items.clear();
                state.level = Duration::ZERO;
                state.fragments = 0;
            }
        }
        self.signal.notify_waiters();
    }
}

/// The queues of every stream of a demuxer.
#[derive(Debug, Clone)]
pub struct FragmentQueues {
    queues: Arc<[FragmentQueue]>,
    signal: Arc<Notify>,
}

impl FragmentQueues {
    pub fn new(count: usize, max_level: Duration) -> Self {
        let signal = Arc::new(Notify::new());
        let queues = (0..count)
            .map(|id| FragmentQueue::new(id, max_level, signal.clone()))
            .collect();
        Self { queues, signal }
    }

    pub fn get(&self, id: StreamId) -> Option<&FragmentQueue> {
        self.queues.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FragmentQueue> {
        self.queues.iter()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn set_flushing(&self, flushing: bool) {
        for queue in self.queues.iter() {
            queue.set_flushing(flushing);
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.queues.iter().any(FragmentQueue::is_flushing)
    }

    pub fn any_full(&self) -> bool {
        self.queues.iter().any(FragmentQueue::is_full)
    }

    /// Largest fill level over all queues.
    pub fn level_time(&self) -> Duration {
        self.queues
            .iter()
            .map(FragmentQueue::level_time)
            .max()
            .unwrap_or_default()
    }

    /// Wait until `ready` holds or the set starts flushing.
    ///
    /// Returns `false` when woken by a flush.
    pub async fn wait_until(&self, ready: impl Fn(&Self) -> bool) -> bool {
        loop {
            let mut notified = pin!(self.signal.notified());
            notified.as_mut().enable();

            if self.is_flushing() {
                return false;
            }
            if ready(self) {
                return true;
            }
            notified.await;
        }
    }

    /// Wait until every queue is below its maximum level.
    pub async fn wait_for_space(&self) -> bool {
        self.wait_until(|queues| !queues.any_full()).await
    }
}
