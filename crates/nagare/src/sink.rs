//! Downstream side of the pipeline.
//!
//! The [StreamLoop](crate::stream::StreamLoop) hands every delivered item to a [FragmentSink]
//! as a [SinkEvent]. Per stream the order is always:
//!
//! ```text
//! StreamStart ─► Format ─► Data ─► Data ─► ... ─► Format ─► Data ─► ...
//! ```
//!
//! followed by a single [SinkEvent::EndOfStream] once every stream is drained.
use std::{future::Future, time::Duration};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    manifest::{StreamId, StreamKind},
    NagareError, NagareResult,
};

/// Input format of a stream, changes on representation switches.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFormat {
    pub kind: StreamKind,
    pub codec: Option<String>,
    pub codec_private: Option<Bytes>,
    pub mime_type: Option<String>,
    pub bitrate: u64,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub sampling_rate: Option<u32>,
    pub channels: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// Sent once per stream before its first data, `start` is the presentation time playback
    /// starts from.
    StreamStart {
        stream: StreamId,
        kind: StreamKind,
        start: Duration,
    },
    /// The following data of the stream starts with a new header and uses this format.
    Format {
        stream: StreamId,
        format: StreamFormat,
    },
    Data {
        stream: StreamId,
        data: Bytes,
        timestamp: Duration,
        duration: Duration,
        sequence: u64,
        discont: bool,
    },
    EndOfStream,
}

impl SinkEvent {
    pub fn stream(&self) -> Option<StreamId> {
        match self {
            Self::StreamStart { stream, .. }
            | Self::Format { stream, .. }
            | Self::Data { stream, .. } => Some(*stream),
            Self::EndOfStream => None,
        }
    }
}

pub trait FragmentSink: Send {
    /// Deliver one event downstream.
    ///
    /// An error means the consumer rejected the data of that stream.
    fn push(&mut self, event: SinkEvent) -> impl Future<Output = NagareResult<()>> + Send;
}

/// Forwards every event into an unbounded channel.
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl FragmentSink for ChannelSink {
    async fn push(&mut self, event: SinkEvent) -> NagareResult<()> {
        let stream = event.stream().unwrap_or_default();
        self.sender
            .send(event)
            .map_err(|_| NagareError::DownstreamRejected {
                stream,
                reason: "receiver closed".to_string(),
            })
    }
}
