pub mod config;
pub mod demux;
pub mod download;
pub mod downloader;
pub mod error;
pub mod live;
pub mod manifest;
pub mod piff;
pub mod queue;
pub mod rate;
pub mod selector;
pub mod sink;
pub mod stream;

pub use config::DemuxConfig;
pub use demux::AdaptiveDemux;
pub use downloader::{Downloader, HttpDownloader};
pub use error::{NagareError, NagareResult};
pub use manifest::{Manifest, ManifestFormat, StreamId, StreamKind};
pub use sink::{ChannelSink, FragmentSink, SinkEvent, StreamFormat};

// ┌──────────────────┐ fetch  ┌──────────────────┐  push   ┌────────────────────┐
// │                  ◄────────┤                  ├─────────►  FragmentQueue #0  ├──┐
// │    Downloader    │        │   DownloadLoop   │         ├────────────────────┤  │
// │                  ├────────►                  ├─────────►  FragmentQueue #1  ├──┤
// └──────────────────┘        └───┬──────────▲───┘         ├────────────────────┤  │
//                                 │          │             │        ...         ├──┤
//                      rate sample│          │select       └────────────────────┘  │
//                                 │          │                                     │
//                         ┌───────▼──────────┴───────┐        ┌────────────────┐   │
//                         │ RateTracker + Selector   │        │   StreamLoop   ◄───┘
//                         └──────────────────────────┘        └───────┬────────┘
//                                                                     │ SinkEvent
//                                                             ┌───────▼────────┐
//                                                             │  FragmentSink  │
//                                                             └────────────────┘
