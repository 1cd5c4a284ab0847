mod sink;

use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use nagare::{AdaptiveDemux, DemuxConfig, HttpDownloader};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, ClientBuilder,
};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use url::Url;

use crate::sink::{stream_names, FileSink};

#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
/// Record a DASH or Smooth Streaming presentation, one file per stream
pub struct NagareArgs {
    /// Debug output
    #[clap(long, alias = "debug")]
    verbose: bool,

    /// Demuxer configuration in TOML format
    #[clap(short, long, env = "NAGARE_CONFIG")]
    config: Option<PathBuf>,

    /// Output directory
    #[clap(short, long, default_value = ".")]
    output: PathBuf,

    /// Upper bound of the selected bitrate in bits per second
    #[clap(long)]
    max_bitrate: Option<u64>,

    /// Share of the measured throughput spent on media bitrate
    #[clap(long)]
    bandwidth_usage: Option<f64>,

    /// Retry limit of a single fragment
    #[clap(long)]
    retries: Option<u32>,

    /// Seconds of media buffered per stream
    #[clap(long)]
    buffer: Option<f64>,

    /// Start position in seconds, ignored for live presentations
    #[clap(long)]
    start: Option<f64>,

    /// HTTP Header used to download
    ///
    /// Custom header. eg. "User-Agent: xxxxx".
    #[clap(short = 'H', long)]
    headers: Vec<String>,

    /// Manifest URL
    url: Url,
}

impl NagareArgs {
    fn config(&self) -> anyhow::Result<DemuxConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                toml::from_str(&data)?
            }
            None => DemuxConfig::default(),
        };

        if self.max_bitrate.is_some() {
            config = config.max_bitrate(self.max_bitrate);
        }
        if let Some(usage) = self.bandwidth_usage {
            config = config.bandwidth_usage(usage);
        }
        if let Some(retries) = self.retries {
            config = config.fragment_retries(retries);
        }
        if let Some(buffer) = self.buffer {
            config.max_buffering_time = buffer;
        }
        config.validate()?;
        Ok(config)
    }

    fn client(&self) -> anyhow::Result<Client> {
        let mut headers = HeaderMap::new();
        for header in &self.headers {
            let Some((key, value)) = header.split_once(':') else {
                bail!("Invalid header: {header}");
            };
            headers.insert(
                HeaderName::from_str(key.trim())?,
                HeaderValue::from_str(value.trim())?,
            );
        }

        Ok(ClientBuilder::new()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = NagareArgs::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    LevelFilter::DEBUG.into()
                } else {
                    LevelFilter::INFO.into()
                })
                .from_env_lossy(),
        )
        .init();

    let config = args.config()?;
    let downloader = HttpDownloader::new(args.client()?);
    let mut demux = AdaptiveDemux::open(args.url.clone(), downloader, config).await?;

    let names = stream_names(demux.manifest().lock().await.streams());
    tokio::fs::create_dir_all(&args.output).await?;

    if let Some(start) = args.start {
        if !start.is_finite() || start < 0. {
            bail!("Invalid start position: {start}");
        }
        if demux.is_live().await {
            tracing::warn!("Start position ignored for live presentations");
        } else {
            demux.seek(Duration::from_secs_f64(start)).await?;
        }
    }

    demux.start(FileSink::new(args.output.clone(), names)).await?;
    let finished = tokio::select! {
        result = demux.wait() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let (sink, error) = match finished {
        Some(Ok(sink)) => {
            tracing::info!("Recording finished");
            (Some(sink), None)
        }
        Some(Err(e)) => (demux.take_sink(), Some(e)),
        None => {
            tracing::info!("Interrupted, stopping");
            (demux.stop().await?, None)
        }
    };
    if let Some(mut sink) = sink {
        sink.flush().await?;
    }
    if let Some(e) = error {
        return Err(e.into());
    }

    Ok(())
}
