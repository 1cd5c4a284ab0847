use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    path::PathBuf,
};

use nagare::{
    manifest::Stream, FragmentSink, NagareResult, SinkEvent, StreamFormat, StreamId, StreamKind,
};
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
};

/// Writes every stream into its own file below `output`.
pub struct FileSink {
    output: PathBuf,
    names: HashMap<StreamId, String>,
    formats: HashMap<StreamId, StreamFormat>,
    files: HashMap<StreamId, BufWriter<File>>,
}

impl FileSink {
    pub fn new(output: PathBuf, names: HashMap<StreamId, String>) -> Self {
        Self {
            output,
            names,
            formats: HashMap::new(),
            files: HashMap::new(),
        }
    }

    pub async fn flush(&mut self) -> NagareResult<()> {
        for file in self.files.values_mut() {
            file.flush().await?;
        }
        Ok(())
    }
}

impl FragmentSink for FileSink {
    async fn push(&mut self, event: SinkEvent) -> NagareResult<()> {
        match event {
            SinkEvent::StreamStart {
                stream,
                kind,
                start,
            } => {
                tracing::info!(stream, %kind, ?start, "Stream started");
            }
            SinkEvent::Format { stream, format } => {
                tracing::info!(
                    stream,
                    bitrate = format.bitrate,
                    codec = ?format.codec,
                    width = ?format.width,
                    height = ?format.height,
                    "Stream format"
                );
                self.formats.insert(stream, format);
            }
            SinkEvent::Data {
                stream,
                data,
                sequence,
                discont,
                ..
            } => {
                if discont {
                    tracing::debug!(stream, sequence, "Discontinuity");
                }
                let file = match self.files.entry(stream) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let name = self
                            .names
                            .get(&stream)
                            .cloned()
                            .unwrap_or_else(|| format!("stream{stream}"));
                        let extension = self.formats.get(&stream).map_or("mp4", extension);
                        let path = self.output.join(format!("{name}.{extension}"));
                        tracing::info!(stream, path = %path.display(), "Writing stream");
                        entry.insert(BufWriter::new(File::create(&path).await?))
                    }
                };
                file.write_all(&data).await?;
            }
            SinkEvent::EndOfStream => self.flush().await?,
        }
        Ok(())
    }
}

fn extension(format: &StreamFormat) -> &'static str {
    match (format.mime_type.as_deref(), format.kind) {
        (Some("video/mp4"), _) => "mp4",
        (Some("audio/mp4"), _) => "m4a",
        (Some("text/vtt"), _) => "vtt",
        (Some("application/ttml+xml"), _) => "ttml",
        (_, StreamKind::Video) => "ismv",
        (_, StreamKind::Audio) => "isma",
        (_, StreamKind::Text) => "ismt",
    }
}

/// File names of the streams: their name, or their kind, followed by their language.
pub fn stream_names(streams: &[Stream]) -> HashMap<StreamId, String> {
    let mut taken = HashSet::new();
    streams
        .iter()
        .map(|stream| {
            let mut name = stream.name().unwrap_or(stream.kind().as_str()).to_string();
            if let Some(lang) = stream.lang() {
                name = format!("{name}.{lang}");
            }
            if !taken.insert(name.clone()) {
                name = format!("{name}.{}", stream.id());
                taken.insert(name.clone());
            }
            (stream.id(), name)
        })
        .collect()
}
