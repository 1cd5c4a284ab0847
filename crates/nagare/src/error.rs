use thiserror::Error;

#[derive(Error, Debug)]
pub enum NagareError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error("Fetch aborted")]
    Aborted,

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    HexDecodeError(#[from] hex::FromHexError),

    // Manifest errors
    #[error("Invalid manifest: {0}")]
    ManifestParse(String),

    #[error(transparent)]
    MpdParseError(#[from] dash_mpd::DashMpdError),

    #[error(transparent)]
    XmlError(#[from] quick_xml::Error),

    #[error(transparent)]
    XmlAttrError(#[from] quick_xml::events::attributes::AttrError),

    #[error("Can not realign manifest after refresh: {0}")]
    Alignment(String),

    #[error("Unknown stream: {0}")]
    UnknownStream(usize),

    #[error(transparent)]
    OutOfRange(#[from] chrono::OutOfRangeError),

    #[error("Invalid timing schema: {0:?}")]
    InvalidTimingSchema(String),

    #[error("Invalid box: {0}")]
    InvalidBox(String),

    // Pipeline errors
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Downstream rejected data of stream {stream}: {reason}")]
    DownstreamRejected { stream: usize, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Demuxer is not started")]
    NotStarted,

    #[error(transparent)]
    JoinError(#[from] tokio::task::JoinError),
}

pub type NagareResult<T> = Result<T, NagareError>;
