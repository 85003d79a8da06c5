use crate::queue::Offset;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message too small: {size} < {min}")]
    MessageTooSmall { size: usize, min: usize },

    #[error("message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("backpressure on queue [{queue}]: {reason}")]
    Backpressure { queue: String, reason: String },

    #[error("corrupt frame in queue [{queue}] at {offset}: {reason}")]
    CorruptFrame {
        queue: String,
        offset: Offset,
        reason: String,
    },

    #[error("end of queue")]
    Eof,

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid offset: {0}")]
    InvalidOffset(String),

    #[error("offset regression for [{key}]: {requested} < {committed}")]
    OffsetRegression {
        key: String,
        requested: Offset,
        committed: Offset,
    },

    #[error("decompress failed in queue [{queue}] at {offset}: {source}")]
    Decompress {
        queue: String,
        offset: Offset,
        source: std::io::Error,
    },

    #[error("cluster metadata [{0}] not ready")]
    MetadataNotReady(String),

    #[error("no active host for cluster [{0}]")]
    NoActiveHost(String),

    #[error("invalid bulk request: {0}")]
    InvalidBulkRequest(String),

    #[error("invalid bulk response: {0}")]
    InvalidBulkResponse(String),

    #[error("invalid cluster state: {0}")]
    InvalidClusterState(String),

    #[error("http error against [{host}]: {source}")]
    Http {
        host: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{0}")]
    Unsupported(&'static str),
}

impl Error {
    /// True for failures that resolve on their own: back off and retry
    /// without giving up the batch.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Backpressure { .. } | Error::Http { .. } | Error::Eof
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
