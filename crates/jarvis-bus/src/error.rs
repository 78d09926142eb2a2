use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("connect error: {0}")]
    Connect(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("request timed out")]
    Timeout,

    #[error("bus client closed")]
    Closed,
}

impl From<std::io::Error> for BusError {
    fn from(e: std::io::Error) -> Self {
        BusError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Encode(e.to_string())
    }
}
