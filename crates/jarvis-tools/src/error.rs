use thiserror::Error;

/// Safety-gate rejections.  These surface to the model as error tool results
/// and are always audited before the caller sees them.
#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("path outside sandbox: {0}")]
    PathOutsideSandbox(String),

    #[error("path blocked: {0}")]
    PathDenied(String),

    #[error("write blocked: {0}")]
    WriteDenied(String),

    #[error("url blocked: {0}")]
    UrlBlocked(String),

    #[error("command blocked: {0}")]
    CommandBlocked(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
