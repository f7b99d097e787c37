use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScrubError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("range exceeds coverage in {0}")]
    OutOfRange(&'static str),
    #[error("block mapping failed: {0}")]
    Map(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Scrub was cancelled by request (not a real error).
    #[error("scrub cancelled")]
    Cancelled,
}
