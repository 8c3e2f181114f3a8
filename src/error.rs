use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    /// The capture file or device could not be opened. Fatal to the session.
    #[error("Capture source unavailable: {0}")]
    SourceUnavailable(String),

    /// A container header or a single frame could not be parsed.
    #[error("Malformed capture: {0}")]
    MalformedCapture(String),

    /// The live device went away while the session was reading from it.
    #[error("Capture interrupted: {0}")]
    CaptureInterrupted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<config::ConfigError> for FlowError {
    fn from(err: config::ConfigError) -> Self {
        FlowError::Config(err.to_string())
    }
}

impl From<ctrlc::Error> for FlowError {
    fn from(err: ctrlc::Error) -> Self {
        FlowError::Config(err.to_string())
    }
}

impl FlowError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        FlowError::MalformedCapture(msg.into())
    }

    /// Per-frame errors are skipped and counted; everything else ends the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FlowError::MalformedCapture(_))
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
