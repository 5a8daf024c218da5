use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid participant: {0}")]
    InvalidParticipant(String),

    #[error("Slaves cannot enslave other instances")]
    AlreadySlave,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Remote rejected {call}: {reason}")]
    Rejected { call: &'static str, reason: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Scanner error: {0}")]
    Scanner(#[from] swarmscan_scanner::ScanError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
