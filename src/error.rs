use crate::speedtest::TestPhase;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpeedTestError {
    #[error("server discovery failed after trying {attempts} endpoints: {last_error}")]
    Discovery { attempts: usize, last_error: String },

    #[error("no usable server: {0}")]
    NoUsableServer(String),

    #[error("latency probe to {url} timed out")]
    ProbeTimeout { url: String },

    #[error("latency probe to {url} failed: {reason}")]
    ProbeFailed { url: String, reason: String },

    #[error("{phase} transfer failed: {reason}")]
    Transfer { phase: TestPhase, reason: String },

    #[error("result submission failed: {0}")]
    ResultSubmission(String),

    #[error("test aborted")]
    Aborted,

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, SpeedTestError>;
