use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Resource misuse: {0}")]
    ResourceMisuse(String),

    #[error("Scheduling error: {0}")]
    Scheduling(String),

    #[error("Mismatched replication count: expected {expected}, found {found}")]
    MismatchedReplicationCount { expected: usize, found: usize },

    #[error("Simulation error: {0}")]
    Simulation(String),
}

impl SimError {
    /// Errors that abort a single replication rather than the whole program.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            SimError::ResourceMisuse(_) | SimError::Scheduling(_) | SimError::Simulation(_)
        )
    }
}

pub type SimResult<T> = Result<T, SimError>;
