use analysis_common::pgqueue;
use analysis_common::registry;
use thiserror::Error;

/// Enumeration of errors that can interrupt a worker loop iteration.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a queue error occurred while processing a job")]
    QueueError(#[from] pgqueue::QueueError),
    #[error("a registry error occurred while claiming a job")]
    RegistryError(#[from] registry::RegistryError),
}

/// Enumeration of configuration errors caught at load time.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{option} must be within {min}..={max}, got {value}")]
    OutOfRange {
        option: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },
    #[error("retry_cap_seconds ({cap}) cannot be below retry_base_seconds ({base})")]
    RetryCapBelowBase { base: u64, cap: u64 },
}
