use thiserror::Error;

/// Main error type for the Tunewright system
#[derive(Error, Debug)]
pub enum TuneError {
    #[error("Measurement error: {0}")]
    Measurement(#[from] MeasurementError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecError),

    #[error("Statistics error: {0}")]
    Stats(#[from] StatsError),

    #[error("Interrupted: {completed} job(s) finished before cancellation")]
    Interrupted { completed: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown tunable: {name}")]
    UnknownTunable { name: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl TuneError {
    /// Whether this error ends the whole tuning session rather than the
    /// single task that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TuneError::Interrupted { .. } | TuneError::Measurement(MeasurementError::Parse { .. })
        )
    }
}

/// Errors raised while turning a program run into a measurement
#[derive(Error, Debug)]
pub enum MeasurementError {
    #[error("Program exited with code {code:?}")]
    ProcessFailed { code: Option<i32> },

    #[error("Malformed program output: {message}")]
    Parse { message: String },

    #[error("Program output has no record for metric {metric}")]
    MissingMetric { metric: String },

    #[error("Program exceeded its {limit:.3}s time limit")]
    TimedOut { limit: f64 },
}

/// Job executor errors
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to spawn {label}: {source}")]
    Spawn {
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write private configuration for {label}: {source}")]
    ConfigFile {
        label: String,
        #[source]
        source: std::io::Error,
    },
}

/// Results engine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("No samples recorded for {side}")]
    Empty { side: String },

    #[error("No fitted distribution for metric {metric} at n={n}")]
    NoDistribution { metric: String, n: u64 },
}

/// Result type alias for Tunewright operations
pub type TuneResult<T> = Result<T, TuneError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Config(format!($($arg)*))
    };
}
