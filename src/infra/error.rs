use thiserror::Error;

use crate::application::backends::BackendError;

/// Failures while wiring up the process: sockets, signals, backends, logging.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("backend setup failed: {0}")]
    Backend(#[from] BackendError),
    #[error("cannot start telemetry: {0}")]
    Telemetry(String),
    #[error("bad configuration: {message}")]
    Configuration { message: String },
}

impl InfraError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
